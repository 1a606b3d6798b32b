//! Boundary to the workflow scheduler that turns dispatch requests into runs.

mod local;
mod memory;
mod store;

pub use local::{LocalRunScheduler, LocalSchedulerConfig, RunRecord, RunState};
pub use memory::RecordingScheduler;
pub use store::{RunStore, StoredRun, StoredRunState};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::DispatchRequest;

/// Result of a successful hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new run was created.
    Scheduled,
    /// A run with the same run key already exists.
    AlreadyScheduled,
}

/// The scheduler did not take ownership of a request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("scheduler rejected run {run_key}: {reason}")]
    Rejected { run_key: String, reason: String },

    #[error("scheduler is saturated ({pending} pending runs, limit {limit})")]
    Saturated { pending: usize, limit: usize },

    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Accepts dispatch requests. Submitting the same run key twice must not
/// create a second run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunScheduler: Send + Sync {
    async fn submit(&self, request: &DispatchRequest) -> Result<SubmitOutcome, HandoffError>;
}
