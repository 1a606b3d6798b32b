//! Boundary to the remote compute platform.
//!
//! A platform launches one remote unit per file, reports its lifecycle,
//! terminates it on request and serves its log sink page by page. Two
//! implementations ship with the crate:
//! - [`LocalProcessPlatform`] runs each remote unit as a local child process
//! - [`InMemoryPlatform`] replays scripted lifecycles, for tests and dry runs

mod local;
mod memory;

pub use local::{LocalPlatformConfig, LocalProcessPlatform, TaskDefinition};
pub use memory::{InMemoryPlatform, PollStep, TaskScript};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{FileReference, LaunchPath, SizeTier};

/// Everything the platform needs to start one remote unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub tier: SizeTier,
    /// Pre-provisioned task definition selected by the tier.
    pub task_definition_key: String,
    pub launch_path: LaunchPath,
    pub file: FileReference,
    /// Caller-supplied id propagated to the remote unit (usually the run key).
    pub correlation_id: String,
}

/// A successfully launched remote unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedTask {
    pub task_id: String,
    pub log_sink: LogSinkRef,
}

/// Opaque reference to the log sink a remote unit writes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogSinkRef(String);

impl LogSinkRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LogSinkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform-reported lifecycle of a remote unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Provisioning,
    Pending,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        }
    }

    /// The unit has not started executing yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Provisioning | Self::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleReport {
    pub state: LifecycleState,
    /// Only meaningful once `state` is terminal.
    pub exit_code: Option<i32>,
    pub stop_reason: Option<String>,
}

impl LifecycleReport {
    pub fn new(state: LifecycleState) -> Self {
        Self {
            state,
            exit_code: None,
            stop_reason: None,
        }
    }

    pub fn stopped(exit_code: Option<i32>) -> Self {
        Self {
            state: LifecycleState::Stopped,
            exit_code,
            stop_reason: None,
        }
    }

    pub fn with_stop_reason(mut self, reason: impl Into<String>) -> Self {
        self.stop_reason = Some(reason.into());
        self
    }
}

/// One page of log lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogPage {
    pub lines: Vec<String>,
    /// Continuation token for the next read. `None` leaves the caller's token
    /// unchanged.
    pub next_token: Option<String>,
}

/// The platform refused to start a remote unit. Fatal for the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("no task definition is mapped to tier {0}")]
    UnmappedTier(SizeTier),

    #[error("task definition '{key}' for tier {tier} is not registered")]
    NoTaskDefinition { tier: SizeTier, key: String },

    #[error("placement failed: {0}")]
    Placement(String),

    #[error("launch rejected: {0}")]
    Rejected(String),
}

/// Failure talking to the platform after launch. Always transient from the
/// supervisor's point of view.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("log sink {0} does not exist yet")]
    SinkNotFound(String),

    #[error("task {0} is unknown to the platform")]
    TaskNotFound(String),

    #[error("invalid log cursor '{0}'")]
    InvalidCursor(String),

    #[error("transient platform failure: {0}")]
    Transient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability to run and observe remote units.
#[async_trait]
pub trait ComputePlatform: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedTask, LaunchError>;

    async fn poll_lifecycle(&self, task_id: &str) -> Result<LifecycleReport, PlatformError>;

    /// Ask the platform to stop a unit. Stopping an already stopped unit is a
    /// no-op.
    async fn terminate(&self, task_id: &str) -> Result<(), PlatformError>;

    /// Read the lines written after `token` (from the start when `None`).
    async fn read_logs(
        &self,
        sink: &LogSinkRef,
        token: Option<&str>,
    ) -> Result<LogPage, PlatformError>;

    /// Drop any bookkeeping for a unit whose outcome has been produced.
    async fn release(&self, _task_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_classification() {
        assert!(LifecycleState::Provisioning.is_pending());
        assert!(LifecycleState::Pending.is_pending());
        assert!(!LifecycleState::Running.is_pending());
        assert!(!LifecycleState::Stopping.is_terminal());
        assert!(LifecycleState::Stopped.is_terminal());
    }

    #[test]
    fn test_stopped_report() {
        let report = LifecycleReport::stopped(Some(137)).with_stop_reason("terminated");
        assert!(report.state.is_terminal());
        assert_eq!(report.exit_code, Some(137));
        assert_eq!(report.stop_reason.as_deref(), Some("terminated"));
    }
}
