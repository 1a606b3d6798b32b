//! Remote task supervision.
//!
//! The [`TaskSupervisor`] launches one remote unit, then runs a lifecycle
//! poller and a [`LogTailer`] side by side until the unit stops or the launch
//! path's ceiling passes.

mod log_tailer;
mod state;
mod task_supervisor;

pub use log_tailer::{LogCursor, LogTailer};
pub use state::SupervisionState;
pub use task_supervisor::{REMOTE_LOG_TARGET, RemoteTaskHandle, SupervisorConfig, TaskSupervisor};
