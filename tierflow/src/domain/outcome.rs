//! Terminal results of supervised remote tasks.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::dispatch::LaunchPath;
use super::file_ref::FileReference;
use super::size_tier::SizeTier;

/// How a supervised task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failure,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        }
    }

    /// Maps a terminal exit code. A missing code is never a success.
    pub fn from_exit_code(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(0) => Self::Success,
            _ => Self::Failure,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one supervised task. Produced exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub tier: SizeTier,
    #[serde(rename = "elapsed_secs", with = "duration_secs")]
    pub elapsed: Duration,
    pub file: FileReference,
    pub task_id: String,
    pub launch_path: LaunchPath,
    pub correlation_id: String,
    /// Total number of remote log lines emitted.
    pub log_lines: u64,
    /// The most recent remote log lines.
    pub log_tail: Vec<String>,
    /// Last remote line that reported an error.
    pub error_detail: Option<String>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    /// One-line human summary, used for failure messages.
    pub fn summary(&self) -> String {
        match self.status {
            TaskStatus::Success => format!(
                "task {} succeeded in {:.1}s",
                self.task_id,
                self.elapsed.as_secs_f64()
            ),
            TaskStatus::Failure => {
                let code = self
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string());
                let detail = self
                    .error_detail
                    .as_deref()
                    .unwrap_or("see remote logs for details");
                format!("task {} failed (exit code {code}): {detail}", self.task_id)
            }
            TaskStatus::Timeout => format!(
                "task {} timed out after {:.1}s",
                self.task_id,
                self.elapsed.as_secs_f64()
            ),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: TaskStatus, exit_code: Option<i32>) -> TaskOutcome {
        TaskOutcome {
            status,
            exit_code,
            tier: SizeTier::Medium,
            elapsed: Duration::from_millis(1500),
            file: FileReference::new("b", "k", 1, "e"),
            task_id: "task-1".to_string(),
            launch_path: LaunchPath::Container,
            correlation_id: "run-1".to_string(),
            log_lines: 0,
            log_tail: Vec::new(),
            error_detail: None,
        }
    }

    #[test]
    fn test_status_from_exit_code() {
        assert_eq!(TaskStatus::from_exit_code(Some(0)), TaskStatus::Success);
        assert_eq!(TaskStatus::from_exit_code(Some(137)), TaskStatus::Failure);
        assert_eq!(TaskStatus::from_exit_code(None), TaskStatus::Failure);
    }

    #[test]
    fn test_summary() {
        let mut failed = outcome(TaskStatus::Failure, Some(2));
        failed.error_detail = Some("[ERROR] bad header".to_string());
        assert_eq!(
            failed.summary(),
            "task task-1 failed (exit code 2): [ERROR] bad header"
        );
        assert!(outcome(TaskStatus::Timeout, None).summary().contains("timed out"));
    }

    #[test]
    fn test_json_shape() {
        let value = serde_json::to_value(outcome(TaskStatus::Success, Some(0))).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["elapsed_secs"], 1.5);
        assert_eq!(value["launch_path"], "container");
    }
}
