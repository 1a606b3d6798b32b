//! Launch and supervise one remote task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::log_tailer::{LogCursor, LogTailer};
use super::state::SupervisionState;
use crate::domain::{
    DispatchRequest, FileReference, LaunchPath, LaunchRouting, SizeTier, TaskOutcome, TaskStatus,
};
use crate::platform::{ComputePlatform, LaunchError, LaunchRequest, LifecycleReport, LogSinkRef};
use crate::{Error, Result};

/// Target for remote log lines re-emitted by the supervisor.
pub const REMOTE_LOG_TARGET: &str = "tierflow::remote";

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Lifecycle poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Log poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub log_poll_interval_ms: u64,

    /// Ceiling for units on the function path.
    #[serde(default = "default_function_timeout_secs")]
    pub function_timeout_secs: u64,

    /// Ceiling for units on the container path.
    #[serde(default = "default_container_timeout_secs")]
    pub container_timeout_secs: u64,

    /// Task-definition key per tier.
    #[serde(default = "default_tier_task_definitions")]
    pub tier_task_definitions: BTreeMap<SizeTier, String>,

    /// Number of trailing remote log lines kept on the outcome.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_function_timeout_secs() -> u64 {
    300
}

fn default_container_timeout_secs() -> u64 {
    900
}

fn default_tier_task_definitions() -> BTreeMap<SizeTier, String> {
    SizeTier::ALL
        .iter()
        .map(|tier| (*tier, format!("file-processor-{tier}")))
        .collect()
}

fn default_log_tail_lines() -> usize {
    200
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            log_poll_interval_ms: default_poll_interval_ms(),
            function_timeout_secs: default_function_timeout_secs(),
            container_timeout_secs: default_container_timeout_secs(),
            tier_task_definitions: default_tier_task_definitions(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms)
    }

    pub fn timeout_for(&self, path: LaunchPath) -> Duration {
        match path {
            LaunchPath::Function => Duration::from_secs(self.function_timeout_secs),
            LaunchPath::Container => Duration::from_secs(self.container_timeout_secs),
        }
    }

    pub fn task_definition_for(&self, tier: SizeTier) -> std::result::Result<&str, LaunchError> {
        self.tier_task_definitions
            .get(&tier)
            .map(String::as_str)
            .ok_or(LaunchError::UnmappedTier(tier))
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 || self.log_poll_interval_ms == 0 {
            return Err(Error::config("supervisor poll intervals must be non-zero"));
        }
        if self.function_timeout_secs == 0 || self.container_timeout_secs == 0 {
            return Err(Error::config("supervisor timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// Ownership link to one in-flight remote unit.
///
/// Consumed by [`TaskSupervisor::supervise`], so a handle cannot be observed
/// after its outcome exists.
#[derive(Debug)]
pub struct RemoteTaskHandle {
    pub task_id: String,
    pub launched_at: DateTime<Utc>,
    pub launch_path: LaunchPath,
    pub tier: SizeTier,
    pub file: FileReference,
    pub log_sink: LogSinkRef,
    pub correlation_id: String,
    started: Instant,
}

/// Collects remote lines: re-emits them, counts them, keeps a bounded tail.
#[derive(Debug)]
struct LogCollector {
    task_id: String,
    capacity: usize,
    tail: VecDeque<String>,
    total: u64,
    error_detail: Option<String>,
}

impl LogCollector {
    fn new(task_id: &str, capacity: usize) -> Self {
        Self {
            task_id: task_id.to_string(),
            capacity,
            tail: VecDeque::with_capacity(capacity.min(1024)),
            total: 0,
            error_detail: None,
        }
    }

    fn extend(&mut self, lines: Vec<String>) {
        for line in lines {
            info!(target: REMOTE_LOG_TARGET, task_id = %self.task_id, "{}", line);
            self.total += 1;
            if line.contains("ERROR") {
                self.error_detail = Some(line.clone());
            }
            if self.capacity == 0 {
                continue;
            }
            if self.tail.len() == self.capacity {
                self.tail.pop_front();
            }
            self.tail.push_back(line);
        }
    }
}

/// Launches remote units and turns each into exactly one [`TaskOutcome`].
pub struct TaskSupervisor {
    platform: Arc<dyn ComputePlatform>,
    tailer: LogTailer,
    config: SupervisorConfig,
    routing: LaunchRouting,
}

impl TaskSupervisor {
    pub fn new(
        platform: Arc<dyn ComputePlatform>,
        config: SupervisorConfig,
        routing: LaunchRouting,
    ) -> Self {
        Self {
            tailer: LogTailer::new(platform.clone()),
            platform,
            config,
            routing,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launch a unit for `file`, routed by `tier`. Launch errors are not retried.
    pub async fn launch(
        &self,
        file: FileReference,
        tier: SizeTier,
        correlation_id: &str,
    ) -> std::result::Result<RemoteTaskHandle, LaunchError> {
        let path = self.routing.path_for(tier);
        self.launch_on(file, tier, path, correlation_id).await
    }

    /// Launch a unit on an explicit launch path.
    pub async fn launch_on(
        &self,
        file: FileReference,
        tier: SizeTier,
        launch_path: LaunchPath,
        correlation_id: &str,
    ) -> std::result::Result<RemoteTaskHandle, LaunchError> {
        let task_definition_key = self.config.task_definition_for(tier)?.to_string();
        let request = LaunchRequest {
            tier,
            task_definition_key,
            launch_path,
            file,
            correlation_id: correlation_id.to_string(),
        };

        let launched = self.platform.launch(&request).await.map_err(|e| {
            warn!(
                file = %request.file,
                tier = %tier,
                error = %e,
                "Failed to launch remote task"
            );
            e
        })?;

        info!(
            task_id = %launched.task_id,
            file = %request.file,
            tier = %tier,
            launch_path = %launch_path,
            correlation_id = %correlation_id,
            "Launched remote task"
        );

        Ok(RemoteTaskHandle {
            task_id: launched.task_id,
            launched_at: Utc::now(),
            launch_path,
            tier,
            file: request.file,
            log_sink: launched.log_sink,
            correlation_id: request.correlation_id,
            started: Instant::now(),
        })
    }

    /// Launch and supervise in one step.
    pub async fn run(
        &self,
        file: FileReference,
        tier: SizeTier,
        correlation_id: &str,
    ) -> std::result::Result<TaskOutcome, LaunchError> {
        let handle = self.launch(file, tier, correlation_id).await?;
        Ok(self.supervise(handle).await)
    }

    /// Run the unit described by a dispatch request, correlated by its run key.
    pub async fn run_request(
        &self,
        request: &DispatchRequest,
    ) -> std::result::Result<TaskOutcome, LaunchError> {
        let handle = self
            .launch_on(
                request.file.clone(),
                request.tier,
                request.launch_path,
                &request.run_key,
            )
            .await?;
        Ok(self.supervise(handle).await)
    }

    /// Poll and tail the unit until it stops or its ceiling passes.
    pub async fn supervise(&self, handle: RemoteTaskHandle) -> TaskOutcome {
        let ceiling = self.config.timeout_for(handle.launch_path);
        let deadline = handle.started + ceiling;
        let (state_tx, state_rx) = watch::channel(SupervisionState::Launching);
        let stop_tailing = CancellationToken::new();

        let poller = async {
            let result =
                tokio::time::timeout_at(deadline, self.poll_until_terminal(&handle, &state_tx))
                    .await;
            stop_tailing.cancel();
            result.ok()
        };
        let tail = self.tail_while_running(&handle, state_rx, stop_tailing.clone());

        let (terminal, (mut collector, cursor)) = tokio::join!(poller, tail);

        let (status, exit_code, target) = match terminal {
            Some(report) => {
                if report.exit_code.is_none() {
                    warn!(
                        task_id = %handle.task_id,
                        stop_reason = ?report.stop_reason,
                        "Remote task stopped without an exit code"
                    );
                }
                let status = TaskStatus::from_exit_code(report.exit_code);
                let target = match status {
                    TaskStatus::Success => SupervisionState::Succeeded,
                    _ => SupervisionState::Failed,
                };
                (status, report.exit_code, target)
            }
            None => {
                warn!(
                    task_id = %handle.task_id,
                    ceiling_secs = ceiling.as_secs(),
                    "Remote task exceeded its ceiling, terminating"
                );
                if let Err(e) = self.platform.terminate(&handle.task_id).await {
                    warn!(task_id = %handle.task_id, error = %e, "Failed to terminate remote task");
                }
                (TaskStatus::Timeout, None, SupervisionState::TimedOut)
            }
        };

        // A sink that was never created drains to nothing.
        let (lines, _) = self.tailer.drain(&handle.log_sink, cursor).await;
        collector.extend(lines);

        let state = *state_tx.borrow();
        match state.transition_to(target) {
            Ok(next) => {
                state_tx.send_replace(next);
            }
            Err(e) => warn!(task_id = %handle.task_id, error = %e, "Unexpected supervision state"),
        }

        self.platform.release(&handle.task_id).await;

        let outcome = TaskOutcome {
            status,
            exit_code,
            tier: handle.tier,
            elapsed: handle.started.elapsed(),
            file: handle.file,
            task_id: handle.task_id,
            launch_path: handle.launch_path,
            correlation_id: handle.correlation_id,
            log_lines: collector.total,
            log_tail: collector.tail.into_iter().collect(),
            error_detail: collector.error_detail,
        };

        if outcome.is_success() {
            info!(
                task_id = %outcome.task_id,
                elapsed_secs = outcome.elapsed.as_secs_f64(),
                "Remote task succeeded"
            );
        } else {
            warn!(task_id = %outcome.task_id, status = %outcome.status, "{}", outcome.summary());
        }
        outcome
    }

    async fn poll_until_terminal(
        &self,
        handle: &RemoteTaskHandle,
        state_tx: &watch::Sender<SupervisionState>,
    ) -> LifecycleReport {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.platform.poll_lifecycle(&handle.task_id).await {
                Ok(report) => {
                    debug!(task_id = %handle.task_id, state = %report.state, "Polled remote task");
                    if !report.state.is_pending() && !state_tx.borrow().has_started() {
                        state_tx.send_replace(SupervisionState::Running);
                        info!(task_id = %handle.task_id, "Remote task is running");
                    }
                    if report.state.is_terminal() {
                        return report;
                    }
                }
                Err(e) => {
                    warn!(
                        task_id = %handle.task_id,
                        error = %e,
                        "Failed to poll remote task, retrying on next tick"
                    );
                }
            }
        }
    }

    async fn tail_while_running(
        &self,
        handle: &RemoteTaskHandle,
        mut state_rx: watch::Receiver<SupervisionState>,
        stop: CancellationToken,
    ) -> (LogCollector, LogCursor) {
        let mut collector = LogCollector::new(&handle.task_id, self.config.log_tail_lines);
        let mut cursor = LogCursor::new();

        let started = tokio::select! {
            _ = stop.cancelled() => false,
            result = state_rx.wait_for(|state| state.has_started()) => result.is_ok(),
        };
        if !started {
            return (collector, cursor);
        }

        let mut ticker = tokio::time::interval(self.config.log_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let (lines, next) = self.tailer.advance(&handle.log_sink, &cursor).await;
                    cursor = next;
                    collector.extend(lines);
                }
            }
        }
        (collector, cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{InMemoryPlatform, TaskScript};

    fn supervisor(platform: Arc<InMemoryPlatform>) -> TaskSupervisor {
        TaskSupervisor::new(platform, SupervisorConfig::default(), LaunchRouting::default())
    }

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.timeout_for(LaunchPath::Function), Duration::from_secs(300));
        assert_eq!(config.timeout_for(LaunchPath::Container), Duration::from_secs(900));
        assert_eq!(
            config.task_definition_for(SizeTier::Xlarge).unwrap(),
            "file-processor-xlarge"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unmapped_tier() {
        let mut config = SupervisorConfig::default();
        config.tier_task_definitions.remove(&SizeTier::Large);
        assert_eq!(
            config.task_definition_for(SizeTier::Large),
            Err(LaunchError::UnmappedTier(SizeTier::Large))
        );
    }

    #[test]
    fn test_collector_keeps_bounded_tail() {
        let mut collector = LogCollector::new("t", 2);
        collector.extend(vec![
            "[INFO] start".to_string(),
            "[ERROR] bad row".to_string(),
            "[INFO] done".to_string(),
        ]);
        assert_eq!(collector.total, 3);
        assert_eq!(collector.tail, vec!["[ERROR] bad row", "[INFO] done"]);
        assert_eq!(collector.error_detail.as_deref(), Some("[ERROR] bad row"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_tier_runs_on_function_path() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.push_script(TaskScript::completes_with(0));
        let supervisor = supervisor(platform.clone());

        let outcome = supervisor
            .run(FileReference::new("b", "k", 10, "e"), SizeTier::Small, "run-1")
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.launch_path, LaunchPath::Function);
        let launches = platform.launches();
        assert_eq!(launches[0].task_definition_key, "file-processor-small");
        assert_eq!(launches[0].correlation_id, "run-1");
        assert_eq!(platform.released(), vec![outcome.task_id.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_error_is_surfaced() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.fail_next_launch(LaunchError::Placement("no capacity".to_string()));
        let supervisor = supervisor(platform);

        let err = supervisor
            .run(FileReference::new("b", "k", 10, "e"), SizeTier::Large, "run-1")
            .await
            .unwrap_err();
        assert_eq!(err, LaunchError::Placement("no capacity".to_string()));
    }
}
