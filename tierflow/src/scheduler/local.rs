//! In-process scheduler that supervises each accepted run on the local runtime.
//!
//! With a [`RunStore`] attached, a run is persisted before `submit` reports it
//! scheduled, the store is the dedup authority, and [`LocalRunScheduler::recover_runs`]
//! restarts whatever a previous process left queued or running. Memory only
//! holds active runs plus a bounded window of finished ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::RunStore;
use super::{HandoffError, RunScheduler, SubmitOutcome};
use crate::Error;
use crate::domain::{DispatchRequest, TaskOutcome};
use crate::supervisor::TaskSupervisor;

/// Configuration for [`LocalRunScheduler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSchedulerConfig {
    /// Runs supervised at the same time.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Queued plus running runs beyond which submissions are refused.
    #[serde(default = "default_max_pending_runs")]
    pub max_pending_runs: usize,
    /// Finished run records kept in memory for inspection.
    #[serde(default = "default_max_retained_runs")]
    pub max_retained_runs: usize,
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_max_pending_runs() -> usize {
    64
}

fn default_max_retained_runs() -> usize {
    128
}

impl Default for LocalSchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            max_pending_runs: default_max_pending_runs(),
            max_retained_runs: default_max_retained_runs(),
        }
    }
}

/// Where a run is in its life.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Queued,
    Running,
    Finished(TaskOutcome),
    LaunchFailed(String),
    /// Dropped by shutdown before it started. A stored run stays queued.
    Cancelled,
}

impl RunState {
    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

/// Bookkeeping for one run key.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub request: DispatchRequest,
    pub state: RunState,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    fn queued(request: DispatchRequest) -> Self {
        let now = Utc::now();
        Self {
            request,
            state: RunState::Queued,
            submitted_at: now,
            updated_at: now,
        }
    }
}

/// Shared state touched by every run task.
struct RunContext {
    supervisor: Arc<TaskSupervisor>,
    store: Option<RunStore>,
    semaphore: Arc<Semaphore>,
    active: DashMap<String, RunRecord>,
    active_runs: AtomicUsize,
    retained: Mutex<VecDeque<RunRecord>>,
    max_retained: usize,
    idle: Notify,
    cancellation_token: CancellationToken,
}

impl RunContext {
    /// Claim `run_key` in memory. Fails with the current count when saturated.
    fn reserve(&self, request: &DispatchRequest, limit: usize) -> Result<bool, usize> {
        match self.active.entry(request.run_key.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                let pending = self.active_runs.load(Ordering::SeqCst);
                if pending >= limit {
                    return Err(pending);
                }
                vacant.insert(RunRecord::queued(request.clone()));
                self.active_runs.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        }
    }

    fn release(&self, run_key: &str) -> Option<RunRecord> {
        let removed = self.active.remove(run_key).map(|(_, record)| record);
        if removed.is_some() && self.active_runs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
        removed
    }

    fn is_retained(&self, run_key: &str) -> bool {
        self.retained
            .lock()
            .iter()
            .any(|record| record.request.run_key == run_key)
    }

    fn set_running(&self, run_key: &str) {
        if let Some(mut record) = self.active.get_mut(run_key) {
            record.state = RunState::Running;
            record.updated_at = Utc::now();
        }
    }

    fn finish(&self, run_key: &str, state: RunState) {
        let Some(mut record) = self.active.remove(run_key).map(|(_, record)| record) else {
            return;
        };
        record.state = state;
        record.updated_at = Utc::now();
        {
            let mut retained = self.retained.lock();
            retained.push_back(record);
            while retained.len() > self.max_retained {
                retained.pop_front();
            }
        }
        if self.active_runs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn run(self: Arc<Self>, request: DispatchRequest) {
        let run_key = request.run_key.clone();

        let permit = tokio::select! {
            _ = self.cancellation_token.cancelled() => {
                debug!(run_key = %run_key, "Queued run cancelled");
                self.finish(&run_key, RunState::Cancelled);
                return;
            }
            permit = self.semaphore.clone().acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            self.finish(&run_key, RunState::Cancelled);
            return;
        };

        self.set_running(&run_key);
        if let Some(store) = &self.store
            && let Err(e) = store.mark_running(&run_key).await
        {
            warn!(run_key = %run_key, error = %e, "Failed to persist run state");
        }

        let result = self.supervisor.run_request(&request).await;
        drop(permit);

        match result {
            Ok(outcome) => {
                info!(run_key = %run_key, status = %outcome.status, "Run finished");
                if let Some(store) = &self.store
                    && let Err(e) = store.mark_finished(&run_key, &outcome).await
                {
                    warn!(run_key = %run_key, error = %e, "Failed to persist run outcome");
                }
                self.finish(&run_key, RunState::Finished(outcome));
            }
            Err(e) => {
                error!(run_key = %run_key, error = %e, "Run failed to launch");
                let reason = e.to_string();
                if let Some(store) = &self.store
                    && let Err(e) = store.mark_launch_failed(&run_key, &reason).await
                {
                    warn!(run_key = %run_key, error = %e, "Failed to persist run outcome");
                }
                self.finish(&run_key, RunState::LaunchFailed(reason));
            }
        }
    }
}

/// Runs accepted requests through a [`TaskSupervisor`], bounded by a semaphore.
pub struct LocalRunScheduler {
    config: LocalSchedulerConfig,
    context: Arc<RunContext>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl LocalRunScheduler {
    /// A scheduler that keeps runs in memory only.
    pub fn new(supervisor: Arc<TaskSupervisor>, config: LocalSchedulerConfig) -> Self {
        Self::build(supervisor, None, config)
    }

    /// A scheduler that persists every accepted run in `store`.
    pub fn with_store(
        supervisor: Arc<TaskSupervisor>,
        store: RunStore,
        config: LocalSchedulerConfig,
    ) -> Self {
        Self::build(supervisor, Some(store), config)
    }

    fn build(
        supervisor: Arc<TaskSupervisor>,
        store: Option<RunStore>,
        config: LocalSchedulerConfig,
    ) -> Self {
        let context = Arc::new(RunContext {
            supervisor,
            store,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            active: DashMap::new(),
            active_runs: AtomicUsize::new(0),
            retained: Mutex::new(VecDeque::new()),
            max_retained: config.max_retained_runs,
            idle: Notify::new(),
            cancellation_token: CancellationToken::new(),
        });
        Self {
            config,
            context,
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Restart runs a previous process accepted but never finished.
    ///
    /// Interrupted runs are launched again from scratch.
    pub async fn recover_runs(&self) -> crate::Result<usize> {
        let Some(store) = &self.context.store else {
            return Ok(0);
        };

        let mut recovered = 0;
        for request in store.recover().await? {
            if !matches!(self.context.reserve(&request, usize::MAX), Ok(true)) {
                continue;
            }
            if !self.spawn_run(&request) {
                self.context.release(&request.run_key);
                let err = HandoffError::Unavailable("scheduler is shutting down".to_string());
                return Err(err.into());
            }
            recovered += 1;
        }
        info!(count = recovered, "Recovered runs from database");
        Ok(recovered)
    }

    /// Record for a run key, if it is active or still retained.
    pub fn run(&self, run_key: &str) -> Option<RunRecord> {
        if let Some(record) = self.context.active.get(run_key) {
            return Some(record.value().clone());
        }
        self.context
            .retained
            .lock()
            .iter()
            .rev()
            .find(|record| record.request.run_key == run_key)
            .cloned()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self.context.retained.lock().iter().cloned().collect();
        runs.extend(self.context.active.iter().map(|r| r.value().clone()));
        runs
    }

    /// Runs that are queued or running.
    pub fn pending_runs(&self) -> usize {
        self.context.active_runs.load(Ordering::SeqCst)
    }

    /// Finished runs still held in memory.
    pub fn retained_runs(&self) -> usize {
        self.context.retained.lock().len()
    }

    /// Wait until no run is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.context.idle.notified();
            if self.pending_runs() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancel queued runs, then wait for running ones to finish.
    pub async fn shutdown(&self) {
        info!(pending = self.pending_runs(), "Stopping local run scheduler");
        self.context.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };
        if let Some(mut join_set) = join_set {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Run task ended abnormally");
                }
            }
        }

        info!("Local run scheduler stopped");
    }

    fn spawn_run(&self, request: &DispatchRequest) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return false;
        };
        while let Some(result) = join_set.try_join_next() {
            if let Err(e) = result {
                warn!(error = %e, "Run task ended abnormally");
            }
        }
        join_set.spawn(self.context.clone().run(request.clone()));
        true
    }
}

#[async_trait]
impl RunScheduler for LocalRunScheduler {
    async fn submit(&self, request: &DispatchRequest) -> Result<SubmitOutcome, HandoffError> {
        if self.context.cancellation_token.is_cancelled() {
            return Err(HandoffError::Unavailable(
                "scheduler is shutting down".to_string(),
            ));
        }
        if self.context.store.is_none() && self.context.is_retained(&request.run_key) {
            debug!(run_key = %request.run_key, "Run already finished");
            return Ok(SubmitOutcome::AlreadyScheduled);
        }

        match self.context.reserve(request, self.config.max_pending_runs) {
            Ok(true) => {}
            Ok(false) => {
                debug!(run_key = %request.run_key, "Run already scheduled");
                return Ok(SubmitOutcome::AlreadyScheduled);
            }
            Err(pending) => {
                return Err(HandoffError::Saturated {
                    pending,
                    limit: self.config.max_pending_runs,
                });
            }
        }

        if let Some(store) = &self.context.store {
            match store.insert(request).await {
                Ok(true) => {}
                Ok(false) => {
                    self.context.release(&request.run_key);
                    debug!(run_key = %request.run_key, "Run already recorded");
                    return Ok(SubmitOutcome::AlreadyScheduled);
                }
                Err(Error::Serialization(e)) => {
                    self.context.release(&request.run_key);
                    return Err(HandoffError::Rejected {
                        run_key: request.run_key.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    self.context.release(&request.run_key);
                    return Err(HandoffError::Unavailable(e.to_string()));
                }
            }
        }

        if !self.spawn_run(request) {
            // A stored run stays queued and is picked up by the next recovery.
            self.context.release(&request.run_key);
            return Err(HandoffError::Unavailable(
                "scheduler is shutting down".to_string(),
            ));
        }

        info!(
            run_key = %request.run_key,
            tier = %request.tier,
            launch_path = %request.launch_path,
            "Run scheduled"
        );
        Ok(SubmitOutcome::Scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FileReference, LaunchRouting, SizeTier, TaskStatus};
    use crate::platform::{InMemoryPlatform, LaunchError, TaskScript};
    use crate::supervisor::SupervisorConfig;

    fn scheduler(platform: Arc<InMemoryPlatform>, config: LocalSchedulerConfig) -> LocalRunScheduler {
        let supervisor = Arc::new(TaskSupervisor::new(
            platform,
            SupervisorConfig::default(),
            LaunchRouting::default(),
        ));
        LocalRunScheduler::new(supervisor, config)
    }

    fn request(key: &str) -> DispatchRequest {
        let file = FileReference::new("bucket", key, 10, "etag");
        DispatchRequest::new(file, SizeTier::Small, crate::domain::LaunchPath::Function)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_to_completion() {
        let platform = Arc::new(InMemoryPlatform::new());
        let scheduler = scheduler(platform.clone(), LocalSchedulerConfig::default());

        let req = request("a.csv");
        assert_eq!(scheduler.submit(&req).await, Ok(SubmitOutcome::Scheduled));
        assert_eq!(
            scheduler.submit(&req).await,
            Ok(SubmitOutcome::AlreadyScheduled)
        );

        scheduler.wait_idle().await;
        let record = scheduler.run(&req.run_key).unwrap();
        match record.state {
            RunState::Finished(outcome) => {
                assert_eq!(outcome.status, TaskStatus::Success);
                assert_eq!(outcome.correlation_id, req.run_key);
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(platform.launches().len(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_is_recorded() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.fail_next_launch(LaunchError::Rejected("quota".to_string()));
        let scheduler = scheduler(platform, LocalSchedulerConfig::default());

        let req = request("b.csv");
        scheduler.submit(&req).await.unwrap();
        scheduler.wait_idle().await;

        assert!(matches!(
            scheduler.run(&req.run_key).unwrap().state,
            RunState::LaunchFailed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturation() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.push_script(TaskScript::new().running(["busy"]));
        let scheduler = scheduler(
            platform,
            LocalSchedulerConfig {
                max_concurrent_runs: 1,
                max_pending_runs: 1,
                ..Default::default()
            },
        );

        scheduler.submit(&request("a.csv")).await.unwrap();
        let err = scheduler.submit(&request("b.csv")).await.unwrap_err();
        assert_eq!(err, HandoffError::Saturated { pending: 1, limit: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_after_shutdown() {
        let platform = Arc::new(InMemoryPlatform::new());
        let scheduler = scheduler(platform, LocalSchedulerConfig::default());
        scheduler.shutdown().await;

        let err = scheduler.submit(&request("a.csv")).await.unwrap_err();
        assert!(matches!(err, HandoffError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_runs_are_bounded() {
        let platform = Arc::new(InMemoryPlatform::new());
        let scheduler = scheduler(
            platform,
            LocalSchedulerConfig {
                max_retained_runs: 2,
                ..Default::default()
            },
        );

        let keys: Vec<String> = (0..5).map(|i| format!("f{i}.csv")).collect();
        for key in &keys {
            scheduler.submit(&request(key)).await.unwrap();
        }
        scheduler.wait_idle().await;

        assert_eq!(scheduler.pending_runs(), 0);
        assert_eq!(scheduler.retained_runs(), 2);
        assert_eq!(scheduler.runs().len(), 2);
        assert!(scheduler.run(&request("f0.csv").run_key).is_none());
        assert!(scheduler.run(&request("f4.csv").run_key).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retained_run_is_not_rerun() {
        let platform = Arc::new(InMemoryPlatform::new());
        let scheduler = scheduler(platform.clone(), LocalSchedulerConfig::default());

        let req = request("a.csv");
        scheduler.submit(&req).await.unwrap();
        scheduler.wait_idle().await;

        assert_eq!(
            scheduler.submit(&req).await,
            Ok(SubmitOutcome::AlreadyScheduled)
        );
        assert_eq!(platform.launches().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_without_store() {
        let platform = Arc::new(InMemoryPlatform::new());
        let scheduler = scheduler(platform, LocalSchedulerConfig::default());
        assert_eq!(scheduler.recover_runs().await.unwrap(), 0);
    }
}
