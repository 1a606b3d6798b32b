//! Periodic sensor loop.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::dispatcher::{CycleReport, QueueDispatcher};
use crate::Result;

/// Sensor loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Seconds between evaluation cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    30
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl SensorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Runs [`QueueDispatcher::evaluate`] on a fixed interval until stopped.
pub struct SensorService {
    dispatcher: Arc<QueueDispatcher>,
    interval: Duration,
    cancellation_token: CancellationToken,
}

impl SensorService {
    pub fn new(dispatcher: Arc<QueueDispatcher>, config: &SensorConfig) -> Self {
        Self {
            dispatcher,
            interval: config.interval(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start the sensor loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    /// Stop the sensor loop after the current cycle.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Evaluate once, outside the loop.
    pub async fn run_once(&self) -> Result<CycleReport> {
        self.dispatcher.evaluate().await
    }

    async fn run_loop(&self) {
        info!(interval_secs = self.interval.as_secs(), "Sensor started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Sensor cycle failed");
                    }
                }
            }
        }
        info!("Sensor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LaunchRouting, SizeClassifier};
    use crate::queue::{InMemoryQueue, MessageQueue};
    use crate::scheduler::RecordingScheduler;
    use crate::sensor::DispatcherConfig;

    #[tokio::test(start_paused = true)]
    async fn test_loop_dispatches_until_stopped() {
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(60)));
        let scheduler = Arc::new(RecordingScheduler::new());
        let dispatcher = Arc::new(QueueDispatcher::new(
            queue.clone(),
            scheduler.clone(),
            SizeClassifier::default(),
            LaunchRouting::default(),
            DispatcherConfig {
                wait_time_ms: 0,
                ..Default::default()
            },
        ));
        let service = Arc::new(SensorService::new(dispatcher, &SensorConfig::default()));
        let handle = service.clone().start();

        let body = serde_json::json!({
            "Records": [{
                "s3": {
                    "bucket": { "name": "ingest" },
                    "object": { "key": "a.csv", "size": 5, "eTag": "e" }
                }
            }]
        })
        .to_string();
        queue.send(&body).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(scheduler.run_keys(), vec!["ingest/a.csv:e"]);
        assert!(queue.is_empty());

        service.stop();
        handle.await.unwrap();
        assert!(!service.is_running());
    }
}
