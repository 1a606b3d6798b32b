//! Queue-driven dispatch with deferred acknowledgment.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::notification::parse_notification;
use crate::domain::{DispatchRequest, FileIdentity, LaunchRouting, SizeClassifier};
use crate::queue::{MessageQueue, QueueMessage};
use crate::scheduler::{RunScheduler, SubmitOutcome};
use crate::{Error, Result};

/// What to do with a message carrying both valid and invalid records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialMessagePolicy {
    /// Dispatch the valid records and leave the message for redelivery.
    #[default]
    Withhold,
    /// Dispatch the valid records and delete the message.
    AckValid,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Messages received per cycle (1..=10).
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Long-poll wait per receive, in milliseconds.
    #[serde(default = "default_wait_time_ms")]
    pub wait_time_ms: u64,

    #[serde(default)]
    pub partial_message_policy: PartialMessagePolicy,

    /// Delete bodies that can never be parsed instead of letting them cycle.
    #[serde(default = "default_discard_unrecoverable")]
    pub discard_unrecoverable: bool,

    /// Receive count at which a message that would be left for redelivery
    /// is deleted instead. 0 keeps such messages forever.
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
}

fn default_max_messages() -> usize {
    10
}

fn default_wait_time_ms() -> u64 {
    2000
}

fn default_discard_unrecoverable() -> bool {
    true
}

fn default_max_receive_count() -> u32 {
    10
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            wait_time_ms: default_wait_time_ms(),
            partial_message_policy: PartialMessagePolicy::default(),
            discard_unrecoverable: default_discard_unrecoverable(),
            max_receive_count: default_max_receive_count(),
        }
    }
}

impl DispatcherConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    fn exhausted(&self, message: &QueueMessage) -> bool {
        self.max_receive_count > 0 && message.receive_count >= self.max_receive_count
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.max_messages) {
            return Err(Error::config(format!(
                "dispatcher.max_messages must be between 1 and 10 (got {})",
                self.max_messages
            )));
        }
        Ok(())
    }
}

/// Receipts and requests of one cycle, acknowledged together.
#[derive(Debug, Clone, Default)]
pub struct PendingAck {
    pub receipt_tokens: Vec<String>,
    pub requests: Vec<DispatchRequest>,
}

/// Summary of one [`QueueDispatcher::evaluate`] cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Requests built this cycle, in hand-off order.
    pub requests: Vec<DispatchRequest>,
    pub received: usize,
    pub acknowledged: usize,
    /// Arrivals dropped because an earlier one had the same identity.
    pub duplicates: usize,
    pub invalid_records: usize,
    pub malformed: usize,
    /// Malformed messages deleted as unrecoverable.
    pub discarded: usize,
    /// Partially valid messages left for redelivery.
    pub withheld: usize,
    /// Messages deleted after reaching the receive-count limit.
    pub poisoned: usize,
    /// Set when a hand-off failed and no receipt was deleted.
    pub handoff_failure: Option<String>,
}

impl CycleReport {
    pub fn handed_off(&self) -> bool {
        self.handoff_failure.is_none()
    }
}

/// Drains the queue into dispatch requests.
pub struct QueueDispatcher {
    queue: Arc<dyn MessageQueue>,
    scheduler: Arc<dyn RunScheduler>,
    classifier: SizeClassifier,
    routing: LaunchRouting,
    config: DispatcherConfig,
}

impl QueueDispatcher {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        scheduler: Arc<dyn RunScheduler>,
        classifier: SizeClassifier,
        routing: LaunchRouting,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            scheduler,
            classifier,
            routing,
            config,
        }
    }

    /// Run one receive, dispatch and acknowledge cycle.
    ///
    /// A receipt is deleted only once every request of the cycle has been
    /// handed off. Any hand-off failure leaves the whole batch on the queue.
    pub async fn evaluate(&self) -> Result<CycleReport> {
        let messages = self
            .queue
            .receive(self.config.max_messages, self.config.wait_time())
            .await?;

        let mut report = CycleReport {
            received: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            return Ok(report);
        }

        let mut seen: HashSet<FileIdentity> = HashSet::new();
        let mut pending = PendingAck::default();

        for message in &messages {
            let parsed = match parse_notification(&message.body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    report.malformed += 1;
                    if e.is_unrecoverable() && self.config.discard_unrecoverable {
                        warn!(
                            message_id = %message.message_id,
                            error = %e,
                            "Discarding unrecoverable message"
                        );
                        pending.receipt_tokens.push(message.receipt_token.clone());
                        report.discarded += 1;
                    } else if self.config.exhausted(message) {
                        warn!(
                            message_id = %message.message_id,
                            receive_count = message.receive_count,
                            error = %e,
                            "Deleting malformed message after repeated deliveries"
                        );
                        pending.receipt_tokens.push(message.receipt_token.clone());
                        report.poisoned += 1;
                    } else {
                        warn!(
                            message_id = %message.message_id,
                            receive_count = message.receive_count,
                            error = %e,
                            "Malformed message left for redelivery"
                        );
                    }
                    continue;
                }
            };

            for invalid in &parsed.invalid {
                warn!(
                    message_id = %message.message_id,
                    record = invalid.index,
                    reason = %invalid.reason,
                    "Skipping invalid record"
                );
            }
            report.invalid_records += parsed.invalid.len();

            let withhold = parsed.is_partial()
                && self.config.partial_message_policy == PartialMessagePolicy::Withhold;

            for arrival in parsed.arrivals {
                if !seen.insert(arrival.file.identity()) {
                    debug!(file = %arrival.file, "Duplicate arrival in cycle");
                    report.duplicates += 1;
                    continue;
                }
                let tier = self
                    .classifier
                    .resolve(arrival.file.size_bytes, arrival.explicit_tier);
                let path = self.routing.path_for(tier);
                pending
                    .requests
                    .push(DispatchRequest::new(arrival.file, tier, path));
            }

            if withhold && self.config.exhausted(message) {
                warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "Deleting partial message after repeated deliveries"
                );
                pending.receipt_tokens.push(message.receipt_token.clone());
                report.poisoned += 1;
            } else if withhold {
                report.withheld += 1;
            } else {
                pending.receipt_tokens.push(message.receipt_token.clone());
            }
        }

        for request in &pending.requests {
            match self.scheduler.submit(request).await {
                Ok(SubmitOutcome::Scheduled) => {
                    info!(
                        run_key = %request.run_key,
                        tier = %request.tier,
                        launch_path = %request.launch_path,
                        "Dispatched file"
                    );
                }
                Ok(SubmitOutcome::AlreadyScheduled) => {
                    debug!(run_key = %request.run_key, "Run already exists");
                }
                Err(e) => {
                    warn!(
                        run_key = %request.run_key,
                        error = %e,
                        withheld_receipts = pending.receipt_tokens.len(),
                        "Hand-off failed, leaving the whole batch for redelivery"
                    );
                    report.handoff_failure = Some(e.to_string());
                    report.requests = pending.requests;
                    return Ok(report);
                }
            }
        }

        for receipt in &pending.receipt_tokens {
            match self.queue.delete(receipt).await {
                Ok(()) => report.acknowledged += 1,
                Err(e) => {
                    warn!(error = %e, "Failed to delete message; it will be redelivered");
                }
            }
        }

        report.requests = pending.requests;
        info!(
            received = report.received,
            dispatched = report.requests.len(),
            acknowledged = report.acknowledged,
            duplicates = report.duplicates,
            poisoned = report.poisoned,
            "Sensor cycle complete"
        );
        Ok(report)
    }
}
