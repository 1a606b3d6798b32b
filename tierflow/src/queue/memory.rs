//! In-process queue with visibility leases, for tests and single-node runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{MessageQueue, QueueError, QueueMessage};

#[derive(Debug)]
struct Entry {
    id: String,
    body: String,
    receipt: Option<String>,
    visible_at: Instant,
    receive_count: u32,
}

/// In-process queue with visibility-timeout leases.
#[derive(Debug)]
pub struct InMemoryQueue {
    entries: Mutex<Vec<Entry>>,
    visibility_timeout: Duration,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            visibility_timeout,
            notify: Notify::new(),
        }
    }

    /// Messages not yet deleted, leased or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently leased to a receiver.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|e| e.receipt.is_some() && e.visible_at > now)
            .count()
    }

    /// Lease up to `max` visible messages. Also returns when the next hidden
    /// message becomes visible again.
    fn claim(&self, max: usize) -> (Vec<QueueMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for entry in entries.iter_mut() {
            if entry.visible_at > now {
                next_visible = Some(next_visible.map_or(entry.visible_at, |t| t.min(entry.visible_at)));
                continue;
            }
            if batch.len() == max {
                continue;
            }
            let receipt = format!("{}:{}", entry.id, Uuid::new_v4().simple());
            entry.receipt = Some(receipt.clone());
            entry.visible_at = now + self.visibility_timeout;
            entry.receive_count += 1;
            batch.push(QueueMessage {
                message_id: entry.id.clone(),
                body: entry.body.clone(),
                receipt_token: receipt,
                receive_count: entry.receive_count,
            });
        }
        (batch, next_visible)
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let (batch, next_visible) = self.claim(max_messages);
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt_token: &str) -> Result<(), QueueError> {
        let mut entries = self.entries.lock();
        let position = entries
            .iter()
            .position(|e| e.receipt.as_deref() == Some(receipt_token))
            .ok_or_else(|| QueueError::ReceiptNotFound(receipt_token.to_string()))?;
        entries.remove(position);
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        self.entries.lock().push(Entry {
            id: id.clone(),
            body: body.to_string(),
            receipt: None,
            visible_at: Instant::now(),
            receive_count: 0,
        });
        self.notify.notify_waiters();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lease_hides_message() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        queue.send("a").await.unwrap();

        let first = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(queue.in_flight(), 1);

        let hidden = queue.receive(10, Duration::ZERO).await.unwrap();
        assert!(hidden.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_gets_fresh_receipt() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        queue.send("a").await.unwrap();

        let first = queue.receive(10, Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.receive(10, Duration::ZERO).await.unwrap();

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_ne!(second[0].receipt_token, first[0].receipt_token);
        assert_eq!(second[0].receive_count, 2);

        queue.delete(&second[0].receipt_token).await.unwrap();
        assert!(queue.is_empty());
        assert!(matches!(
            queue.delete(&second[0].receipt_token).await,
            Err(QueueError::ReceiptNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_is_bounded_and_ordered() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        for body in ["1", "2", "3"] {
            queue.send(body).await.unwrap();
        }
        let batch = queue.receive(2, Duration::ZERO).await.unwrap();
        let bodies: Vec<&str> = batch.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let queue = std::sync::Arc::new(InMemoryQueue::new(Duration::from_secs(30)));
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(1, Duration::from_secs(20)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.send("late").await.unwrap();

        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_times_out_empty() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let start = Instant::now();
        let batch = queue.receive(1, Duration::from_secs(5)).await.unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
