//! Message queue boundary.
//!
//! Delivery is at-least-once: a received message stays leased for the
//! visibility timeout and comes back with a fresh receipt unless it is deleted
//! before the lease runs out.

mod memory;
mod sqlite;

pub use memory::InMemoryQueue;
pub use sqlite::SqliteQueue;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    /// Handle for deleting this delivery. Changes on every delivery.
    pub receipt_token: String,
    /// How many times the message has been delivered, this delivery included.
    pub receive_count: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("receipt {0} does not match any leased message")]
    ReceiptNotFound(String),

    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receive up to `max_messages`, waiting at most `wait` for the first one.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete(&self, receipt_token: &str) -> Result<(), QueueError>;

    /// Enqueue a body and return its message id.
    async fn send(&self, body: &str) -> Result<String, QueueError>;
}
