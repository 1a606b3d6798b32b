//! SQLite-backed queue. Receives lease rows inside an immediate transaction
//! so concurrent receivers never share a message.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{MessageQueue, QueueError, QueueMessage};
use crate::database::{DbPool, begin_immediate};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Durable queue stored in the `queue_messages` table.
///
/// Leases use wall-clock milliseconds, so they survive a restart.
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: DbPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl SqliteQueue {
    pub fn new(pool: DbPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How often an empty long poll re-checks the table.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Messages not yet deleted.
    pub async fn len(&self) -> Result<i64, QueueError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn claim(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut tx = begin_immediate(&self.pool).await?;
        match self.claim_rows(&mut tx, max, now_ms).await {
            Ok(messages) => {
                tx.commit().await?;
                Ok(messages)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Failed to roll back queue claim");
                }
                Err(e.into())
            }
        }
    }

    async fn claim_rows(
        &self,
        conn: &mut sqlx::SqliteConnection,
        max: usize,
        now_ms: i64,
    ) -> Result<Vec<QueueMessage>, sqlx::Error> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT id, body, receive_count FROM queue_messages \
             WHERE visible_at_ms <= ? \
             ORDER BY created_at_ms, rowid \
             LIMIT ?",
        )
        .bind(now_ms)
        .bind(max as i64)
        .fetch_all(&mut *conn)
        .await?;

        let visible_at_ms = now_ms + self.visibility_timeout.as_millis() as i64;
        let mut messages = Vec::with_capacity(rows.len());
        for (id, body, receive_count) in rows {
            let receipt = format!("{}:{}", id, Uuid::new_v4().simple());
            sqlx::query(
                "UPDATE queue_messages \
                 SET receipt_token = ?, visible_at_ms = ?, receive_count = receive_count + 1 \
                 WHERE id = ?",
            )
            .bind(&receipt)
            .bind(visible_at_ms)
            .bind(&id)
            .execute(&mut *conn)
            .await?;

            messages.push(QueueMessage {
                message_id: id,
                body,
                receipt_token: receipt,
                receive_count: (receive_count + 1).try_into().unwrap_or(u32::MAX),
            });
        }
        Ok(messages)
    }
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let messages = self.claim(max_messages).await?;
            let now = tokio::time::Instant::now();
            if !messages.is_empty() || now >= deadline {
                debug!(count = messages.len(), "Received queue messages");
                return Ok(messages);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn delete(&self, receipt_token: &str) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE receipt_token = ?")
            .bind(receipt_token)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::ReceiptNotFound(receipt_token.to_string()));
        }
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let now_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO queue_messages (id, body, receipt_token, visible_at_ms, receive_count, created_at_ms) \
             VALUES (?, ?, NULL, ?, 0, ?)",
        )
        .bind(&id)
        .bind(body)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }
}
