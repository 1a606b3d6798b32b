//! Durable run records backing the local scheduler.

use chrono::Utc;
use tracing::info;

use crate::database::DbPool;
use crate::domain::{DispatchRequest, TaskOutcome, TaskStatus};
use crate::{Error, Result};

/// Persisted state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredRunState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    LaunchFailed,
}

impl StoredRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::LaunchFailed => "launch_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "launch_failed" => Some(Self::LaunchFailed),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    fn from_outcome(outcome: &TaskOutcome) -> Self {
        match outcome.status {
            TaskStatus::Success => Self::Succeeded,
            TaskStatus::Failure => Self::Failed,
            TaskStatus::Timeout => Self::TimedOut,
        }
    }
}

impl std::fmt::Display for StoredRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A row of the `runs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRun {
    pub request: DispatchRequest,
    pub state: StoredRunState,
    pub exit_code: Option<i32>,
    pub detail: Option<String>,
}

/// Run records in the `runs` table, keyed by run key.
#[derive(Debug, Clone)]
pub struct RunStore {
    pool: DbPool,
}

impl RunStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record a queued run. Returns `false` when the run key already exists,
    /// whatever its state.
    pub async fn insert(&self, request: &DispatchRequest) -> Result<bool> {
        let body = serde_json::to_string(request)?;
        let now_ms = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO runs (run_key, request, state, submitted_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&request.run_key)
        .bind(body)
        .bind(StoredRunState::Queued.as_str())
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Forget a run that was never handed off.
    pub async fn remove(&self, run_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM runs WHERE run_key = ?")
            .bind(run_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_running(&self, run_key: &str) -> Result<()> {
        self.update(run_key, StoredRunState::Running, None, None)
            .await
    }

    pub async fn mark_finished(&self, run_key: &str, outcome: &TaskOutcome) -> Result<()> {
        let detail = outcome.error_detail.as_deref();
        self.update(
            run_key,
            StoredRunState::from_outcome(outcome),
            outcome.exit_code,
            detail,
        )
        .await
    }

    pub async fn mark_launch_failed(&self, run_key: &str, reason: &str) -> Result<()> {
        self.update(run_key, StoredRunState::LaunchFailed, None, Some(reason))
            .await
    }

    async fn update(
        &self,
        run_key: &str,
        state: StoredRunState,
        exit_code: Option<i32>,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET state = ?, exit_code = ?, detail = ?, updated_at_ms = ? \
             WHERE run_key = ?",
        )
        .bind(state.as_str())
        .bind(exit_code)
        .bind(detail)
        .bind(Utc::now().timestamp_millis())
        .bind(run_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, run_key: &str) -> Result<Option<StoredRun>> {
        let row: Option<(String, String, Option<i32>, Option<String>)> = sqlx::query_as(
            "SELECT request, state, exit_code, detail FROM runs WHERE run_key = ?",
        )
        .bind(run_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(request, state, exit_code, detail)| {
            Ok(StoredRun {
                request: serde_json::from_str(&request)?,
                state: parse_state(&state)?,
                exit_code,
                detail,
            })
        })
        .transpose()
    }

    /// Reset interrupted runs to queued and return every queued request,
    /// oldest first.
    pub async fn recover(&self) -> Result<Vec<DispatchRequest>> {
        let reset = sqlx::query("UPDATE runs SET state = ?, updated_at_ms = ? WHERE state = ?")
            .bind(StoredRunState::Queued.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(StoredRunState::Running.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if reset > 0 {
            info!(count = reset, "Reset interrupted runs to queued");
        }

        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT request FROM runs WHERE state = ? ORDER BY submitted_at_ms, rowid",
        )
        .bind(StoredRunState::Queued.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(request,)| serde_json::from_str(&request).map_err(Error::from))
            .collect()
    }
}

fn parse_state(value: &str) -> Result<StoredRunState> {
    StoredRunState::parse(value)
        .ok_or_else(|| Error::Other(format!("unknown run state '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool, run_migrations};
    use crate::domain::{FileReference, LaunchPath, SizeTier};
    use std::time::Duration;

    async fn setup() -> RunStore {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        RunStore::new(pool)
    }

    fn request(key: &str) -> DispatchRequest {
        let file = FileReference::new("bucket", key, 10, "etag");
        DispatchRequest::new(file, SizeTier::Small, LaunchPath::Function)
    }

    fn outcome(request: &DispatchRequest, exit_code: i32) -> TaskOutcome {
        TaskOutcome {
            status: TaskStatus::from_exit_code(Some(exit_code)),
            exit_code: Some(exit_code),
            tier: request.tier,
            elapsed: Duration::from_secs(1),
            file: request.file.clone(),
            task_id: "t".to_string(),
            launch_path: request.launch_path,
            correlation_id: request.run_key.clone(),
            log_lines: 1,
            log_tail: vec!["[ERROR] boom".to_string()],
            error_detail: Some("[ERROR] boom".to_string()),
        }
    }

    #[tokio::test]
    async fn test_insert_dedups_on_run_key() {
        let store = setup().await;
        let req = request("a.csv");
        assert!(store.insert(&req).await.unwrap());
        assert!(!store.insert(&req).await.unwrap());

        let stored = store.get(&req.run_key).await.unwrap().unwrap();
        assert_eq!(stored.request, req);
        assert_eq!(stored.state, StoredRunState::Queued);
    }

    #[tokio::test]
    async fn test_finished_run_still_dedups() {
        let store = setup().await;
        let req = request("a.csv");
        store.insert(&req).await.unwrap();
        store.mark_finished(&req.run_key, &outcome(&req, 2)).await.unwrap();

        assert!(!store.insert(&req).await.unwrap());
        let stored = store.get(&req.run_key).await.unwrap().unwrap();
        assert_eq!(stored.state, StoredRunState::Failed);
        assert_eq!(stored.exit_code, Some(2));
        assert_eq!(stored.detail.as_deref(), Some("[ERROR] boom"));
    }

    #[tokio::test]
    async fn test_recover_requeues_interrupted_runs() {
        let store = setup().await;
        let (a, b, c) = (request("a.csv"), request("b.csv"), request("c.csv"));
        for req in [&a, &b, &c] {
            store.insert(req).await.unwrap();
        }
        store.mark_running(&a.run_key).await.unwrap();
        store.mark_finished(&c.run_key, &outcome(&c, 0)).await.unwrap();

        let recovered = store.recover().await.unwrap();
        assert_eq!(recovered, vec![a.clone(), b]);
        assert_eq!(
            store.get(&a.run_key).await.unwrap().unwrap().state,
            StoredRunState::Queued
        );
    }

    #[tokio::test]
    async fn test_remove() {
        let store = setup().await;
        let req = request("a.csv");
        store.insert(&req).await.unwrap();
        store.remove(&req.run_key).await.unwrap();
        assert!(store.get(&req.run_key).await.unwrap().is_none());
        assert!(store.insert(&req).await.unwrap());
    }
}
