use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;

use super::{HandoffError, RunScheduler, SubmitOutcome};
use crate::domain::DispatchRequest;

/// Scheduler that only records what it was given.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    inner: Mutex<Recorded>,
}

#[derive(Debug, Default)]
struct Recorded {
    run_keys: HashSet<String>,
    scheduled: Vec<DispatchRequest>,
    submissions: usize,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that created a run, in submission order.
    pub fn scheduled(&self) -> Vec<DispatchRequest> {
        self.inner.lock().scheduled.clone()
    }

    pub fn run_keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .scheduled
            .iter()
            .map(|r| r.run_key.clone())
            .collect()
    }

    /// Every call to `submit`, duplicates included.
    pub fn submissions(&self) -> usize {
        self.inner.lock().submissions
    }
}

#[async_trait]
impl RunScheduler for RecordingScheduler {
    async fn submit(&self, request: &DispatchRequest) -> Result<SubmitOutcome, HandoffError> {
        let mut inner = self.inner.lock();
        inner.submissions += 1;
        if !inner.run_keys.insert(request.run_key.clone()) {
            return Ok(SubmitOutcome::AlreadyScheduled);
        }
        inner.scheduled.push(request.clone());
        Ok(SubmitOutcome::Scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FileReference, LaunchPath, SizeTier};

    #[tokio::test]
    async fn test_dedups_by_run_key() {
        let scheduler = RecordingScheduler::new();
        let request = DispatchRequest::new(
            FileReference::new("b", "k", 1, "e"),
            SizeTier::Small,
            LaunchPath::Function,
        );

        assert_eq!(scheduler.submit(&request).await, Ok(SubmitOutcome::Scheduled));
        assert_eq!(
            scheduler.submit(&request).await,
            Ok(SubmitOutcome::AlreadyScheduled)
        );
        assert_eq!(scheduler.scheduled().len(), 1);
        assert_eq!(scheduler.submissions(), 2);
    }
}
