//! Incremental, resumable reads of a remote log sink.

use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::platform::{ComputePlatform, LogSinkRef, PlatformError};

const DEFAULT_MAX_DRAIN_PAGES: usize = 1000;
const DRAIN_FAULT_RETRIES: usize = 3;
const DRAIN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Position in a log sink, owned by a single tailer.
///
/// The token is opaque to everything except the platform. `emitted` only ever
/// goes from `false` to `true`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogCursor {
    token: Option<String>,
    emitted: bool,
}

impl LogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Whether any line has been emitted under this cursor's history.
    pub fn has_emitted(&self) -> bool {
        self.emitted
    }

    fn advance(&self, next_token: Option<String>, emitted_now: bool) -> Self {
        Self {
            token: next_token.or_else(|| self.token.clone()),
            emitted: self.emitted || emitted_now,
        }
    }
}

/// Reads new lines from a sink without ever returning a line twice.
#[derive(Clone)]
pub struct LogTailer {
    platform: Arc<dyn ComputePlatform>,
    max_drain_pages: usize,
}

impl LogTailer {
    pub fn new(platform: Arc<dyn ComputePlatform>) -> Self {
        Self {
            platform,
            max_drain_pages: DEFAULT_MAX_DRAIN_PAGES,
        }
    }

    /// Read the lines written after `cursor`.
    ///
    /// A sink that does not exist yet and any read fault both yield no lines
    /// and leave the cursor where it was; the next call retries from there.
    pub async fn advance(&self, sink: &LogSinkRef, cursor: &LogCursor) -> (Vec<String>, LogCursor) {
        match self.read(sink, cursor).await {
            Ok(result) => result,
            Err(PlatformError::SinkNotFound(_)) => {
                trace!(sink = %sink, "Log sink not created yet");
                (Vec::new(), cursor.clone())
            }
            Err(e) => {
                warn!(sink = %sink, error = %e, "Failed to read remote logs, will retry");
                (Vec::new(), cursor.clone())
            }
        }
    }

    /// Read until the sink returns an empty page.
    ///
    /// Read faults are retried a few times since nothing reads after the drain.
    pub async fn drain(&self, sink: &LogSinkRef, cursor: LogCursor) -> (Vec<String>, LogCursor) {
        let mut cursor = cursor;
        let mut lines = Vec::new();
        let mut faults = 0;
        for _ in 0..self.max_drain_pages {
            match self.read(sink, &cursor).await {
                Ok((page, next)) => {
                    cursor = next;
                    if page.is_empty() {
                        break;
                    }
                    lines.extend(page);
                }
                Err(PlatformError::SinkNotFound(_)) => break,
                Err(e) => {
                    faults += 1;
                    if faults > DRAIN_FAULT_RETRIES {
                        warn!(sink = %sink, error = %e, "Giving up on final log drain");
                        break;
                    }
                    warn!(sink = %sink, error = %e, attempt = faults, "Final log drain failed, retrying");
                    tokio::time::sleep(DRAIN_RETRY_DELAY).await;
                }
            }
        }
        (lines, cursor)
    }

    async fn read(
        &self,
        sink: &LogSinkRef,
        cursor: &LogCursor,
    ) -> Result<(Vec<String>, LogCursor), PlatformError> {
        let page = self.platform.read_logs(sink, cursor.token()).await?;
        let emitted_now = !page.lines.is_empty();
        let next = cursor.advance(page.next_token, emitted_now);
        Ok((page.lines, next))
    }
}
