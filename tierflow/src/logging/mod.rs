//! Logging setup.
//!
//! Console output goes to stderr so the `supervise` command can keep stdout
//! for its JSON outcome. An optional directory adds a daily rolling file.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "tierflow=info,sqlx=warn";

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter directive; `RUST_LOG` takes precedence when set.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily rolling log files.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Pick the filter directive: `RUST_LOG`, then the configured filter, then the default.
fn filter_directive(settings: &LoggingSettings, rust_log: Option<String>) -> String {
    rust_log
        .filter(|v| !v.trim().is_empty())
        .or_else(|| settings.filter.clone())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

/// Initialize the global subscriber.
///
/// # Returns
/// The file writer's guard when a directory is configured; keep it alive for
/// the lifetime of the process.
pub fn init(settings: &LoggingSettings) -> crate::Result<Option<WorkerGuard>> {
    let directive = filter_directive(settings, std::env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| crate::Error::config(format!("invalid log filter '{directive}': {e}")))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![filter.boxed()];

    match settings.format {
        LogFormat::Text => layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(LocalTimer)
                .boxed(),
        ),
        LogFormat::Json => layers.push(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_timer(LocalTimer)
                .boxed(),
        ),
    }

    let mut guard = None;
    if let Some(dir) = &settings.directory {
        std::fs::create_dir_all(dir)?;
        let file_appender = tracing_appender::rolling::daily(dir, "tierflow.log");
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        layers.push(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer)
                .boxed(),
        );
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(guard)
}
