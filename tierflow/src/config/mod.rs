//! Application configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! JSON file, and `TIERFLOW_*` environment variables (a `.env` file is
//! honored). The merged result is validated before use.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::domain::{LaunchRouting, SizeTier, TierThresholds};
use crate::logging::{LogFormat, LoggingSettings};
use crate::platform::LocalPlatformConfig;
use crate::scheduler::LocalSchedulerConfig;
use crate::sensor::{DispatcherConfig, SensorConfig};
use crate::supervisor::SupervisorConfig;
use crate::{Error, Result};

/// Durable queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Lease granted to a received message.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

impl QueueSettings {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

fn default_database_url() -> String {
    "sqlite:tierflow.db?mode=rwc".to_string()
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub tiers: TierThresholds,
    #[serde(default)]
    pub routing: LaunchRouting,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub scheduler: LocalSchedulerConfig,
    #[serde(default)]
    pub platform: LocalPlatformConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            logging: LoggingSettings::default(),
            tiers: TierThresholds::default(),
            routing: LaunchRouting::default(),
            supervisor: SupervisorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            sensor: SensorConfig::default(),
            queue: QueueSettings::default(),
            scheduler: LocalSchedulerConfig::default(),
            platform: LocalPlatformConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load, override from the environment, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            return Err(Error::config(format!("failed to read .env: {e}")));
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config = serde_json::from_str(&raw).map_err(|e| {
            Error::config(format!("invalid config file {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Apply `TIERFLOW_*` overrides read through `lookup`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TIERFLOW_DATABASE_URL") {
            self.database_url = url;
        }

        if let Some(filter) = lookup("TIERFLOW_LOG_FILTER") {
            self.logging.filter = Some(filter);
        }
        if let Some(format) = lookup("TIERFLOW_LOG_FORMAT") {
            self.logging.format = match format.trim().to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => {
                    return Err(Error::config(format!(
                        "TIERFLOW_LOG_FORMAT must be 'text' or 'json' (got '{other}')"
                    )));
                }
            };
        }
        if let Some(dir) = lookup("TIERFLOW_LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(dir));
        }

        if let Some(v) = parse_var(&lookup, "TIERFLOW_MEDIUM_MIN_BYTES")? {
            self.tiers.medium_min_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "TIERFLOW_LARGE_MIN_BYTES")? {
            self.tiers.large_min_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "TIERFLOW_XLARGE_MIN_BYTES")? {
            self.tiers.xlarge_min_bytes = v;
        }

        if let Some(raw) = lookup("TIERFLOW_FUNCTION_MAX_TIER") {
            self.routing.function_max_tier = match raw.trim() {
                "" | "none" => None,
                tier => Some(tier.parse::<SizeTier>()?),
            };
        }

        for tier in SizeTier::ALL {
            let name = format!("TIERFLOW_TASK_DEFINITION_{}", tier.as_str().to_ascii_uppercase());
            if let Some(key) = lookup(&name) {
                self.supervisor.tier_task_definitions.insert(tier, key);
            }
        }
        if let Some(v) = parse_var(&lookup, "TIERFLOW_POLL_INTERVAL_MS")? {
            self.supervisor.poll_interval_ms = v;
            self.supervisor.log_poll_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "TIERFLOW_FUNCTION_TIMEOUT_SECS")? {
            self.supervisor.function_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "TIERFLOW_CONTAINER_TIMEOUT_SECS")? {
            self.supervisor.container_timeout_secs = v;
        }

        if let Some(v) = parse_var(&lookup, "TIERFLOW_QUEUE_BATCH_SIZE")? {
            self.dispatcher.max_messages = v;
        }
        if let Some(v) = parse_var(&lookup, "TIERFLOW_QUEUE_WAIT_MS")? {
            self.dispatcher.wait_time_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "TIERFLOW_MAX_RECEIVE_COUNT")? {
            self.dispatcher.max_receive_count = v;
        }
        if let Some(v) = parse_var(&lookup, "TIERFLOW_VISIBILITY_TIMEOUT_SECS")? {
            self.queue.visibility_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "TIERFLOW_SENSOR_INTERVAL_SECS")? {
            self.sensor.interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "TIERFLOW_MAX_CONCURRENT_RUNS")? {
            self.scheduler.max_concurrent_runs = v;
        }
        if let Some(dir) = lookup("TIERFLOW_TASK_LOG_DIR") {
            self.platform.log_dir = PathBuf::from(dir);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.tiers.validate()?;
        self.supervisor.validate()?;
        self.dispatcher.validate()?;

        if self.sensor.interval_secs == 0 {
            return Err(Error::config("sensor.interval_secs must be non-zero"));
        }
        if self.queue.visibility_timeout_secs == 0 {
            return Err(Error::config("queue.visibility_timeout_secs must be non-zero"));
        }
        if self.scheduler.max_concurrent_runs == 0 || self.scheduler.max_pending_runs == 0 {
            return Err(Error::config("scheduler limits must be non-zero"));
        }
        if self.platform.max_page_bytes == 0 {
            return Err(Error::config("platform.max_page_bytes must be non-zero"));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::config(format!("{name}='{raw}' is invalid: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MIB;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tiers.medium_min_bytes, 50 * MIB);
        assert_eq!(config.sensor.interval_secs, 30);
        assert_eq!(config.dispatcher.max_messages, 10);
    }

    #[test]
    fn test_partial_json() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "tiers": { "medium_min_bytes": 1000 },
                "routing": { "function_max_tier": null },
                "dispatcher": { "partial_message_policy": "ack_valid" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.tiers.medium_min_bytes, 1000);
        assert_eq!(config.tiers.large_min_bytes, 200 * MIB);
        assert_eq!(config.routing.function_max_tier, None);
        assert_eq!(
            config.dispatcher.partial_message_policy,
            crate::sensor::PartialMessagePolicy::AckValid
        );
        assert_eq!(config.database_url, "sqlite:tierflow.db?mode=rwc");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_overrides_from(lookup(&[
                ("TIERFLOW_QUEUE_BATCH_SIZE", "5"),
                ("TIERFLOW_CONTAINER_TIMEOUT_SECS", "1200"),
                ("TIERFLOW_TASK_DEFINITION_XLARGE", "big-box"),
                ("TIERFLOW_FUNCTION_MAX_TIER", "none"),
                ("TIERFLOW_LOG_FORMAT", "JSON"),
                ("TIERFLOW_MAX_RECEIVE_COUNT", "3"),
            ]))
            .unwrap();

        assert_eq!(config.dispatcher.max_messages, 5);
        assert_eq!(config.dispatcher.max_receive_count, 3);
        assert_eq!(config.supervisor.container_timeout_secs, 1200);
        assert_eq!(
            config.supervisor.tier_task_definitions[&SizeTier::Xlarge],
            "big-box"
        );
        assert_eq!(config.routing.function_max_tier, None);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_override() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides_from(lookup(&[("TIERFLOW_QUEUE_WAIT_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("TIERFLOW_QUEUE_WAIT_MS"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.dispatcher.max_messages = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.tiers.large_min_bytes = config.tiers.xlarge_min_bytes;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.supervisor.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tierflow.json");
        std::fs::write(
            &path,
            r#"{"sensor": {"interval_secs": 5}, "platform": {"log_dir": "/tmp/logs"}}"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.sensor.interval_secs, 5);
        assert_eq!(config.platform.log_dir, PathBuf::from("/tmp/logs"));

        assert!(AppConfig::from_file(&dir.path().join("missing.json")).is_err());
    }
}
