//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `taskflow.toml` that tunes the
//! session executor loop and the schedule driver.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine.
///
/// Loaded from `~/.taskflow/taskflow.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Database URL. Defaults to `sqlite://{data_dir}/taskflow.db`.
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Tuning knobs of the session executor loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// First wait after an idle pass, in milliseconds.
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,

    /// Upper bound of the idle wait, in milliseconds.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// READY task ids fetched per pass.
    #[serde(default = "default_ready_batch_size")]
    pub ready_batch_size: u32,

    /// Concurrent enqueue workers per pass.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,

    /// Page size for state and change scans.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_min_wait_ms() -> u64 {
    100
}

fn default_max_wait_ms() -> u64 {
    2_000
}

fn default_ready_batch_size() -> u32 {
    100
}

fn default_dispatch_concurrency() -> usize {
    8
}

fn default_page_size() -> u32 {
    100
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_wait_ms: default_min_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            ready_batch_size: default_ready_batch_size(),
            dispatch_concurrency: default_dispatch_concurrency(),
            page_size: default_page_size(),
        }
    }
}

/// Schedule driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_schedule_enabled")]
    pub enabled: bool,

    /// Seconds between lock attempts on due schedules.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_schedule_enabled() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    1
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: default_schedule_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert!(config.database_url.is_none());
        assert_eq!(config.executor.min_wait_ms, 100);
        assert_eq!(config.executor.max_wait_ms, 2_000);
        assert_eq!(config.executor.ready_batch_size, 100);
        assert!(config.schedule.enabled);
        assert_eq!(config.schedule.poll_interval_secs, 1);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.executor.dispatch_concurrency, 8);
        assert_eq!(config.executor.page_size, 100);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
database_url = "sqlite:///tmp/flows.db"

[executor]
max_wait_ms = 5000
dispatch_concurrency = 2

[schedule]
enabled = false
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database_url.as_deref(), Some("sqlite:///tmp/flows.db"));
        assert_eq!(config.executor.max_wait_ms, 5000);
        assert_eq!(config.executor.min_wait_ms, 100);
        assert_eq!(config.executor.dispatch_concurrency, 2);
        assert!(!config.schedule.enabled);
        assert_eq!(config.schedule.poll_interval_secs, 1);
    }
}
