//! Engine configuration loader.
//!
//! Reads `taskflow.toml` from the data directory (`~/.taskflow/` in
//! production) and deserializes it into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::Path;

use taskflow_types::config::EngineConfig;

use crate::sqlite::pool::default_database_url;

/// Floor for the idle wait so a misconfigured loop cannot spin.
const MIN_WAIT_FLOOR_MS: u64 = 1;

/// Load engine configuration from `{data_dir}/taskflow.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config with its wait bounds normalized.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("taskflow.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No taskflow.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => normalize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Database URL of a config: the configured one, else the data-dir default.
pub fn resolve_database_url(config: &EngineConfig) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(default_database_url)
}

fn normalize(mut config: EngineConfig) -> EngineConfig {
    let executor = &mut config.executor;
    executor.min_wait_ms = executor.min_wait_ms.max(MIN_WAIT_FLOOR_MS);
    executor.max_wait_ms = executor.max_wait_ms.max(executor.min_wait_ms);
    executor.dispatch_concurrency = executor.dispatch_concurrency.max(1);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.executor.max_wait_ms, 2_000);
        assert!(config.schedule.enabled);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("taskflow.toml"),
            r#"
database_url = "sqlite:///var/lib/taskflow/flows.db"

[schedule]
poll_interval_secs = 5
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(resolve_database_url(&config), "sqlite:///var/lib/taskflow/flows.db");
        assert_eq!(config.schedule.poll_interval_secs, 5);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("taskflow.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert!(config.database_url.is_none());
        assert_eq!(config.executor.page_size, 100);
    }

    #[tokio::test]
    async fn load_engine_config_normalizes_wait_bounds() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("taskflow.toml"),
            "[executor]\nmin_wait_ms = 0\nmax_wait_ms = 0\ndispatch_concurrency = 0\n",
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.executor.min_wait_ms, 1);
        assert_eq!(config.executor.max_wait_ms, 1);
        assert_eq!(config.executor.dispatch_concurrency, 1);
    }

    #[test]
    fn resolve_database_url_falls_back_to_data_dir() {
        let url = resolve_database_url(&EngineConfig::default());
        assert!(url.ends_with("taskflow.db"));
    }
}
