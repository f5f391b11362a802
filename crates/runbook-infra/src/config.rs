//! Configuration loader for the runbook engine.
//!
//! Reads `config.toml` from the data directory (`~/.runbook/` in production)
//! and deserializes it into [`RunbookConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::Path;

use runbook_types::config::RunbookConfig;

/// Smallest accepted step timeout.
const MIN_STEP_TIMEOUT_SECS: u64 = 1;

/// Load configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`RunbookConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config with zero values clamped to usable minimums.
pub async fn load_config(data_dir: &Path) -> RunbookConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return RunbookConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return RunbookConfig::default();
        }
    };

    match toml::from_str::<RunbookConfig>(&content) {
        Ok(config) => clamp(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            RunbookConfig::default()
        }
    }
}

fn clamp(mut config: RunbookConfig) -> RunbookConfig {
    config.step_timeout_secs = config.step_timeout_secs.max(MIN_STEP_TIMEOUT_SECS);
    config.default_max_passes = config.default_max_passes.max(1);
    config.event_capacity = config.event_capacity.max(1);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use runbook_types::config::SessionBackend;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).await;
        assert_eq!(config, RunbookConfig::default());
    }

    #[tokio::test]
    async fn load_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
max_invoke_depth = 3
step_timeout_secs = 10
session_backend = "sqlite"
shell = "bash"
"#,
        )
        .await
        .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.max_invoke_depth, 3);
        assert_eq!(config.step_timeout_secs, 10);
        assert_eq!(config.session_backend, SessionBackend::Sqlite);
        assert_eq!(config.shell, "bash");
        assert_eq!(config.default_max_passes, 5);
    }

    #[tokio::test]
    async fn load_config_malformed_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "max_invoke_depth = [")
            .await
            .unwrap();
        let config = load_config(tmp.path()).await;
        assert_eq!(config, RunbookConfig::default());
    }

    #[tokio::test]
    async fn load_config_clamps_zero_values() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            "step_timeout_secs = 0\ndefault_max_passes = 0\n",
        )
        .await
        .unwrap();
        let config = load_config(tmp.path()).await;
        assert_eq!(config.step_timeout_secs, 1);
        assert_eq!(config.default_max_passes, 1);
    }
}
