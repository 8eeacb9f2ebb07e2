//! Engine configuration loader.
//!
//! Reads `config.toml` from a config directory and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::Path;

use stepwise_core::workflow::definition::validate_retry_policy;
use stepwise_types::config::EngineConfig;

/// Load engine configuration from `{config_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the parsed default retry policy is invalid, logs a warning and keeps
///   the rest of the file but resets the policy.
/// - A zero `idempotency_poll_interval_ms` is reset to the default.
pub async fn load_engine_config(config_dir: &Path) -> EngineConfig {
    let config_path = config_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    let mut config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
    };

    if let Err(err) = validate_retry_policy(&config.default_retry_policy) {
        tracing::warn!(
            "Invalid default_retry_policy in {}: {err}, using default policy",
            config_path.display()
        );
        config.default_retry_policy = EngineConfig::default().default_retry_policy;
    }

    if config.idempotency_poll_interval_ms == 0 {
        tracing::warn!(
            "idempotency_poll_interval_ms must be positive in {}, using default",
            config_path.display()
        );
        config.idempotency_poll_interval_ms = EngineConfig::default().idempotency_poll_interval_ms;
    }

    config
}
