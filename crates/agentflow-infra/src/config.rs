//! Engine configuration loader for AgentFlow.
//!
//! Reads `config.toml` from the data directory (`~/.agentflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use agentflow_types::config::EngineConfig;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

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

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Resolve the concurrency limit for one run.
///
/// Priority:
/// 1. Command-line override
/// 2. Limit declared by the workflow
/// 3. `default_concurrency` from `config.toml`
///
/// The result is never below 1.
pub fn resolve_concurrency(
    config: &EngineConfig,
    declared: Option<usize>,
    cli_override: Option<usize>,
) -> usize {
    cli_override
        .or(declared)
        .unwrap_or(config.default_concurrency)
        .max(1)
}
