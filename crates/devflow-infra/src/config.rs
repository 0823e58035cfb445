//! Engine configuration loader.
//!
//! Reads a TOML file into [`EngineConfig`]. The lenient loader falls back to
//! defaults when the file is missing or malformed; the strict loader reports
//! why instead.

use std::path::{Path, PathBuf};

use devflow_types::config::{EngineConfig, MIN_RPS};
use thiserror::Error;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "DEVFLOW_DATA_DIR";

/// Configuration file name inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration in {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// `DEVFLOW_DATA_DIR` when set, otherwise `~/.devflow`.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".devflow")
}

/// Load engine configuration from `path`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable, malformed or out-of-range file: logs a warning and returns
///   the default.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    match load_engine_config_strict(path).await {
        Ok(config) => config,
        Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            EngineConfig::default()
        }
    }
}

/// Load engine configuration from `path`, failing on any problem.
pub async fn load_engine_config_strict(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let config: EngineConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    validate(&config).map_err(|message| ConfigError::Invalid {
        path: path.to_path_buf(),
        message,
    })?;
    Ok(config)
}

fn validate(config: &EngineConfig) -> Result<(), String> {
    if config.default_step_timeout_secs == 0 {
        return Err("default_step_timeout_secs must be positive".to_string());
    }
    if config.max_fan_out == 0 {
        return Err("max_fan_out must be at least 1".to_string());
    }
    if config.retry.default_max_attempts == 0 {
        return Err("retry.default_max_attempts must be at least 1".to_string());
    }
    if !(0.0..1.0).contains(&config.retry.jitter_ratio) {
        return Err("retry.jitter_ratio must be in [0, 1)".to_string());
    }

    let limits = &config.rate_limits;
    for (name, rps) in limits
        .default_rps
        .iter()
        .map(|rps| ("rate_limits.default_rps".to_string(), *rps))
        .chain(
            limits
                .targets
                .iter()
                .map(|(target, rps)| (format!("rate_limits.targets.{target}"), *rps)),
        )
    {
        if !rps.is_finite() || rps < 0.0 || (rps > 0.0 && rps < MIN_RPS) {
            return Err(format!("{name} must be 0 or at least {MIN_RPS} requests per second"));
        }
    }

    let budget = &config.budget;
    for (name, value) in [
        ("budget.monthly_limit", budget.monthly_limit),
        ("budget.run_limit", budget.run_limit),
        ("budget.step_limit", budget.step_limit),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(format!("{name} must be a non-negative number"));
        }
    }
    if !(budget.warning_ratio > 0.0 && budget.warning_ratio <= 1.0) {
        return Err("budget.warning_ratio must be in (0, 1]".to_string());
    }

    let quality = &config.quality;
    if !(0.0..=1.0).contains(&quality.approve_threshold)
        || !(0.0..=1.0).contains(&quality.review_threshold)
    {
        return Err("quality thresholds must be in [0, 1]".to_string());
    }
    if quality.review_threshold > quality.approve_threshold {
        return Err("quality.review_threshold must not exceed approve_threshold".to_string());
    }

    for price in &config.pricing {
        if price.input_cost_per_million < 0.0 || price.output_cost_per_million < 0.0 {
            return Err(format!("negative pricing for '{}'", price.model_pattern));
        }
    }
    for (name, target) in &config.targets {
        if !target.cost_per_call.is_finite() || target.cost_per_call < 0.0 {
            return Err(format!("targets.{name}.cost_per_call must be non-negative"));
        }
    }
    Ok(())
}
