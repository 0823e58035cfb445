//! Shared command state: data directory, database and engine configuration.

use std::path::Path;

use anyhow::{Context, Result};
use devflow_infra::config::{CONFIG_FILE, default_data_dir, load_engine_config, load_engine_config_strict};
use devflow_infra::sqlite::{DatabasePool, SqliteRunRepository};
use devflow_infra::sqlite::pool::DATABASE_FILE;
use devflow_types::config::EngineConfig;

/// What a command needs to touch persisted runs.
pub struct AppState {
    pub config: EngineConfig,
    pub pool: DatabasePool,
}

impl AppState {
    /// Open the data directory (creating it) and the run database.
    pub async fn init(config_path: Option<&Path>) -> Result<Self> {
        let data_dir = default_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_config(&data_dir, config_path).await?;

        let url = format!("sqlite://{}", data_dir.join(DATABASE_FILE).display());
        let pool = DatabasePool::new(&url)
            .await
            .with_context(|| format!("failed to open run database at {url}"))?;
        tracing::debug!(data_dir = %data_dir.display(), "application state ready");

        Ok(Self { config, pool })
    }

    pub fn runs(&self) -> SqliteRunRepository {
        SqliteRunRepository::new(self.pool.clone())
    }
}

/// An explicit `--config` must load cleanly; the data directory's
/// `config.toml` falls back to defaults.
pub async fn load_config(data_dir: &Path, explicit: Option<&Path>) -> Result<EngineConfig> {
    match explicit {
        Some(path) => load_engine_config_strict(path)
            .await
            .with_context(|| format!("invalid configuration {}", path.display())),
        None => Ok(load_engine_config(&data_dir.join(CONFIG_FILE)).await),
    }
}
