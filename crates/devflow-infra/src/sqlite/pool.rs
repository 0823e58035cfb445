//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite admits a single writer. Run records are rewritten after every step
//! while the CLI may be listing runs, so reads get their own pool and writes
//! are serialized through a one-connection pool.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::default_data_dir;

/// Database file name inside the data directory.
pub const DATABASE_FILE: &str = "devflow.db";

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: up to 8 connections, opened read-only.
/// - `writer`: a single connection for INSERT/UPDATE/DELETE.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open both pools and apply pending migrations on the writer first.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await?;

        // The reader is read-only, so the schema must exist before it opens.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(base_opts.read_only(true))
            .await?;

        tracing::debug!(url = database_url, "database pool ready");
        Ok(Self { reader, writer })
    }

    /// Open the database at `{data_dir}/devflow.db`, creating the directory.
    pub async fn open_default() -> Result<Self, sqlx::Error> {
        let dir = default_data_dir();
        tokio::fs::create_dir_all(&dir).await?;
        Self::new(&default_database_url()).await
    }
}

/// `sqlite://` URL of the database in the default data directory.
pub fn default_database_url() -> String {
    format!(
        "sqlite://{}",
        default_data_dir().join(DATABASE_FILE).display()
    )
}
