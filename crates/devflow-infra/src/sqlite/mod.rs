//! SQLite storage layer.
//!
//! Run records and resume checkpoints backed by SQLite in WAL mode with
//! split read/write connection pools.

pub mod pool;
pub mod run;

pub use pool::DatabasePool;
pub use run::SqliteRunRepository;
