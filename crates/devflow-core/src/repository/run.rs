//! Run repository trait definition.
//!
//! Stores run records (the full `RunResult`, rewritten as the run advances)
//! and the latest resume checkpoint per run.

use devflow_types::error::RepositoryError;
use devflow_types::run::{RunCheckpoint, RunResult};
use uuid::Uuid;

/// Repository trait for workflow run persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record. Fails with `Conflict` if the id exists.
    fn create_run(
        &self,
        run: &RunResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace a run record. Fails with `NotFound` if it was never created.
    fn update_run(
        &self,
        run: &RunResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<RunResult>, RepositoryError>> + Send;

    /// Most recent runs first.
    fn list_runs(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<RunResult>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Upsert the checkpoint for a run.
    fn save_checkpoint(
        &self,
        checkpoint: &RunCheckpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<RunCheckpoint>, RepositoryError>> + Send;

    /// Drop a run's checkpoint once the run is terminal.
    fn delete_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
