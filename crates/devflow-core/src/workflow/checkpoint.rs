//! Durable checkpoints for workflow runs.
//!
//! Wraps `RunRepository` with the operations the engine needs: persist the
//! run record as it advances, save the resume point after each top-level
//! step, and restore it when a run is resumed.

use chrono::Utc;
use devflow_types::run::{RunCheckpoint, RunResult, RunStatus};
use uuid::Uuid;

use super::context::ExecutionContext;
use crate::repository::run::RunRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists run records and resume checkpoints.
///
/// Generic over `R: RunRepository` so it works with any storage backend
/// (SQLite, in-memory).
pub struct CheckpointManager<R: RunRepository> {
    repo: R,
}

impl<R: RunRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Run records
    // -----------------------------------------------------------------------

    pub async fn record_start(&self, run: &RunResult) -> Result<(), CheckpointError> {
        self.repo
            .create_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run.run_id, "recorded run start");
        Ok(())
    }

    /// Rewrite the run record with its current state.
    pub async fn record_progress(&self, run: &RunResult) -> Result<(), CheckpointError> {
        self.repo
            .update_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(
            run_id = %run.run_id,
            status = %run.status,
            steps = run.steps.len(),
            "recorded run progress"
        );
        Ok(())
    }

    /// Persist a terminal run record and drop its checkpoint.
    pub async fn record_finish(&self, run: &RunResult) -> Result<(), CheckpointError> {
        self.record_progress(run).await?;
        self.repo
            .delete_checkpoint(&run.run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Resume checkpoints
    // -----------------------------------------------------------------------

    /// Save the resume point: the next top-level step plus the state needed
    /// to continue from it.
    pub async fn save(
        &self,
        run: &RunResult,
        ctx: &ExecutionContext,
        next_step: usize,
    ) -> Result<(), CheckpointError> {
        let checkpoint = RunCheckpoint {
            run_id: run.run_id,
            fingerprint: run.fingerprint.clone(),
            next_step,
            context: ctx.snapshot(),
            steps: run.steps.clone(),
            total_cost: run.total_cost,
            saved_at: Utc::now(),
        };
        self.repo
            .save_checkpoint(&checkpoint)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run.run_id, next_step, "saved checkpoint");
        Ok(())
    }

    /// Load what a resumed run needs: its record and latest checkpoint.
    ///
    /// Refuses runs that already finished and checkpoints taken against a
    /// different definition.
    pub async fn restore(
        &self,
        run_id: Uuid,
        fingerprint: &str,
    ) -> Result<(RunResult, RunCheckpoint), CheckpointError> {
        let run = self
            .repo
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))?;

        if run.status.is_terminal() {
            return Err(CheckpointError::AlreadyFinished {
                run_id,
                status: run.status,
            });
        }

        let checkpoint = self
            .repo
            .load_checkpoint(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::NoCheckpoint(run_id))?;

        if checkpoint.fingerprint != fingerprint {
            return Err(CheckpointError::DefinitionChanged {
                run_id,
                expected: checkpoint.fingerprint,
                actual: fingerprint.to_string(),
            });
        }

        Ok((run, checkpoint))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run {0} has no checkpoint to resume from")]
    NoCheckpoint(Uuid),

    #[error("run {run_id} already finished with status {status}")]
    AlreadyFinished { run_id: Uuid, status: RunStatus },

    #[error("run {run_id} was started from definition {expected}, not {actual}")]
    DefinitionChanged {
        run_id: Uuid,
        expected: String,
        actual: String,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
