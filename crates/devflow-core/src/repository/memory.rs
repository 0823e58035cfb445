//! In-memory run repository backed by `DashMap`.
//!
//! Clones share the same maps, so a test can hand one clone to the engine
//! and inspect another.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use devflow_types::error::RepositoryError;
use devflow_types::run::{RunCheckpoint, RunResult};
use uuid::Uuid;

use super::run::RunRepository;

#[derive(Debug, Clone, Default)]
pub struct InMemoryRunRepository {
    runs: Arc<DashMap<Uuid, RunResult>>,
    checkpoints: Arc<DashMap<Uuid, RunCheckpoint>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

impl RunRepository for InMemoryRunRepository {
    async fn create_run(&self, run: &RunResult) -> Result<(), RepositoryError> {
        match self.runs.entry(run.run_id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.run_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(())
            }
        }
    }

    async fn update_run(&self, run: &RunResult) -> Result<(), RepositoryError> {
        match self.runs.get_mut(&run.run_id) {
            Some(mut existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunResult>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<RunResult>, RepositoryError> {
        let mut runs: Vec<RunResult> = self.runs.iter().map(|r| r.clone()).collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.run_id.cmp(&a.run_id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<(), RepositoryError> {
        self.checkpoints
            .insert(checkpoint.run_id, checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<RunCheckpoint>, RepositoryError> {
        Ok(self.checkpoints.get(run_id).map(|c| c.clone()))
    }

    async fn delete_checkpoint(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        self.checkpoints.remove(run_id);
        Ok(())
    }
}
