//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `devflow-core`. The full `RunResult` is
//! stored as a JSON blob next to the columns used for listing; checkpoints
//! keep their context and step results as JSON as well.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use devflow_core::repository::RunRepository;
use devflow_types::error::RepositoryError;
use devflow_types::run::{RunCheckpoint, RunResult, StepResult};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    result: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            result: row.try_get("result")?,
        })
    }

    fn into_run(self) -> Result<RunResult, RepositoryError> {
        let id = parse_uuid(&self.id)?;
        let run: RunResult = serde_json::from_str(&self.result)
            .map_err(|e| RepositoryError::Query(format!("invalid run JSON for {id}: {e}")))?;
        if run.run_id != id {
            return Err(RepositoryError::Query(format!(
                "run row {id} holds result for {}",
                run.run_id
            )));
        }
        Ok(run)
    }
}

struct CheckpointRow {
    run_id: String,
    fingerprint: String,
    next_step: i64,
    context: String,
    steps: String,
    total_cost: f64,
    saved_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            fingerprint: row.try_get("fingerprint")?,
            next_step: row.try_get("next_step")?,
            context: row.try_get("context")?,
            steps: row.try_get("steps")?,
            total_cost: row.try_get("total_cost")?,
            saved_at: row.try_get("saved_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<RunCheckpoint, RepositoryError> {
        let next_step = usize::try_from(self.next_step).map_err(|_| {
            RepositoryError::Query(format!("invalid next_step: {}", self.next_step))
        })?;
        let context: BTreeMap<String, serde_json::Value> = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?;
        let steps: Vec<StepResult> = serde_json::from_str(&self.steps)
            .map_err(|e| RepositoryError::Query(format!("invalid steps JSON: {e}")))?;

        Ok(RunCheckpoint {
            run_id: parse_uuid(&self.run_id)?,
            fingerprint: self.fingerprint,
            next_step,
            context,
            steps,
            total_cost: self.total_cost,
            saved_at: parse_datetime(&self.saved_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_run(&self, run: &RunResult) -> Result<(), RepositoryError> {
        let result = to_json(run, "run")?;
        let started_at = format_datetime(&run.started_at);
        let completed_at = run.completed_at.as_ref().map(format_datetime);

        let outcome = sqlx::query(
            r#"INSERT INTO runs (id, workflow, fingerprint, status, total_cost, result, started_at, completed_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.workflow)
        .bind(&run.fingerprint)
        .bind(run.status.to_string())
        .bind(run.total_cost)
        .bind(&result)
        .bind(&started_at)
        .bind(&completed_at)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("run {} already exists", run.run_id)),
            ),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn update_run(&self, run: &RunResult) -> Result<(), RepositoryError> {
        let result = to_json(run, "run")?;
        let completed_at = run.completed_at.as_ref().map(format_datetime);

        let updated = sqlx::query(
            r#"UPDATE runs
               SET status = ?, total_cost = ?, result = ?, completed_at = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(run.status.to_string())
        .bind(run.total_cost)
        .bind(&result)
        .bind(&completed_at)
        .bind(format_datetime(&Utc::now()))
        .bind(run.run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunResult>, RepositoryError> {
        let row = sqlx::query("SELECT id, result FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<RunResult>, RepositoryError> {
        let rows = sqlx::query("SELECT id, result FROM runs ORDER BY started_at DESC, id DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                RunRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_run()
            })
            .collect()
    }

    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<(), RepositoryError> {
        let context = to_json(&checkpoint.context, "checkpoint context")?;
        let steps = to_json(&checkpoint.steps, "checkpoint steps")?;
        let next_step = i64::try_from(checkpoint.next_step)
            .map_err(|_| RepositoryError::Query("next_step out of range".to_string()))?;

        let outcome = sqlx::query(
            r#"INSERT INTO run_checkpoints (run_id, fingerprint, next_step, context, steps, total_cost, saved_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                 fingerprint = excluded.fingerprint,
                 next_step = excluded.next_step,
                 context = excluded.context,
                 steps = excluded.steps,
                 total_cost = excluded.total_cost,
                 saved_at = excluded.saved_at"#,
        )
        .bind(checkpoint.run_id.to_string())
        .bind(&checkpoint.fingerprint)
        .bind(next_step)
        .bind(&context)
        .bind(&steps)
        .bind(checkpoint.total_cost)
        .bind(format_datetime(&checkpoint.saved_at))
        .execute(&self.pool.writer)
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("FOREIGN KEY") => {
                Err(RepositoryError::NotFound)
            }
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn load_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<RunCheckpoint>, RepositoryError> {
        let row = sqlx::query(
            "SELECT run_id, fingerprint, next_step, context, steps, total_cost, saved_at FROM run_checkpoints WHERE run_id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn delete_checkpoint(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM run_checkpoints WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use devflow_core::capability::{ActionOutcome, CapabilityError, CapabilityTable, ExternalAction};
    use devflow_core::workflow::{WorkflowEngine, parse_workflow_yaml};
    use devflow_types::config::EngineConfig;
    use devflow_types::run::{RunFailure, RunStatus, StepErrorKind};
    use serde_json::json;

    async fn test_repo() -> (SqliteRunRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("runs.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteRunRepository::new(pool), dir)
    }

    fn make_run(workflow: &str) -> RunResult {
        RunResult::new(Uuid::now_v7(), workflow, "f1ngerprint")
    }

    #[tokio::test]
    async fn test_create_get_update_run() {
        let (repo, _dir) = test_repo().await;
        let mut run = make_run("triage");
        repo.create_run(&run).await.unwrap();

        let loaded = repo.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow, "triage");
        assert_eq!(loaded.status, RunStatus::Pending);

        run.status = RunStatus::Failed;
        run.total_cost = 1.25;
        run.steps.push(StepResult::skipped("notify"));
        run.failure = Some(RunFailure {
            step: "publish".to_string(),
            kind: StepErrorKind::BudgetExceeded,
            message: "over budget".to_string(),
            attempts: 0,
        });
        run.outputs.insert("issue".to_string(), json!({ "id": 7 }));
        run.completed_at = Some(Utc::now());
        repo.update_run(&run).await.unwrap();

        let loaded = repo.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert!((loaded.total_cost - 1.25).abs() < f64::EPSILON);
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.failure.unwrap().kind, StepErrorKind::BudgetExceeded);
        assert_eq!(loaded.outputs["issue"]["id"], 7);
        assert!(loaded.completed_at.is_some());

        let status: (String,) = sqlx::query_as("SELECT status FROM runs WHERE id = ?")
            .bind(run.run_id.to_string())
            .fetch_one(&repo.pool.reader)
            .await
            .unwrap();
        assert_eq!(status.0, "failed");
    }

    #[tokio::test]
    async fn test_duplicate_run_conflicts() {
        let (repo, _dir) = test_repo().await;
        let run = make_run("triage");
        repo.create_run(&run).await.unwrap();
        let err = repo.create_run(&run).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_unknown_run_not_found() {
        let (repo, _dir) = test_repo().await;
        let err = repo.update_run(&make_run("ghost")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
        assert!(repo.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_runs_newest_first() {
        let (repo, _dir) = test_repo().await;
        let now = Utc::now();
        for (name, age) in [("old", 30), ("newest", 0), ("middle", 10)] {
            let mut run = make_run(name);
            run.started_at = now - Duration::minutes(age);
            repo.create_run(&run).await.unwrap();
        }

        let runs = repo.list_runs(10).await.unwrap();
        let names: Vec<&str> = runs.iter().map(|r| r.workflow.as_str()).collect();
        assert_eq!(names, vec!["newest", "middle", "old"]);

        assert_eq!(repo.list_runs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_upsert_load_delete() {
        let (repo, _dir) = test_repo().await;
        let run = make_run("release");
        repo.create_run(&run).await.unwrap();

        let mut checkpoint = RunCheckpoint {
            run_id: run.run_id,
            fingerprint: run.fingerprint.clone(),
            next_step: 1,
            context: BTreeMap::from([("branch".to_string(), json!("release/1.2"))]),
            steps: vec![StepResult::skipped("prepare")],
            total_cost: 0.5,
            saved_at: Utc::now(),
        };
        repo.save_checkpoint(&checkpoint).await.unwrap();

        checkpoint.next_step = 2;
        checkpoint.total_cost = 0.75;
        repo.save_checkpoint(&checkpoint).await.unwrap();

        let loaded = repo.load_checkpoint(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.next_step, 2);
        assert!((loaded.total_cost - 0.75).abs() < f64::EPSILON);
        assert_eq!(loaded.context["branch"], "release/1.2");
        assert_eq!(loaded.steps[0].step, "prepare");

        repo.delete_checkpoint(&run.run_id).await.unwrap();
        assert!(repo.load_checkpoint(&run.run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_requires_run() {
        let (repo, _dir) = test_repo().await;
        let checkpoint = RunCheckpoint {
            run_id: Uuid::now_v7(),
            fingerprint: "x".to_string(),
            next_step: 0,
            context: BTreeMap::new(),
            steps: Vec::new(),
            total_cost: 0.0,
            saved_at: Utc::now(),
        };
        let err = repo.save_checkpoint(&checkpoint).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    struct Tracker;

    impl ExternalAction for Tracker {
        async fn invoke(
            &self,
            action: &str,
            _inputs: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<ActionOutcome, CapabilityError> {
            match action {
                "get_issue" => Ok(ActionOutcome::new(json!({ "id": 7, "title": "Crash" })).with_cost(0.1)),
                _ => Err(CapabilityError::permanent(format!("unknown action {action}"))),
            }
        }
    }

    #[tokio::test]
    async fn test_engine_records_run_through_sqlite() {
        let (repo, _dir) = test_repo().await;
        let def = parse_workflow_yaml(
            r#"
name: persist
steps:
  - name: fetch
    kind: action
    target: tracker
    action: get_issue
    outputs:
      title: issue_title
  - name: close
    kind: action
    target: tracker
    action: close_issue
"#,
        )
        .unwrap();

        let engine = WorkflowEngine::new(
            repo,
            CapabilityTable::new().with_action("tracker", Tracker),
            EngineConfig::default(),
        );
        let run = engine.execute(&def, BTreeMap::new()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let stored = engine.repo().get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.outputs["issue_title"], "Crash");
        assert_eq!(stored.failure.unwrap().step, "close");
        assert!((stored.total_cost - 0.1).abs() < 1e-9);
        assert!(engine.repo().load_checkpoint(&run.run_id).await.unwrap().is_none());
    }
}
