//! Execution context: the variable map that flows through a workflow run.
//!
//! Seeded with the workflow's `variables`, then the caller's run inputs, then
//! the reserved `run` object. Steps bind their declared outputs into it after
//! they succeed. Size limits prevent unbounded memory growth.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use super::definition::WorkflowError;
use super::resolver::Scope;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single bound value (1 MB).
pub const MAX_VALUE_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Reserved variable holding run metadata (`run.id`, `run.workflow`).
pub const RUN_VAR: &str = "run";

/// Reserved variable holding loop metadata (`loop.index`).
pub const LOOP_VAR: &str = "loop";

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable variable map for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow: String,
    variables: BTreeMap<String, Value>,
}

impl ExecutionContext {
    /// Build the initial context. Run inputs override workflow variables of
    /// the same name.
    pub fn new(
        run_id: Uuid,
        workflow: impl Into<String>,
        variables: &BTreeMap<String, Value>,
        inputs: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        let workflow = workflow.into();
        let mut map = variables.clone();
        map.extend(inputs);
        map.insert(
            RUN_VAR.to_string(),
            json!({ "id": run_id.to_string(), "workflow": workflow }),
        );
        Self {
            run_id,
            workflow,
            variables: map,
        }
    }

    /// Rebuild a context from a checkpoint snapshot.
    pub fn from_snapshot(
        run_id: Uuid,
        workflow: impl Into<String>,
        variables: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            run_id,
            workflow: workflow.into(),
            variables,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Bind a variable.
    ///
    /// Values larger than [`MAX_VALUE_SIZE`] are replaced by a truncation
    /// marker. Fails when the whole context grows past [`MAX_CONTEXT_SIZE`].
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), WorkflowError> {
        let size = serde_json::to_string(&value)
            .map_err(|e| WorkflowError::ExecutionError(e.to_string()))?
            .len();

        if size > MAX_VALUE_SIZE {
            tracing::warn!(
                variable = name,
                size,
                max = MAX_VALUE_SIZE,
                "context value exceeds size limit, truncating"
            );
            let truncated = json!({
                "_truncated": true,
                "_original_size": size,
                "_message": format!("value exceeded {MAX_VALUE_SIZE} byte limit and was truncated"),
            });
            self.variables.insert(name.to_string(), truncated);
        } else {
            self.variables.insert(name.to_string(), value);
        }

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            self.variables.remove(name);
            return Err(WorkflowError::ExecutionError(format!(
                "total context size ({total} bytes) exceeds maximum ({MAX_CONTEXT_SIZE} bytes)"
            )));
        }
        Ok(())
    }

    /// Remove a variable, returning its previous value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    /// Restore a variable to a previously saved value (or remove it).
    pub fn restore(&mut self, name: &str, previous: Option<Value>) {
        match previous {
            Some(value) => {
                self.variables.insert(name.to_string(), value);
            }
            None => {
                self.variables.remove(name);
            }
        }
    }

    /// Approximate serialized size of all variables in bytes.
    pub fn total_size(&self) -> usize {
        self.variables
            .iter()
            .map(|(k, v)| k.len() + serde_json::to_string(v).map_or(0, |s| s.len()))
            .sum()
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    /// Copy of the variable map for checkpoints and run results.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.variables.clone()
    }
}

impl Scope for ExecutionContext {
    fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}
