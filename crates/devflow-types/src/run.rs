//! Execution tracking types: run and step results, status enums and the
//! step error taxonomy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quality::QualityGateResult;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow run.
///
/// Legal transitions: `Pending -> Running -> {Completed, Failed, Aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Aborted)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Aborted)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "aborted" => Ok(RunStatus::Aborted),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Final status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
    RolledBack,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// A variable or expression could not be resolved.
    Resolution,
    /// The target's circuit breaker rejected the call.
    CircuitOpen,
    /// A budget reservation was denied or the actual cost overran the ceiling.
    BudgetExceeded,
    /// The capability returned an error.
    ExternalCall,
    /// The capability did not answer within the step timeout.
    Timeout,
    /// The quality pipeline asked for the artifact to be regenerated.
    QualityGateRegenerate,
    /// An undo step failed during rollback.
    RollbackFailure,
    /// The run was cancelled while the step was in flight.
    Cancelled,
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepErrorKind::Resolution => "resolution",
            StepErrorKind::CircuitOpen => "circuit_open",
            StepErrorKind::BudgetExceeded => "budget_exceeded",
            StepErrorKind::ExternalCall => "external_call",
            StepErrorKind::Timeout => "timeout",
            StepErrorKind::QualityGateRegenerate => "quality_gate_regenerate",
            StepErrorKind::RollbackFailure => "rollback_failure",
            StepErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A classified step failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
    /// Whether another attempt could succeed. Only consulted under a retry
    /// policy.
    #[serde(default)]
    pub retryable: bool,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            StepErrorKind::ExternalCall
                | StepErrorKind::Timeout
                | StepErrorKind::QualityGateRegenerate
                | StepErrorKind::CircuitOpen
        );
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// An external call failure the capability marked as permanent.
    pub fn permanent(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(kind, message)
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// One failed attempt in a step's retry history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based invocation number; 0 for circuit-open rejections that made no
    /// invocation.
    pub attempt: u32,
    pub error: StepError,
    /// Backoff waited before the next try, if one followed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub cost: f64,
}

/// Outcome of one step, after retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub status: StepStatus,
    /// Context variables this step bound.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Invocations actually made.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_log: Vec<AttemptRecord>,
    pub elapsed_ms: u64,
    /// Total cost charged across all attempts.
    pub cost: f64,
    /// Quality verdict was `RequireHumanReview`.
    #[serde(default)]
    pub review_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityGateResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    /// A step that never ran because its condition was false.
    pub fn skipped(step: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step: step.into(),
            status: StepStatus::Skipped,
            outputs: BTreeMap::new(),
            error: None,
            attempts: 0,
            attempt_log: Vec::new(),
            elapsed_ms: 0,
            cost: 0.0,
            review_required: false,
            quality: None,
            started_at: now,
            completed_at: now,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

// ---------------------------------------------------------------------------
// Run results
// ---------------------------------------------------------------------------

/// The step that ended (or degraded) a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub step: String,
    pub kind: StepErrorKind,
    pub message: String,
    pub attempts: u32,
}

/// What happened during rollback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Steps whose undo ran successfully, in the order they were undone.
    pub undone: Vec<String>,
    /// Successful steps that declared no undo and were left in place.
    pub not_reversible: Vec<String>,
    /// The undo failure that stopped rollback, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub succeeded: bool,
}

/// Complete, auditable outcome of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub workflow: String,
    pub fingerprint: String,
    pub status: RunStatus,
    /// Step results in execution order, nested steps flattened.
    pub steps: Vec<StepResult>,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
    /// Context variables at the end of the run.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunResult {
    pub fn new(run_id: Uuid, workflow: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            run_id,
            workflow: workflow.into(),
            fingerprint: fingerprint.into(),
            status: RunStatus::Pending,
            steps: Vec::new(),
            total_cost: 0.0,
            failure: None,
            rollback: None,
            outputs: BTreeMap::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Find the most recent result for a step.
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().rev().find(|s| s.step == name)
    }
}

/// Engine state persisted after each top-level step so a run can resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_id: Uuid,
    pub fingerprint: String,
    /// Index of the next top-level step to execute.
    pub next_step: usize,
    pub context: BTreeMap<String, serde_json::Value>,
    pub steps: Vec<StepResult>,
    pub total_cost: f64,
    pub saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Aborted));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_run_status_round_trip_strings() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Aborted,
        ] {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_step_error_retryability() {
        assert!(StepError::new(StepErrorKind::Timeout, "slow").retryable);
        assert!(StepError::new(StepErrorKind::ExternalCall, "503").retryable);
        assert!(StepError::new(StepErrorKind::QualityGateRegenerate, "low").retryable);
        assert!(!StepError::new(StepErrorKind::Resolution, "x").retryable);
        assert!(!StepError::new(StepErrorKind::BudgetExceeded, "x").retryable);
        assert!(!StepError::permanent(StepErrorKind::ExternalCall, "404").retryable);
    }

    #[test]
    fn test_run_result_serializes_snake_case_status() {
        let mut run = RunResult::new(Uuid::now_v7(), "triage", "abc");
        run.status = RunStatus::Completed;
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "completed");
        assert!(json.get("failure").is_none());
    }
}
