//! Event types for the devflow event bus.
//!
//! `WorkflowEvent` is broadcast while runs execute. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quality::QualityVerdict;
use crate::run::{RunStatus, StepErrorKind};

/// Events emitted during workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        workflow: String,
    },

    StepStarted {
        run_id: Uuid,
        step: String,
        kind: String,
    },

    /// A failed attempt will be retried after `delay_ms`.
    StepRetrying {
        run_id: Uuid,
        step: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    StepCompleted {
        run_id: Uuid,
        step: String,
        duration_ms: u64,
        cost: f64,
    },

    StepFailed {
        run_id: Uuid,
        step: String,
        kind: StepErrorKind,
        error: String,
    },

    StepSkipped {
        run_id: Uuid,
        step: String,
    },

    QualityVerdict {
        run_id: Uuid,
        step: String,
        overall: f64,
        verdict: QualityVerdict,
    },

    /// A target's circuit opened after repeated failures.
    CircuitOpened {
        target: String,
        consecutive_failures: u32,
    },

    /// A target's circuit closed after successful trial calls.
    CircuitClosed {
        target: String,
    },

    /// Monthly spend crossed the warning ratio.
    BudgetWarning {
        period: String,
        spent: f64,
        limit: f64,
    },

    RollbackStarted {
        run_id: Uuid,
        failed_step: String,
    },

    StepRolledBack {
        run_id: Uuid,
        step: String,
    },

    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        total_cost: f64,
        duration_ms: u64,
    },
}

impl WorkflowEvent {
    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepRetrying { run_id, .. }
            | WorkflowEvent::StepCompleted { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::StepSkipped { run_id, .. }
            | WorkflowEvent::QualityVerdict { run_id, .. }
            | WorkflowEvent::RollbackStarted { run_id, .. }
            | WorkflowEvent::StepRolledBack { run_id, .. }
            | WorkflowEvent::RunFinished { run_id, .. } => Some(*run_id),
            WorkflowEvent::CircuitOpened { .. }
            | WorkflowEvent::CircuitClosed { .. }
            | WorkflowEvent::BudgetWarning { .. } => None,
        }
    }
}
