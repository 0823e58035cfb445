//! Span attribute names for workflow runs.
//!
//! Spans declare these fields as `tracing::field::Empty` and fill them in
//! with `Span::record`, so the names stay in one place.

/// Workflow name from the document.
pub const WORKFLOW_NAME: &str = "devflow.workflow.name";

/// SHA-256 fingerprint of the workflow definition.
pub const WORKFLOW_FINGERPRINT: &str = "devflow.workflow.fingerprint";

/// Run identifier (UUID v7).
pub const RUN_ID: &str = "devflow.run.id";

/// Terminal run status (`completed`, `failed`, `aborted`).
pub const RUN_STATUS: &str = "devflow.run.status";

/// Total cost charged to the run.
pub const RUN_COST: &str = "devflow.run.cost";

/// Number of step results recorded.
pub const RUN_STEPS: &str = "devflow.run.steps";

/// Gateway base URL serving the run's capabilities.
pub const GATEWAY_URL: &str = "devflow.gateway.url";

// --- Span names ---

pub const SPAN_RUN: &str = "workflow run";

pub const SPAN_VALIDATE: &str = "workflow validate";
