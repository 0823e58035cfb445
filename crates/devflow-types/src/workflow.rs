//! Workflow domain types for devflow.
//!
//! Two representations live here. [`WorkflowDocument`] is the on-disk YAML
//! shape: permissive in field optionality, strict about unknown fields.
//! [`WorkflowDefinition`] is the validated, strongly-typed form the engine
//! executes; every step kind carries exactly the fields it needs. Conversion
//! and validation happen in `devflow-core::workflow::definition`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Generator name used when a generation step does not name a target.
pub const DEFAULT_GENERATOR: &str = "default";

/// Loop variable name used when a loop step omits `as`.
pub const DEFAULT_LOOP_VAR: &str = "item";

// ---------------------------------------------------------------------------
// Workflow document (YAML wire format)
// ---------------------------------------------------------------------------

/// A workflow document as written by users.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Names of run inputs the caller must supply.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    /// Initial context variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub settings: SettingsDocument,
    pub steps: Vec<StepDocument>,
}

/// Run-level settings block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fan_out: Option<usize>,
    /// Run-level cost ceiling (overrides the configured run limit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DurationValue>,
}

/// Step kind discriminator in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKindTag {
    Action,
    Generate,
    Conditional,
    Parallel,
    Loop,
}

/// Error policy discriminator in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorTag {
    Fail,
    Retry,
    Continue,
    Rollback,
}

/// One step as written in the document. Which fields are meaningful depends
/// on `kind`; the definition parser rejects fields that do not apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDocument {
    pub name: String,
    pub kind: StepKindTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    // action / generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Result path -> context variable name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualitySpec>,

    // policy and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnErrorTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DurationValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo: Option<Box<StepDocument>>,

    // conditional / parallel
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepDocument>,
    #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
    pub else_steps: Vec<StepDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fan_out: Option<usize>,

    // loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over: Option<String>,
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub loop_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Box<StepDocument>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
}

/// A duration written either as a number of seconds or as a suffixed string
/// (`"750ms"`, `"5s"`, `"2m"`, `"1h"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(f64),
    Text(String),
}

impl DurationValue {
    /// Convert to a [`Duration`], rejecting negative, non-finite and
    /// malformed values.
    pub fn to_duration(&self) -> Result<Duration, String> {
        match self {
            DurationValue::Seconds(secs) => seconds_to_duration(*secs),
            DurationValue::Text(text) => {
                let text = text.trim();
                let split = text
                    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                    .unwrap_or(text.len());
                let (number, unit) = text.split_at(split);
                let value: f64 = number
                    .parse()
                    .map_err(|_| format!("invalid duration '{text}'"))?;
                let secs = match unit.trim() {
                    "" | "s" | "sec" | "secs" => value,
                    "ms" => value / 1000.0,
                    "m" | "min" | "mins" => value * 60.0,
                    "h" => value * 3600.0,
                    other => return Err(format!("unknown duration unit '{other}' in '{text}'")),
                };
                seconds_to_duration(secs)
            }
        }
    }
}

fn seconds_to_duration(secs: f64) -> Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration {secs}"));
    }
    Ok(Duration::from_secs_f64(secs))
}

// ---------------------------------------------------------------------------
// Typed definition
// ---------------------------------------------------------------------------

/// A parsed and validated workflow. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    pub steps: Vec<StepSpec>,
    /// Hex SHA-256 of the canonical JSON form of the document.
    pub fingerprint: String,
}

impl WorkflowDefinition {
    /// Find a step anywhere in the tree by name.
    pub fn find_step(&self, name: &str) -> Option<&StepSpec> {
        find_in(&self.steps, name)
    }

    /// Index of the top-level step that is or contains `name`.
    pub fn top_level_index(&self, name: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.name == name || find_in(step.children(), name).is_some())
    }
}

fn find_in<'a>(steps: impl IntoIterator<Item = &'a StepSpec>, name: &str) -> Option<&'a StepSpec> {
    for step in steps {
        if step.name == name {
            return Some(step);
        }
        if let Some(found) = find_in(step.children(), name) {
            return Some(found);
        }
    }
    None
}

/// Run-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fan_out: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

/// One executable step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub kind: StepKind,
    /// Input expressions, resolved against the context before invocation.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Result path -> context variable name.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub policy: ErrorPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Per-step cost ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_limit: Option<f64>,
    /// Declared cost estimate, preferred over any heuristic prediction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    /// Skip the step when this expression is falsy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Compensating action run when a later step triggers rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo: Option<Box<StepSpec>>,
}

impl StepSpec {
    /// The capability this step calls, for leaf steps.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            StepKind::ExternalAction { target, .. } | StepKind::GenerationAction { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }

    /// True for steps the step executor runs directly.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self.kind,
            StepKind::ExternalAction { .. } | StepKind::GenerationAction { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StepKind::ExternalAction { .. } => "action",
            StepKind::GenerationAction { .. } => "generate",
            StepKind::Conditional { .. } => "conditional",
            StepKind::ParallelGroup { .. } => "parallel",
            StepKind::Loop { .. } => "loop",
        }
    }

    /// Directly nested steps (not including `undo`).
    pub fn children(&self) -> Vec<&StepSpec> {
        match &self.kind {
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => then_steps.iter().chain(else_steps.iter()).collect(),
            StepKind::ParallelGroup { steps, .. } => steps.iter().collect(),
            StepKind::Loop { step, .. } => vec![step.as_ref()],
            _ => Vec::new(),
        }
    }
}

/// The closed set of step kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Call a named operation on an external service.
    ExternalAction { target: String, action: String },
    /// Produce an artifact through a generator, then run quality gates.
    GenerationAction {
        target: String,
        prompt: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
        #[serde(default)]
        quality: QualitySpec,
    },
    /// Run `then_steps` when the condition holds, otherwise `else_steps`.
    Conditional {
        condition: String,
        then_steps: Vec<StepSpec>,
        #[serde(default)]
        else_steps: Vec<StepSpec>,
    },
    /// Run leaf steps concurrently.
    ParallelGroup {
        steps: Vec<StepSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_fan_out: Option<usize>,
    },
    /// Run `step` once per element of `over`.
    Loop {
        over: String,
        var: String,
        step: Box<StepSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<usize>,
    },
}

/// Quality gate options for a generation step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualitySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub requires_tests: bool,
    /// Bypass the gate pipeline entirely.
    #[serde(default)]
    pub skip: bool,
}

/// What to do once a step has failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ErrorPolicy {
    Fail,
    Retry {
        max_attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backoff: Option<BackoffSpec>,
    },
    Continue,
    /// Undo every earlier successful step (each through its own `undo`),
    /// newest first.
    Rollback,
}

impl ErrorPolicy {
    /// Invocation attempts allowed under this policy.
    pub fn max_attempts(&self) -> u32 {
        match self {
            ErrorPolicy::Retry { max_attempts, .. } => (*max_attempts).max(1),
            _ => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorPolicy::Fail => "fail",
            ErrorPolicy::Retry { .. } => "retry",
            ErrorPolicy::Continue => "continue",
            ErrorPolicy::Rollback => "rollback",
        }
    }
}

/// Per-step backoff override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ms: Option<u64>,
}
