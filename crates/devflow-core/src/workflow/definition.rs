//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts the YAML [`WorkflowDocument`] into the typed
//! [`WorkflowDefinition`] the engine runs. Everything that can be checked
//! without executing is checked here: field applicability per step kind,
//! policy combinations, unique step names, expression syntax, undefined and
//! forward variable references, and interdependent parallel members.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use devflow_types::workflow::{
    DEFAULT_GENERATOR, DEFAULT_LOOP_VAR, ErrorPolicy, OnErrorTag, StepDocument, StepKind,
    StepKindTag, StepSpec, WorkflowDefinition, WorkflowDocument, WorkflowSettings,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::context::{LOOP_VAR, RUN_VAR};
use super::resolver::{self, Reference, ResolveError};

/// Attempts for `on_error: retry` when `retry_count` is omitted.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during workflow operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML parse failure (including unknown fields).
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural or reference validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Runtime context failure.
    #[error("execution error: {0}")]
    ExecutionError(String),
}

/// Knobs that affect how a document is turned into a definition.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub default_max_attempts: u32,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML workflow document.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    parse_workflow_yaml_with(yaml, ParseOptions::default())
}

/// Parse and validate a YAML workflow document with explicit options.
pub fn parse_workflow_yaml_with(
    yaml: &str,
    options: ParseOptions,
) -> Result<WorkflowDefinition, WorkflowError> {
    let doc: WorkflowDocument =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    build_definition(&doc, options)
}

/// Load and validate a workflow file.
pub fn load_workflow_file(
    path: &Path,
    options: ParseOptions,
) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml_with(&content, options)
}

/// List `*.yaml` / `*.yml` files in a directory, sorted by path.
///
/// Returns an empty list if the directory does not exist.
pub fn discover_workflows(dir: &Path) -> Result<Vec<PathBuf>, WorkflowError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if path.is_file() && is_yaml {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Hex SHA-256 of the document's canonical JSON form.
pub fn fingerprint(doc: &WorkflowDocument) -> Result<String, WorkflowError> {
    let canonical =
        serde_json::to_vec(doc).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    Ok(format!("{:x}", Sha256::digest(&canonical)))
}

/// Convert a document into a validated definition.
pub fn build_definition(
    doc: &WorkflowDocument,
    options: ParseOptions,
) -> Result<WorkflowDefinition, WorkflowError> {
    if doc.name.trim().is_empty() {
        return Err(invalid("workflow name must not be empty"));
    }
    if doc.steps.is_empty() {
        return Err(invalid("workflow must declare at least one step"));
    }
    for input in &doc.inputs {
        check_variable_name(input).map_err(|e| invalid(format!("input '{input}': {e}")))?;
    }

    let settings = WorkflowSettings {
        max_fan_out: check_fan_out(doc.settings.max_fan_out)
            .map_err(|e| invalid(format!("settings: {e}")))?,
        cost_limit: check_amount(doc.settings.cost_limit, "cost_limit")
            .map_err(|e| invalid(format!("settings: {e}")))?,
        timeout: doc
            .settings
            .timeout
            .as_ref()
            .map(|t| t.to_duration())
            .transpose()
            .map_err(|e| invalid(format!("settings: {e}")))?,
    };
    if settings.timeout.is_some_and(|t| t.is_zero()) {
        return Err(invalid("settings: timeout must be greater than zero"));
    }

    let mut names = HashSet::new();
    let steps = doc
        .steps
        .iter()
        .map(|step| convert_step(step, Placement::TopLevel, options, &mut names))
        .collect::<Result<Vec<_>, _>>()?;

    let definition = WorkflowDefinition {
        name: doc.name.trim().to_string(),
        description: doc.description.clone(),
        inputs: doc.inputs.clone(),
        variables: doc.variables.clone(),
        settings,
        steps,
        fingerprint: fingerprint(doc)?,
    };
    validate_references(&definition)?;
    Ok(definition)
}

fn invalid(message: impl Into<String>) -> WorkflowError {
    WorkflowError::ValidationError(message.into())
}

// ---------------------------------------------------------------------------
// Step conversion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    TopLevel,
    Branch,
    ParallelMember,
    LoopBody,
    Undo,
}

const ACTION_FIELDS: &[&str] = &[
    "target",
    "action",
    "inputs",
    "outputs",
    "on_error",
    "retry_count",
    "backoff",
    "timeout",
    "cost_limit",
    "estimated_cost",
    "condition",
    "undo",
];

const GENERATE_FIELDS: &[&str] = &[
    "target",
    "inputs",
    "outputs",
    "prompt",
    "model",
    "max_tokens",
    "quality",
    "on_error",
    "retry_count",
    "backoff",
    "timeout",
    "cost_limit",
    "estimated_cost",
    "condition",
    "undo",
];

const CONDITIONAL_FIELDS: &[&str] = &["condition", "steps", "else", "on_error"];

const PARALLEL_FIELDS: &[&str] = &[
    "steps",
    "max_fan_out",
    "on_error",
    "retry_count",
    "backoff",
    "condition",
];

const LOOP_FIELDS: &[&str] = &[
    "over",
    "as",
    "step",
    "max_iterations",
    "outputs",
    "on_error",
    "condition",
];

fn present_fields(doc: &StepDocument) -> Vec<&'static str> {
    let flags = [
        ("target", doc.target.is_some()),
        ("action", doc.action.is_some()),
        ("inputs", !doc.inputs.is_empty()),
        ("outputs", !doc.outputs.is_empty()),
        ("prompt", doc.prompt.is_some()),
        ("model", doc.model.is_some()),
        ("max_tokens", doc.max_tokens.is_some()),
        ("quality", doc.quality.is_some()),
        ("on_error", doc.on_error.is_some()),
        ("retry_count", doc.retry_count.is_some()),
        ("backoff", doc.backoff.is_some()),
        ("timeout", doc.timeout.is_some()),
        ("cost_limit", doc.cost_limit.is_some()),
        ("estimated_cost", doc.estimated_cost.is_some()),
        ("condition", doc.condition.is_some()),
        ("undo", doc.undo.is_some()),
        ("steps", !doc.steps.is_empty()),
        ("else", !doc.else_steps.is_empty()),
        ("max_fan_out", doc.max_fan_out.is_some()),
        ("over", doc.over.is_some()),
        ("as", doc.loop_var.is_some()),
        ("step", doc.step.is_some()),
        ("max_iterations", doc.max_iterations.is_some()),
    ];
    flags
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
}

fn kind_label(kind: StepKindTag) -> &'static str {
    match kind {
        StepKindTag::Action => "action",
        StepKindTag::Generate => "generate",
        StepKindTag::Conditional => "conditional",
        StepKindTag::Parallel => "parallel",
        StepKindTag::Loop => "loop",
    }
}

fn convert_step(
    doc: &StepDocument,
    placement: Placement,
    options: ParseOptions,
    names: &mut HashSet<String>,
) -> Result<StepSpec, WorkflowError> {
    let name = doc.name.trim().to_string();
    check_step_name(&name).map_err(|e| invalid(format!("step '{name}': {e}")))?;
    if !names.insert(name.clone()) {
        return Err(invalid(format!("duplicate step name '{name}'")));
    }
    let fail = |message: String| invalid(format!("step '{name}': {message}"));
    let label = kind_label(doc.kind);

    let allowed = match doc.kind {
        StepKindTag::Action => ACTION_FIELDS,
        StepKindTag::Generate => GENERATE_FIELDS,
        StepKindTag::Conditional => CONDITIONAL_FIELDS,
        StepKindTag::Parallel => PARALLEL_FIELDS,
        StepKindTag::Loop => LOOP_FIELDS,
    };
    let present = present_fields(doc);
    if let Some(field) = present.iter().find(|field| !allowed.contains(field)) {
        return Err(fail(format!("field '{field}' does not apply to {label} steps")));
    }

    match placement {
        Placement::ParallelMember => {
            if !matches!(doc.kind, StepKindTag::Action | StepKindTag::Generate) {
                return Err(fail(format!(
                    "parallel members must be action or generate steps, not {label}"
                )));
            }
            if let Some(field) = present
                .iter()
                .find(|field| ["on_error", "retry_count", "backoff"].contains(field))
            {
                return Err(fail(format!(
                    "parallel members follow the group's error policy; remove '{field}'"
                )));
            }
        }
        Placement::Undo => {
            if doc.kind != StepKindTag::Action {
                return Err(fail("undo steps must be action steps".to_string()));
            }
            if let Some(field) = present.iter().find(|field| {
                ["on_error", "retry_count", "backoff", "undo", "condition", "outputs"]
                    .contains(field)
            }) {
                return Err(fail(format!("field '{field}' is not allowed on undo steps")));
            }
        }
        Placement::TopLevel | Placement::Branch | Placement::LoopBody => {}
    }

    // Error policy
    let policy = match doc.on_error {
        None if doc.retry_count.is_some() => OnErrorTag::Retry,
        None => OnErrorTag::Fail,
        Some(tag) => tag,
    };
    let policy = match policy {
        OnErrorTag::Fail => ErrorPolicy::Fail,
        OnErrorTag::Continue => ErrorPolicy::Continue,
        OnErrorTag::Rollback => ErrorPolicy::Rollback,
        OnErrorTag::Retry => {
            if matches!(doc.kind, StepKindTag::Conditional | StepKindTag::Loop) {
                return Err(fail(format!("on_error: retry is not supported on {label} steps")));
            }
            let max_attempts = doc.retry_count.unwrap_or(options.default_max_attempts);
            if max_attempts == 0 {
                return Err(fail("retry_count must be at least 1".to_string()));
            }
            ErrorPolicy::Retry {
                max_attempts,
                backoff: doc.backoff.clone(),
            }
        }
    };
    if !matches!(policy, ErrorPolicy::Retry { .. })
        && (doc.retry_count.is_some() || doc.backoff.is_some())
    {
        return Err(fail("retry_count and backoff require on_error: retry".to_string()));
    }

    let timeout = doc
        .timeout
        .as_ref()
        .map(|t| t.to_duration())
        .transpose()
        .map_err(&fail)?;
    if timeout.is_some_and(|t| t.is_zero()) {
        return Err(fail("timeout must be greater than zero".to_string()));
    }
    let cost_limit = check_amount(doc.cost_limit, "cost_limit").map_err(&fail)?;
    let estimated_cost = check_amount(doc.estimated_cost, "estimated_cost").map_err(&fail)?;

    for (path, variable) in &doc.outputs {
        if path.trim().is_empty() {
            return Err(fail(format!("output for '{variable}' has an empty result path")));
        }
        check_variable_name(variable).map_err(|e| fail(format!("output '{variable}': {e}")))?;
    }

    let kind = match doc.kind {
        StepKindTag::Action => {
            let target = required(&doc.target, "target").map_err(&fail)?;
            let action = required(&doc.action, "action").map_err(&fail)?;
            StepKind::ExternalAction { target, action }
        }
        StepKindTag::Generate => {
            let prompt = doc
                .prompt
                .clone()
                .ok_or_else(|| fail("generate steps require 'prompt'".to_string()))?;
            if doc.max_tokens == Some(0) {
                return Err(fail("max_tokens must be greater than zero".to_string()));
            }
            StepKind::GenerationAction {
                target: doc
                    .target
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GENERATOR.to_string()),
                prompt,
                model: doc.model.clone(),
                max_tokens: doc.max_tokens,
                quality: doc.quality.clone().unwrap_or_default(),
            }
        }
        StepKindTag::Conditional => {
            let condition = required(&doc.condition, "condition").map_err(&fail)?;
            if doc.steps.is_empty() {
                return Err(fail("conditional steps require 'steps'".to_string()));
            }
            let then_steps = convert_all(&doc.steps, Placement::Branch, options, names)?;
            let else_steps = convert_all(&doc.else_steps, Placement::Branch, options, names)?;
            StepKind::Conditional {
                condition,
                then_steps,
                else_steps,
            }
        }
        StepKindTag::Parallel => {
            if doc.steps.is_empty() {
                return Err(fail("parallel steps require 'steps'".to_string()));
            }
            let max_fan_out = check_fan_out(doc.max_fan_out).map_err(&fail)?;
            let steps = convert_all(&doc.steps, Placement::ParallelMember, options, names)?;
            StepKind::ParallelGroup { steps, max_fan_out }
        }
        StepKindTag::Loop => {
            let over = required(&doc.over, "over").map_err(&fail)?;
            let body = doc
                .step
                .as_deref()
                .ok_or_else(|| fail("loop steps require 'step'".to_string()))?;
            let var = doc
                .loop_var
                .clone()
                .unwrap_or_else(|| DEFAULT_LOOP_VAR.to_string());
            check_variable_name(&var).map_err(|e| fail(format!("loop variable: {e}")))?;
            if doc.max_iterations == Some(0) {
                return Err(fail("max_iterations must be greater than zero".to_string()));
            }
            let step = convert_step(body, Placement::LoopBody, options, names)?;
            StepKind::Loop {
                over,
                var,
                step: Box::new(step),
                max_iterations: doc.max_iterations,
            }
        }
    };

    // The branch condition lives on the kind for conditional steps.
    let condition = match doc.kind {
        StepKindTag::Conditional => None,
        _ => doc.condition.clone(),
    };

    let undo = doc
        .undo
        .as_deref()
        .map(|undo| convert_step(undo, Placement::Undo, options, names))
        .transpose()?
        .map(Box::new);

    Ok(StepSpec {
        name,
        description: doc.description.clone(),
        kind,
        inputs: doc.inputs.clone(),
        outputs: doc.outputs.clone(),
        policy,
        timeout,
        cost_limit,
        estimated_cost,
        condition,
        undo,
    })
}

fn convert_all(
    docs: &[StepDocument],
    placement: Placement,
    options: ParseOptions,
    names: &mut HashSet<String>,
) -> Result<Vec<StepSpec>, WorkflowError> {
    docs.iter()
        .map(|doc| convert_step(doc, placement, options, names))
        .collect()
}

fn required(value: &Option<String>, field: &str) -> Result<String, String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(format!("'{field}' is required")),
    }
}

fn check_step_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("step name must not be empty".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("step names may only contain letters, digits, '-' and '_'".to_string());
    }
    Ok(())
}

fn check_variable_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_alphanumeric() || c == '_') {
        return Err(format!("'{name}' is not a valid variable name"));
    }
    if name == RUN_VAR || name == LOOP_VAR || ["true", "false", "null"].contains(&name) {
        return Err(format!("'{name}' is reserved"));
    }
    Ok(())
}

fn check_amount(value: Option<f64>, field: &str) -> Result<Option<f64>, String> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => {
            Err(format!("{field} must be a non-negative number"))
        }
        other => Ok(other),
    }
}

fn check_fan_out(value: Option<usize>) -> Result<Option<usize>, String> {
    match value {
        Some(0) => Err("max_fan_out must be at least 1".to_string()),
        other => Ok(other),
    }
}

// ---------------------------------------------------------------------------
// Reference validation
// ---------------------------------------------------------------------------

/// Reject undefined variables, forward references and interdependent
/// parallel members.
fn validate_references(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let mut binders = HashMap::new();
    collect_binders(&def.steps, &mut binders);

    let mut defined: HashSet<String> = def
        .variables
        .keys()
        .cloned()
        .chain(def.inputs.iter().cloned())
        .collect();
    defined.insert(RUN_VAR.to_string());

    let checker = ReferenceChecker { binders };
    checker.check_block(&def.steps, &mut defined)
}

/// First step that binds each variable, for forward-reference messages.
fn collect_binders<'a>(steps: &'a [StepSpec], binders: &mut HashMap<&'a str, &'a str>) {
    for step in steps {
        for variable in step.outputs.values() {
            binders.entry(variable.as_str()).or_insert(step.name.as_str());
        }
        match &step.kind {
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                collect_binders(then_steps, binders);
                collect_binders(else_steps, binders);
            }
            StepKind::ParallelGroup { steps, .. } => collect_binders(steps, binders),
            StepKind::Loop { step, .. } => collect_binders(std::slice::from_ref(step), binders),
            _ => {}
        }
    }
}

struct ReferenceChecker<'a> {
    binders: HashMap<&'a str, &'a str>,
}

impl ReferenceChecker<'_> {
    fn check_block(
        &self,
        steps: &[StepSpec],
        defined: &mut HashSet<String>,
    ) -> Result<(), WorkflowError> {
        steps.iter().try_for_each(|step| self.check_step(step, defined))
    }

    fn check_step(
        &self,
        step: &StepSpec,
        defined: &mut HashSet<String>,
    ) -> Result<(), WorkflowError> {
        for reference in own_references(step)? {
            self.check_reference(step, &reference, defined)?;
        }

        match &step.kind {
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                let mut then_defined = defined.clone();
                self.check_block(then_steps, &mut then_defined)?;
                let mut else_defined = defined.clone();
                self.check_block(else_steps, &mut else_defined)?;
                defined.extend(then_defined);
                defined.extend(else_defined);
            }
            StepKind::ParallelGroup { steps, .. } => {
                let mut sibling_outputs: HashMap<&str, &str> = HashMap::new();
                for member in steps {
                    for variable in member.outputs.values() {
                        if let Some(other) = sibling_outputs.insert(variable, &member.name) {
                            return Err(invalid(format!(
                                "step '{}': parallel members '{other}' and '{}' both bind '{variable}'",
                                step.name, member.name
                            )));
                        }
                    }
                }
                for member in steps {
                    for reference in own_references(member)? {
                        if defined.contains(&reference.root) {
                            continue;
                        }
                        if let Some(sibling) = sibling_outputs.get(reference.root.as_str()) {
                            return Err(invalid(format!(
                                "step '{}': parallel members are interdependent: '{}' uses '{}' bound by '{sibling}'",
                                step.name, member.name, reference.root
                            )));
                        }
                    }
                    self.check_step(member, &mut defined.clone())?;
                }
                defined.extend(sibling_outputs.keys().map(|v| v.to_string()));
            }
            StepKind::Loop { var, step: body, .. } => {
                let mut inner = defined.clone();
                inner.insert(var.clone());
                inner.insert(LOOP_VAR.to_string());
                self.check_step(body, &mut inner)?;
                inner.remove(var);
                inner.remove(LOOP_VAR);
                defined.extend(inner);
            }
            StepKind::ExternalAction { .. } | StepKind::GenerationAction { .. } => {}
        }

        defined.extend(step.outputs.values().cloned());

        if let Some(undo) = &step.undo {
            self.check_step(undo, &mut defined.clone())?;
        }
        Ok(())
    }

    fn check_reference(
        &self,
        step: &StepSpec,
        reference: &Reference,
        defined: &HashSet<String>,
    ) -> Result<(), WorkflowError> {
        if reference.defaulted || defined.contains(&reference.root) {
            return Ok(());
        }
        let message = match self.binders.get(reference.root.as_str()) {
            Some(binder) => format!(
                "step '{}': '{}' is referenced before it is bound (bound by step '{binder}')",
                step.name, reference.root
            ),
            None => format!(
                "step '{}': undefined variable '{}'",
                step.name, reference.root
            ),
        };
        Err(invalid(message))
    }
}

/// References made by the step's own fields (not nested steps).
fn own_references(step: &StepSpec) -> Result<Vec<Reference>, WorkflowError> {
    let wrap = |field: &str, err: ResolveError| {
        invalid(format!("step '{}': invalid {field}: {err}", step.name))
    };
    let mut refs = Vec::new();
    if let Some(condition) = &step.condition {
        refs.extend(resolver::expression_references(condition).map_err(|e| wrap("condition", e))?);
    }
    for (key, value) in &step.inputs {
        refs.extend(
            resolver::value_references(value).map_err(|e| wrap(&format!("input '{key}'"), e))?,
        );
    }
    match &step.kind {
        StepKind::GenerationAction { prompt, .. } => {
            refs.extend(resolver::value_references(prompt).map_err(|e| wrap("prompt", e))?);
        }
        StepKind::Conditional { condition, .. } => {
            refs.extend(
                resolver::expression_references(condition).map_err(|e| wrap("condition", e))?,
            );
        }
        StepKind::Loop { over, .. } => {
            refs.extend(resolver::expression_references(over).map_err(|e| wrap("over", e))?);
        }
        StepKind::ExternalAction { .. } | StepKind::ParallelGroup { .. } => {}
    }
    Ok(refs)
}
