//! `validate`, `run` and `resume` handlers.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use console::style;
use devflow_core::workflow::definition::ParseOptions;
use devflow_core::workflow::{WorkflowEngine, load_workflow_file};
use devflow_infra::gateway::HttpGateway;
use devflow_infra::sqlite::SqliteRunRepository;
use devflow_observe::attrs;
use devflow_types::config::EngineConfig;
use devflow_types::event::WorkflowEvent;
use devflow_types::run::{RunResult, RunStatus};
use devflow_types::workflow::{StepKind, StepSpec, WorkflowDefinition};
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::runs::print_run;
use super::{GatewayArgs, Output, ResumeArgs, RunArgs, format_cost, format_duration_ms};
use crate::state::{AppState, load_config};

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub async fn handle_validate(file: &Path, config: Option<&Path>, out: Output) -> Result<ExitCode> {
    let config = load_config(&devflow_infra::config::default_data_dir(), config).await?;
    let span = tracing::info_span!(
        "workflow validate",
        devflow.workflow.name = tracing::field::Empty,
    );
    let _guard = span.enter();

    let def = match load_workflow_file(file, parse_options(&config)) {
        Ok(def) => def,
        Err(e) => {
            if out.json {
                let report = serde_json::json!({
                    "file": file.display().to_string(),
                    "valid": false,
                    "error": e.to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                eprintln!();
                eprintln!("  {} {}: {e}", style("x").red().bold(), file.display());
                eprintln!();
            }
            return Ok(ExitCode::FAILURE);
        }
    };
    span.record(attrs::WORKFLOW_NAME, def.name.as_str());

    let (actions, generators) = targets(&def.steps);
    if out.json {
        let report = serde_json::json!({
            "file": file.display().to_string(),
            "valid": true,
            "name": def.name,
            "fingerprint": def.fingerprint,
            "steps": def.steps.len(),
            "inputs": def.inputs,
            "action_targets": actions,
            "generators": generators,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !out.quiet {
        println!();
        println!(
            "  {} Workflow '{}' is valid",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        if let Some(description) = &def.description {
            println!("  {}", style(description).dim());
        }
        println!("  Steps:       {}", def.steps.len());
        if !def.inputs.is_empty() {
            println!("  Inputs:      {}", def.inputs.join(", "));
        }
        if !actions.is_empty() {
            println!("  Targets:     {}", actions.join(", "));
        }
        if !generators.is_empty() {
            println!("  Generators:  {}", generators.join(", "));
        }
        println!("  Fingerprint: {}", style(&def.fingerprint[..12.min(def.fingerprint.len())]).dim());
        println!();
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(args: RunArgs, config: Option<&Path>, out: Output) -> Result<ExitCode> {
    let state = AppState::init(config).await?;
    let def = load_workflow_file(&args.file, parse_options(&state.config))
        .with_context(|| format!("invalid workflow {}", args.file.display()))?;
    let inputs = parse_vars(&args.vars)?;

    let engine = build_engine(&state, &def, &args.gateway)?;
    let span = run_span(&def, &args.gateway.gateway);

    let cancel = CancellationToken::new();
    let printer = spawn_progress(engine.subscribe(), out);
    let interrupt = spawn_interrupt(cancel.clone());

    let outcome = engine
        .execute_with_cancel(&def, inputs, cancel)
        .instrument(span.clone())
        .await;
    interrupt.abort();
    drop(engine);
    printer.await.ok();

    let run = outcome.context("workflow run could not start")?;
    finish(&span, &run, out)
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

pub async fn handle_resume(args: ResumeArgs, config: Option<&Path>, out: Output) -> Result<ExitCode> {
    let run_id: Uuid = args
        .run_id
        .parse()
        .with_context(|| format!("'{}' is not a run ID", args.run_id))?;
    let state = AppState::init(config).await?;
    let def = load_workflow_file(&args.file, parse_options(&state.config))
        .with_context(|| format!("invalid workflow {}", args.file.display()))?;

    let engine = build_engine(&state, &def, &args.gateway)?;
    let span = run_span(&def, &args.gateway.gateway);
    let printer = spawn_progress(engine.subscribe(), out);

    let outcome = engine.resume(run_id, &def).instrument(span.clone()).await;
    drop(engine);
    printer.await.ok();

    let run = outcome.with_context(|| format!("run {run_id} could not be resumed"))?;
    finish(&span, &run, out)
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

fn parse_options(config: &EngineConfig) -> ParseOptions {
    ParseOptions {
        default_max_attempts: config.retry.default_max_attempts,
    }
}

fn build_engine(
    state: &AppState,
    def: &WorkflowDefinition,
    args: &GatewayArgs,
) -> Result<WorkflowEngine<SqliteRunRepository>> {
    let token = std::env::var(&args.token_env)
        .ok()
        .filter(|t| !t.is_empty())
        .map(SecretString::from);
    if token.is_none() {
        tracing::debug!(env = %args.token_env, "no gateway token set, sending unauthenticated requests");
    }
    let gateway = HttpGateway::new(args.gateway.as_str(), token)
        .context("failed to build gateway HTTP client")?;

    Ok(WorkflowEngine::new(
        state.runs(),
        gateway.capability_table(&def.steps),
        state.config.clone(),
    ))
}

fn run_span(def: &WorkflowDefinition, gateway: &str) -> tracing::Span {
    let span = tracing::info_span!(
        "workflow run",
        devflow.workflow.name = tracing::field::Empty,
        devflow.workflow.fingerprint = tracing::field::Empty,
        devflow.gateway.url = tracing::field::Empty,
        devflow.run.id = tracing::field::Empty,
        devflow.run.status = tracing::field::Empty,
        devflow.run.cost = tracing::field::Empty,
        devflow.run.steps = tracing::field::Empty,
    );
    span.record(attrs::WORKFLOW_NAME, def.name.as_str());
    span.record(attrs::WORKFLOW_FINGERPRINT, def.fingerprint.as_str());
    span.record(attrs::GATEWAY_URL, gateway);
    span
}

fn finish(span: &tracing::Span, run: &RunResult, out: Output) -> Result<ExitCode> {
    span.record(attrs::RUN_ID, run.run_id.to_string().as_str());
    span.record(attrs::RUN_STATUS, run.status.to_string().as_str());
    span.record(attrs::RUN_COST, run.total_cost);
    span.record(attrs::RUN_STEPS, run.steps.len() as u64);

    print_run(run, out)?;
    Ok(if run.status == RunStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Parse `key=value` pairs; values that are valid JSON keep their type.
pub fn parse_vars(vars: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut inputs = BTreeMap::new();
    for raw in vars {
        let Some((key, value)) = raw.split_once('=') else {
            bail!("--var '{raw}' must be KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("--var '{raw}' has an empty key");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

/// Action targets and generators the steps reference, sorted.
fn targets(steps: &[StepSpec]) -> (Vec<String>, Vec<String>) {
    fn walk<'a>(
        steps: impl IntoIterator<Item = &'a StepSpec>,
        actions: &mut Vec<String>,
        generators: &mut Vec<String>,
    ) {
        for step in steps {
            match &step.kind {
                StepKind::ExternalAction { target, .. } => actions.push(target.clone()),
                StepKind::GenerationAction { target, .. } => generators.push(target.clone()),
                _ => {}
            }
            walk(step.children(), actions, generators);
            if let Some(undo) = &step.undo {
                walk(std::iter::once(undo.as_ref()), actions, generators);
            }
        }
    }

    let (mut actions, mut generators) = (Vec::new(), Vec::new());
    walk(steps, &mut actions, &mut generators);
    for list in [&mut actions, &mut generators] {
        list.sort();
        list.dedup();
    }
    (actions, generators)
}

/// Cancel the run on Ctrl-C.
fn spawn_interrupt(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("  {} interrupt received, cancelling run", style("!").yellow().bold());
            cancel.cancel();
        }
    })
}

/// Print one line per event until the engine (and its bus) is dropped.
fn spawn_progress(
    mut events: broadcast::Receiver<WorkflowEvent>,
    out: Output,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if out.styled() {
                        if let Some(line) = progress_line(&event) {
                            eprintln!("{line}");
                        }
                    }
                    if matches!(event, WorkflowEvent::RunFinished { .. }) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress printer lagged behind events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn progress_line(event: &WorkflowEvent) -> Option<String> {
    let line = match event {
        WorkflowEvent::RunStarted { workflow, run_id } => format!(
            "  {} {} {}",
            style(">").cyan().bold(),
            style(workflow).cyan(),
            style(run_id).dim()
        ),
        WorkflowEvent::StepStarted { step, kind, .. } => {
            format!("    {} {step} {}", style("-").dim(), style(format!("({kind})")).dim())
        }
        WorkflowEvent::StepRetrying {
            step,
            attempt,
            delay_ms,
            error,
            ..
        } => format!(
            "    {} {step} attempt {attempt} failed, retrying in {}: {error}",
            style("~").yellow(),
            format_duration_ms(*delay_ms)
        ),
        WorkflowEvent::StepCompleted {
            step,
            duration_ms,
            cost,
            ..
        } => format!(
            "    {} {step} {}",
            style("ok").green(),
            style(format!("{} {}", format_duration_ms(*duration_ms), format_cost(*cost))).dim()
        ),
        WorkflowEvent::StepFailed { step, kind, error, .. } => {
            format!("    {} {step} [{kind}] {error}", style("x").red().bold())
        }
        WorkflowEvent::StepSkipped { step, .. } => {
            format!("    {} {step} skipped", style("-").dim())
        }
        WorkflowEvent::QualityVerdict {
            step,
            overall,
            verdict,
            ..
        } => format!("    {} {step} quality {overall:.2} -> {verdict}", style("?").magenta()),
        WorkflowEvent::CircuitOpened {
            target,
            consecutive_failures,
        } => format!(
            "    {} circuit for '{target}' opened after {consecutive_failures} failures",
            style("!").yellow().bold()
        ),
        WorkflowEvent::CircuitClosed { target } => {
            format!("    {} circuit for '{target}' closed", style("*").green())
        }
        WorkflowEvent::BudgetWarning { period, spent, limit } => format!(
            "    {} {period} spend {} of {}",
            style("!").yellow().bold(),
            format_cost(*spent),
            format_cost(*limit)
        ),
        WorkflowEvent::RollbackStarted { failed_step, .. } => format!(
            "  {} rolling back after '{failed_step}' failed",
            style("<").yellow().bold()
        ),
        WorkflowEvent::StepRolledBack { step, .. } => {
            format!("    {} {step} undone", style("<").yellow())
        }
        WorkflowEvent::RunFinished { .. } => return None,
    };
    Some(line)
}
