//! Workflow engine: drives one run from its first step to a final status.
//!
//! Top-level steps run in order. Control steps (conditional, parallel, loop)
//! recurse; leaf steps go through the [`StepExecutor`]. After every
//! top-level step the run is checkpointed, so a crashed run can resume from
//! the next one. A failed step's error policy decides what happens next:
//! continue, roll back earlier work, or stop.
//!
//! # Execution flow
//!
//! 1. Preflight: every target named by the definition must be registered.
//! 2. Create the run record and open the run's budget account.
//! 3. Walk the steps, binding each step's outputs into the context.
//! 4. Settle the run: rollback if requested, then `Completed`, `Failed` or
//!    `Aborted`.
//! 5. Persist the final record, drop the checkpoint, publish `RunFinished`.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use devflow_types::config::EngineConfig;
use devflow_types::event::WorkflowEvent;
use devflow_types::run::{
    RollbackReport, RunFailure, RunResult, RunStatus, StepError, StepErrorKind, StepResult,
    StepStatus,
};
use devflow_types::workflow::{StepKind, StepSpec, WorkflowDefinition};
use serde_json::{Map, Value, json};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::budget::{BudgetEnforcer, CostEstimator};
use crate::capability::CapabilityTable;
use crate::event::EventBus;
use crate::guard::Guards;
use crate::quality::QualityPipeline;
use crate::repository::RunRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{ExecutionContext, LOOP_VAR};
use super::resolver::{evaluate, evaluate_condition, extract_path};
use super::retry::RetryHandler;
use super::step_executor::{StepDirective, StepExecutor, StepOutcome, millis, pause};

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

/// How a step (or a sequence of steps) ended, from the run's point of view.
#[derive(Debug)]
enum Flow {
    /// Go on with the next step.
    Next,
    /// Stop the run as `Failed`.
    Stop(RunFailure),
    /// Undo earlier successful steps, then settle.
    Rollback(RunFailure),
    /// The run's token fired.
    Cancelled(Option<RunFailure>),
    /// `settings.timeout` elapsed.
    TimedOut(Duration),
}

impl Flow {
    fn proceeds(&self) -> bool {
        matches!(self, Flow::Next)
    }
}

/// A leaf step that succeeded and may need undoing.
#[derive(Debug)]
struct Completed {
    step: String,
    /// Position of its result in `RunResult::steps`.
    index: usize,
    undo: Option<StepSpec>,
    /// Loop bindings in scope when the step ran.
    frames: Vec<(String, Value)>,
}

/// Mutable state of one run while it executes.
struct RunState {
    run: RunResult,
    ctx: ExecutionContext,
    completed: Vec<Completed>,
    frames: Vec<(String, Value)>,
    /// Top-level step currently executing.
    current: String,
    fan_out: usize,
    max_iterations: usize,
}

/// Fields of a `loop` step.
struct LoopSpec<'a> {
    over: &'a str,
    var: &'a str,
    body: &'a StepSpec,
    max_iterations: Option<usize>,
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Flow> + Send + 'a>>;

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Executes validated workflow definitions with durable checkpointing.
///
/// Generic over `R: RunRepository` for storage flexibility.
pub struct WorkflowEngine<R: RunRepository> {
    checkpoint: Arc<CheckpointManager<R>>,
    executor: StepExecutor,
    events: EventBus,
    /// Cancellation tokens keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<R: RunRepository + 'static> WorkflowEngine<R> {
    pub fn new(repo: R, capabilities: CapabilityTable, config: EngineConfig) -> Self {
        let events = EventBus::default();
        Self {
            checkpoint: Arc::new(CheckpointManager::new(repo)),
            executor: StepExecutor::new(Arc::new(capabilities), Arc::new(config), events.clone()),
            events,
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Share circuit breakers and rate limiters with another engine.
    pub fn with_guards(mut self, guards: Guards) -> Self {
        self.executor = self.executor.with_guards(guards);
        self
    }

    /// Share a budget enforcer (and its monthly ledger) with another engine.
    pub fn with_budget(mut self, budget: Arc<BudgetEnforcer>) -> Self {
        self.executor = self.executor.with_budget(budget);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.executor = self.executor.with_estimator(estimator);
        self
    }

    pub fn with_quality_pipeline(mut self, pipeline: QualityPipeline) -> Self {
        self.executor = self.executor.with_quality_pipeline(pipeline);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn guards(&self) -> &Guards {
        self.executor.guards()
    }

    pub fn budget(&self) -> &Arc<BudgetEnforcer> {
        self.executor.budget()
    }

    pub fn repo(&self) -> &R {
        self.checkpoint.repo()
    }

    /// Whether `run_id` is executing on this engine right now.
    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.cancellation_tokens.contains_key(&run_id)
    }

    /// Check that every target the definition names is registered.
    pub fn preflight(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        let missing = self
            .executor
            .capabilities()
            .missing_targets(&definition.steps);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Preflight(missing))
        }
    }

    /// Execute a workflow from its first step.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> Result<RunResult, EngineError> {
        self.execute_with_cancel(definition, inputs, CancellationToken::new())
            .await
    }

    /// Execute a workflow; cancelling `cancel` aborts the run.
    ///
    /// Step failures end in a `RunResult` with a non-`Completed` status.
    /// `Err` is reserved for problems that prevent running at all.
    pub async fn execute_with_cancel(
        &self,
        definition: &WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
        cancel: CancellationToken,
    ) -> Result<RunResult, EngineError> {
        self.preflight(definition)?;
        if let Some(missing) = definition
            .inputs
            .iter()
            .find(|name| !inputs.contains_key(name.as_str()))
        {
            return Err(EngineError::MissingInput(missing.clone()));
        }

        let run_id = Uuid::now_v7();
        let run = RunResult::new(run_id, &definition.name, &definition.fingerprint);
        let ctx = ExecutionContext::new(run_id, &definition.name, &definition.variables, inputs);
        self.checkpoint.record_start(&run).await?;

        self.drive(definition, run, ctx, 0, cancel).await
    }

    /// Resume a crashed run from its last checkpoint.
    pub async fn resume(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
    ) -> Result<RunResult, EngineError> {
        self.preflight(definition)?;
        let (mut run, checkpoint) = self
            .checkpoint
            .restore(run_id, &definition.fingerprint)
            .await?;
        run.steps = checkpoint.steps;
        run.total_cost = checkpoint.total_cost;
        let ctx = ExecutionContext::from_snapshot(run_id, &definition.name, checkpoint.context);

        tracing::info!(
            run_id = %run_id,
            workflow = %definition.name,
            next_step = checkpoint.next_step,
            "resuming workflow run"
        );
        self.drive(definition, run, ctx, checkpoint.next_step, CancellationToken::new())
            .await
    }

    /// Cancel a run executing on this engine.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let token = self
            .cancellation_tokens
            .get(&run_id)
            .ok_or(EngineError::RunNotFound(run_id))?;
        token.cancel();
        tracing::info!(run_id = %run_id, "workflow run cancellation requested");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        run: RunResult,
        ctx: ExecutionContext,
        start: usize,
        cancel: CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let run_id = run.run_id;
        let token = cancel.child_token();
        self.cancellation_tokens.insert(run_id, token.clone());

        let limit = definition
            .settings
            .cost_limit
            .unwrap_or(self.executor.config().budget.run_limit);
        self.executor
            .budget()
            .open_run(run_id, Some((limit - run.total_cost).max(0.0)));

        let outcome = self.run_to_end(definition, run, ctx, start, &token).await;

        self.executor.budget().close_run(run_id);
        self.cancellation_tokens.remove(&run_id);
        if let Err(e) = &outcome {
            tracing::error!(run_id = %run_id, error = %e, "workflow run stopped without settling");
        }
        outcome
    }

    async fn run_to_end(
        &self,
        definition: &WorkflowDefinition,
        mut run: RunResult,
        ctx: ExecutionContext,
        start: usize,
        token: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let run_id = run.run_id;
        if run.status != RunStatus::Running {
            transition(&mut run, RunStatus::Running)?;
        }
        self.checkpoint.record_progress(&run).await?;

        tracing::info!(
            run_id = %run_id,
            workflow = %definition.name,
            start_step = start,
            "starting workflow run"
        );
        self.events.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow: definition.name.clone(),
        });
        let clock = Instant::now();

        let config = self.executor.config();
        let mut state = RunState {
            completed: completed_steps(definition, &run.steps),
            run,
            ctx,
            frames: Vec::new(),
            current: String::new(),
            fan_out: definition
                .settings
                .max_fan_out
                .unwrap_or(config.max_fan_out)
                .max(1),
            max_iterations: config.max_loop_iterations,
        };

        let flow = match definition.settings.timeout {
            Some(limit) => {
                let steps = self.run_steps(definition, &mut state, start, token);
                match tokio::time::timeout(limit, steps).await {
                    Ok(flow) => flow?,
                    Err(_) => {
                        token.cancel();
                        tracing::warn!(
                            run_id = %run_id,
                            timeout_ms = millis(limit),
                            "workflow run timed out"
                        );
                        Flow::TimedOut(limit)
                    }
                }
            }
            None => self.run_steps(definition, &mut state, start, token).await?,
        };

        let status = self.settle(flow, &mut state, token).await;
        let RunState { mut run, ctx, .. } = state;
        transition(&mut run, status)?;
        run.outputs = ctx.snapshot();
        run.completed_at = Some(Utc::now());
        self.checkpoint.record_finish(&run).await?;

        let duration_ms = millis(clock.elapsed());
        tracing::info!(
            run_id = %run_id,
            status = %run.status,
            total_cost = run.total_cost,
            duration_ms,
            "workflow run finished"
        );
        self.events.publish(WorkflowEvent::RunFinished {
            run_id,
            status: run.status,
            total_cost: run.total_cost,
            duration_ms,
        });
        Ok(run)
    }

    async fn run_steps(
        &self,
        definition: &WorkflowDefinition,
        state: &mut RunState,
        start: usize,
        token: &CancellationToken,
    ) -> Result<Flow, EngineError> {
        for (index, step) in definition.steps.iter().enumerate().skip(start) {
            state.current.clone_from(&step.name);
            if token.is_cancelled() {
                return Ok(Flow::Cancelled(None));
            }
            let flow = self.run_step(step, state, token).await;
            if !flow.proceeds() {
                return Ok(flow);
            }
            self.checkpoint
                .save(&state.run, &state.ctx, index + 1)
                .await?;
            self.checkpoint.record_progress(&state.run).await?;
        }
        Ok(Flow::Next)
    }

    /// Turn the final flow into a run status, rolling back when asked.
    async fn settle(
        &self,
        flow: Flow,
        state: &mut RunState,
        token: &CancellationToken,
    ) -> RunStatus {
        match flow {
            Flow::Next => RunStatus::Completed,
            Flow::Stop(failure) => {
                state.run.failure = Some(failure);
                RunStatus::Failed
            }
            Flow::Rollback(failure) => {
                let report = self.rollback(state, &failure.step, token).await;
                state.run.failure = Some(failure);
                let status = if report.succeeded {
                    RunStatus::Failed
                } else {
                    RunStatus::Aborted
                };
                state.run.rollback = Some(report);
                status
            }
            Flow::Cancelled(failure) => {
                let failure = failure.unwrap_or_else(|| RunFailure {
                    step: state.current.clone(),
                    kind: StepErrorKind::Cancelled,
                    message: "run cancelled".to_string(),
                    attempts: 0,
                });
                state.run.failure = Some(failure);
                RunStatus::Aborted
            }
            Flow::TimedOut(limit) => {
                state.run.failure = Some(RunFailure {
                    step: state.current.clone(),
                    kind: StepErrorKind::Timeout,
                    message: format!("run exceeded its timeout of {}ms", millis(limit)),
                    attempts: 0,
                });
                RunStatus::Aborted
            }
        }
    }

    // -----------------------------------------------------------------------
    // Step dispatch
    // -----------------------------------------------------------------------

    fn run_step<'a>(
        &'a self,
        step: &'a StepSpec,
        state: &'a mut RunState,
        token: &'a CancellationToken,
    ) -> StepFuture<'a> {
        Box::pin(async move {
            if let Some(condition) = &step.condition {
                let holds = evaluate_condition(condition, &state.ctx);
                match holds {
                    Ok(true) => {}
                    Ok(false) => {
                        self.skip(step, state);
                        return Flow::Next;
                    }
                    Err(e) => {
                        let error = StepError::new(
                            StepErrorKind::Resolution,
                            format!("condition of step '{}': {e}", step.name),
                        );
                        return self.fail_control(step, error, state, token);
                    }
                }
            }

            match &step.kind {
                StepKind::ExternalAction { .. } | StepKind::GenerationAction { .. } => {
                    let outcome = self.executor.execute(step, &state.ctx, token).await;
                    self.absorb(step, outcome, state, token)
                }
                StepKind::Conditional {
                    condition,
                    then_steps,
                    else_steps,
                } => {
                    self.run_conditional(step, condition, then_steps, else_steps, state, token)
                        .await
                }
                StepKind::ParallelGroup { steps, max_fan_out } => {
                    self.run_parallel(step, steps, *max_fan_out, state, token)
                        .await
                }
                StepKind::Loop {
                    over,
                    var,
                    step: body,
                    max_iterations,
                } => {
                    let spec = LoopSpec {
                        over,
                        var,
                        body,
                        max_iterations: *max_iterations,
                    };
                    self.run_loop(step, spec, state, token).await
                }
            }
        })
    }

    async fn run_sequence(
        &self,
        steps: &[StepSpec],
        state: &mut RunState,
        token: &CancellationToken,
    ) -> Flow {
        for step in steps {
            if token.is_cancelled() {
                return Flow::Cancelled(None);
            }
            let flow = self.run_step(step, state, token).await;
            if !flow.proceeds() {
                return flow;
            }
        }
        Flow::Next
    }

    async fn run_conditional(
        &self,
        step: &StepSpec,
        condition: &str,
        then_steps: &[StepSpec],
        else_steps: &[StepSpec],
        state: &mut RunState,
        token: &CancellationToken,
    ) -> Flow {
        let holds = evaluate_condition(condition, &state.ctx);
        let (label, branch) = match holds {
            Ok(true) => ("then", then_steps),
            Ok(false) if else_steps.is_empty() => {
                self.skip(step, state);
                return Flow::Next;
            }
            Ok(false) => ("else", else_steps),
            Err(e) => {
                let error = StepError::new(
                    StepErrorKind::Resolution,
                    format!("condition of step '{}': {e}", step.name),
                );
                return self.fail_control(step, error, state, token);
            }
        };
        tracing::debug!(
            run_id = %state.run.run_id,
            step = %step.name,
            branch = label,
            "conditional branch selected"
        );
        self.run_sequence(branch, state, token).await
    }

    // -----------------------------------------------------------------------
    // Parallel groups
    // -----------------------------------------------------------------------

    async fn run_parallel(
        &self,
        group: &StepSpec,
        members: &[StepSpec],
        max_fan_out: Option<usize>,
        state: &mut RunState,
        token: &CancellationToken,
    ) -> Flow {
        let run_id = state.run.run_id;
        let fan_out = max_fan_out.unwrap_or(state.fan_out).max(1);
        let mut results: Vec<Option<StepResult>> = vec![None; members.len()];
        let mut pending = Vec::with_capacity(members.len());

        for (index, member) in members.iter().enumerate() {
            let runnable = match &member.condition {
                Some(condition) => evaluate_condition(condition, &state.ctx),
                None => Ok(true),
            };
            match runnable {
                Ok(true) => pending.push(index),
                Ok(false) => {
                    self.events.publish(WorkflowEvent::StepSkipped {
                        run_id,
                        step: member.name.clone(),
                    });
                    results[index] = Some(StepResult::skipped(&member.name));
                }
                Err(e) => {
                    let error = StepError::new(
                        StepErrorKind::Resolution,
                        format!("condition of step '{}': {e}", member.name),
                    );
                    self.publish_failure(run_id, &member.name, &error);
                    results[index] = Some(failed_result(&member.name, error));
                }
            }
        }

        let mut round: u32 = 1;
        while !pending.is_empty() {
            tracing::debug!(
                run_id = %run_id,
                step = %group.name,
                members = pending.len(),
                fan_out,
                attempt = round,
                "running parallel group"
            );
            for (index, result) in self
                .run_members(members, &pending, fan_out, &state.ctx, token)
                .await
            {
                results[index] = Some(match results[index].take() {
                    Some(previous) => merge_attempts(previous, result),
                    None => result,
                });
            }

            let retry: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|&index| {
                    results[index]
                        .as_ref()
                        .and_then(|result| result.error.as_ref())
                        .is_some_and(|error| {
                            RetryHandler::should_retry(&group.policy, round, error)
                        })
                })
                .collect();
            if retry.is_empty() || token.is_cancelled() {
                break;
            }

            let delay =
                RetryHandler::backoff_delay(&self.executor.config().retry, &group.policy, round);
            let delay_ms = millis(delay);
            tracing::warn!(
                run_id = %run_id,
                step = %group.name,
                failed = retry.len(),
                attempt = round,
                delay_ms,
                "retrying failed parallel members"
            );
            self.events.publish(WorkflowEvent::StepRetrying {
                run_id,
                step: group.name.clone(),
                attempt: round,
                delay_ms,
                error: format!("{} member(s) failed", retry.len()),
            });
            if pause(delay, token).await.is_err() {
                break;
            }
            pending = retry;
            round += 1;
        }

        // Merge in declaration order so later members win on shared names.
        let mut first_failure = None;
        for (member, result) in members.iter().zip(results) {
            let Some(mut result) = result else {
                continue;
            };
            self.bind_result(member, &mut result, &mut state.ctx);
            if let Some(failure) = self.push_result(member, result, state) {
                first_failure.get_or_insert(failure);
            }
        }

        match first_failure {
            None => Flow::Next,
            Some(failure) => {
                let error = StepError::new(failure.kind, failure.message.clone());
                let directive = StepDirective::after_failure(&group.policy, &error);
                self.follow(directive, failure, state, token)
            }
        }
    }

    /// Run the `pending` members concurrently, at most `fan_out` at a time.
    async fn run_members(
        &self,
        members: &[StepSpec],
        pending: &[usize],
        fan_out: usize,
        ctx: &ExecutionContext,
        token: &CancellationToken,
    ) -> Vec<(usize, StepResult)> {
        let semaphore = Arc::new(Semaphore::new(fan_out));
        let shared = Arc::new(ctx.clone());
        let mut join_set = JoinSet::new();

        for &index in pending {
            let member = members[index].clone();
            let executor = self.executor.clone();
            let ctx = Arc::clone(&shared);
            let token = token.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = executor.execute(&member, &ctx, &token).await;
                (index, outcome.result)
            });
        }

        let mut finished = Vec::with_capacity(pending.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(pair) => finished.push(pair),
                Err(e) => {
                    tracing::error!(run_id = %ctx.run_id, error = %e, "parallel member task failed");
                }
            }
        }

        for &index in pending {
            if !finished.iter().any(|(done, _)| *done == index) {
                let name = &members[index].name;
                let error = StepError::permanent(
                    StepErrorKind::ExternalCall,
                    format!("step '{name}' ended without a result"),
                );
                self.publish_failure(ctx.run_id, name, &error);
                finished.push((index, failed_result(name, error)));
            }
        }
        finished
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    async fn run_loop(
        &self,
        step: &StepSpec,
        spec: LoopSpec<'_>,
        state: &mut RunState,
        token: &CancellationToken,
    ) -> Flow {
        let run_id = state.run.run_id;
        let clock = Instant::now();
        let started_at = Utc::now();

        let evaluated = evaluate(spec.over, &state.ctx);
        let mut items = match evaluated {
            Ok(Value::Array(items)) => items,
            Ok(Value::Object(map)) => map
                .into_iter()
                .map(|(key, value)| json!({ "key": key, "value": value }))
                .collect(),
            Ok(Value::Null) => Vec::new(),
            Ok(other) => {
                let error = StepError::new(
                    StepErrorKind::Resolution,
                    format!(
                        "loop '{}' expects a list or an object, got {}",
                        step.name,
                        type_name(&other)
                    ),
                );
                return self.fail_control(step, error, state, token);
            }
            Err(e) => {
                let error = StepError::new(
                    StepErrorKind::Resolution,
                    format!("loop source of step '{}': {e}", step.name),
                );
                return self.fail_control(step, error, state, token);
            }
        };

        let cap = spec.max_iterations.unwrap_or(state.max_iterations);
        if items.len() > cap {
            tracing::warn!(
                run_id = %run_id,
                step = %step.name,
                items = items.len(),
                cap,
                "loop capped at max_iterations"
            );
            items.truncate(cap);
        }

        let count = items.len();
        let saved_var = state.ctx.remove(spec.var);
        let saved_position = state.ctx.remove(LOOP_VAR);
        let mut iterations = Vec::with_capacity(count);
        let mut flow = Flow::Next;

        for (index, item) in items.into_iter().enumerate() {
            if token.is_cancelled() {
                flow = Flow::Cancelled(None);
                break;
            }
            let position = json!({
                "index": index,
                "count": count,
                "first": index == 0,
                "last": index + 1 == count,
            });
            let bound = state
                .ctx
                .set(spec.var, item.clone())
                .and_then(|()| state.ctx.set(LOOP_VAR, position.clone()));
            if let Err(e) = bound {
                let error = StepError::permanent(
                    StepErrorKind::Resolution,
                    format!("cannot bind loop variable '{}': {e}", spec.var),
                );
                flow = self.fail_control(step, error, state, token);
                break;
            }

            let depth = state.frames.len();
            state.frames.push((spec.var.to_string(), item));
            state.frames.push((LOOP_VAR.to_string(), position));
            let first_result = state.run.steps.len();

            let iteration = self.run_step(spec.body, state, token).await;

            state.frames.truncate(depth);
            let outputs: Map<String, Value> = state.run.steps[first_result..]
                .iter()
                .filter(|result| result.is_success())
                .flat_map(|result| result.outputs.clone())
                .collect();
            iterations.push(Value::Object(outputs));

            if !iteration.proceeds() {
                flow = iteration;
                break;
            }
        }

        state.ctx.restore(spec.var, saved_var);
        state.ctx.restore(LOOP_VAR, saved_position);
        if !flow.proceeds() {
            return flow;
        }

        let summary = json!({ "results": iterations, "count": count });
        let mut result = StepResult::skipped(&step.name);
        result.status = StepStatus::Success;
        result.started_at = started_at;
        result.elapsed_ms = millis(clock.elapsed());
        for (path, var) in &step.outputs {
            match extract_path(&summary, path) {
                Some(value) => {
                    result.outputs.insert(var.clone(), value.clone());
                }
                None => {
                    let error = StepError::new(
                        StepErrorKind::Resolution,
                        format!("result path '{path}' not found in output of loop '{}'", step.name),
                    );
                    return self.fail_control(step, error, state, token);
                }
            }
        }
        tracing::debug!(run_id = %run_id, step = %step.name, iterations = count, "loop finished");

        self.bind_result(step, &mut result, &mut state.ctx);
        match self.push_result(step, result, state) {
            None => Flow::Next,
            Some(failure) => {
                let error = StepError::new(failure.kind, failure.message.clone());
                let directive = StepDirective::after_failure(&step.policy, &error);
                self.follow(directive, failure, state, token)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------------

    /// Undo completed steps in reverse order. Stops at the first failing
    /// undo step.
    async fn rollback(
        &self,
        state: &mut RunState,
        failed_step: &str,
        token: &CancellationToken,
    ) -> RollbackReport {
        let run_id = state.run.run_id;
        tracing::warn!(run_id = %run_id, failed_step, "rolling back completed steps");
        self.events.publish(WorkflowEvent::RollbackStarted {
            run_id,
            failed_step: failed_step.to_string(),
        });

        let mut report = RollbackReport::default();
        let completed = std::mem::take(&mut state.completed);
        for done in completed.iter().rev() {
            let Some(undo) = &done.undo else {
                report.not_reversible.push(done.step.clone());
                continue;
            };

            let outcome = if done.frames.is_empty() {
                self.executor.execute(undo, &state.ctx, token).await
            } else {
                let scope = with_frames(&state.ctx, &done.frames);
                self.executor.execute(undo, &scope, token).await
            };
            let result = outcome.result;
            state.run.total_cost += result.cost;
            let succeeded = result.is_success();
            let attempts = result.attempts;
            let message = result.error.as_ref().map(|e| e.message.clone());
            state.run.steps.push(result);

            if succeeded {
                if let Some(original) = state.run.steps.get_mut(done.index) {
                    original.status = StepStatus::RolledBack;
                }
                tracing::info!(run_id = %run_id, step = %done.step, undo = %undo.name, "step rolled back");
                self.events.publish(WorkflowEvent::StepRolledBack {
                    run_id,
                    step: done.step.clone(),
                });
                report.undone.push(done.step.clone());
            } else {
                let message = message.unwrap_or_else(|| "undo step failed".to_string());
                tracing::error!(
                    run_id = %run_id,
                    step = %done.step,
                    undo = %undo.name,
                    error = %message,
                    "undo failed, stopping rollback"
                );
                report.failure = Some(RunFailure {
                    step: undo.name.clone(),
                    kind: StepErrorKind::RollbackFailure,
                    message: format!("undo of '{}' failed: {message}", done.step),
                    attempts,
                });
                return report;
            }
        }
        report.succeeded = true;
        report
    }

    // -----------------------------------------------------------------------
    // Result handling
    // -----------------------------------------------------------------------

    /// Record a leaf step's outcome and decide what the run does next.
    fn absorb(
        &self,
        step: &StepSpec,
        outcome: StepOutcome,
        state: &mut RunState,
        token: &CancellationToken,
    ) -> Flow {
        let StepOutcome {
            mut result,
            mut directive,
        } = outcome;
        self.bind_result(step, &mut result, &mut state.ctx);
        if let (StepDirective::Proceed, Some(error)) = (directive, &result.error) {
            directive = StepDirective::after_failure(&step.policy, error);
        }
        match self.push_result(step, result, state) {
            None => Flow::Next,
            Some(failure) => self.follow(directive, failure, state, token),
        }
    }

    /// Write a successful result's outputs into the context. A value that
    /// does not fit turns the result into a failure.
    fn bind_result(&self, step: &StepSpec, result: &mut StepResult, ctx: &mut ExecutionContext) {
        if !result.is_success() {
            return;
        }
        let rejected = result
            .outputs
            .iter()
            .find_map(|(var, value)| ctx.set(var, value.clone()).err().map(|e| (var.clone(), e)));
        if let Some((var, e)) = rejected {
            let error = StepError::permanent(
                StepErrorKind::Resolution,
                format!("cannot bind output '{var}' of step '{}': {e}", step.name),
            );
            self.publish_failure(ctx.run_id, &step.name, &error);
            result.status = StepStatus::Failed;
            result.error = Some(error);
        }
    }

    /// Append a result to the run, returning the failure it carries.
    fn push_result(
        &self,
        step: &StepSpec,
        result: StepResult,
        state: &mut RunState,
    ) -> Option<RunFailure> {
        state.run.total_cost += result.cost;
        let failure = match (&result.status, &result.error) {
            (StepStatus::Failed, Some(error)) => Some(RunFailure {
                step: result.step.clone(),
                kind: error.kind,
                message: error.message.clone(),
                attempts: result.attempts,
            }),
            _ => None,
        };
        if result.is_success() && step.is_leaf() {
            state.completed.push(Completed {
                step: step.name.clone(),
                index: state.run.steps.len(),
                undo: step.undo.as_deref().cloned(),
                frames: state.frames.clone(),
            });
        }
        state.run.steps.push(result);
        failure
    }

    fn follow(
        &self,
        directive: StepDirective,
        failure: RunFailure,
        state: &mut RunState,
        token: &CancellationToken,
    ) -> Flow {
        match directive {
            StepDirective::Proceed => Flow::Next,
            StepDirective::Continue => {
                tracing::warn!(
                    run_id = %state.run.run_id,
                    step = %failure.step,
                    kind = %failure.kind,
                    "step failed, continuing"
                );
                state.run.failure.get_or_insert(failure);
                Flow::Next
            }
            StepDirective::Rollback => Flow::Rollback(failure),
            StepDirective::Abort
                if failure.kind == StepErrorKind::Cancelled || token.is_cancelled() =>
            {
                Flow::Cancelled(Some(failure))
            }
            StepDirective::Abort => Flow::Stop(failure),
        }
    }

    /// Fail a step the executor never ran (condition, loop source, bindings).
    fn fail_control(
        &self,
        step: &StepSpec,
        error: StepError,
        state: &mut RunState,
        token: &CancellationToken,
    ) -> Flow {
        tracing::warn!(
            run_id = %state.run.run_id,
            step = %step.name,
            kind = %error.kind,
            error = %error.message,
            "step failed"
        );
        self.publish_failure(state.run.run_id, &step.name, &error);
        let directive = StepDirective::after_failure(&step.policy, &error);
        match self.push_result(step, failed_result(&step.name, error), state) {
            None => Flow::Next,
            Some(failure) => self.follow(directive, failure, state, token),
        }
    }

    fn skip(&self, step: &StepSpec, state: &mut RunState) {
        tracing::debug!(run_id = %state.run.run_id, step = %step.name, "condition false, skipping step");
        self.events.publish(WorkflowEvent::StepSkipped {
            run_id: state.run.run_id,
            step: step.name.clone(),
        });
        state.run.steps.push(StepResult::skipped(&step.name));
    }

    fn publish_failure(&self, run_id: Uuid, step: &str, error: &StepError) {
        self.events.publish(WorkflowEvent::StepFailed {
            run_id,
            step: step.to_string(),
            kind: error.kind,
            error: error.message.clone(),
        });
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn transition(run: &mut RunResult, next: RunStatus) -> Result<(), EngineError> {
    if !run.status.can_transition_to(next) {
        return Err(EngineError::InvalidTransition {
            run_id: run.run_id,
            from: run.status,
            to: next,
        });
    }
    run.status = next;
    Ok(())
}

/// Successful leaf steps recorded so far, for runs resumed from a checkpoint.
fn completed_steps(definition: &WorkflowDefinition, steps: &[StepResult]) -> Vec<Completed> {
    steps
        .iter()
        .enumerate()
        .filter(|(_, result)| result.is_success())
        .filter_map(|(index, result)| {
            let spec = definition.find_step(&result.step).filter(|s| s.is_leaf())?;
            Some(Completed {
                step: result.step.clone(),
                index,
                undo: spec.undo.as_deref().cloned(),
                frames: Vec::new(),
            })
        })
        .collect()
}

fn failed_result(step: &str, error: StepError) -> StepResult {
    let mut result = StepResult::skipped(step);
    result.status = StepStatus::Failed;
    result.error = Some(error);
    result
}

/// Fold an earlier failed round of a parallel member into its retry.
fn merge_attempts(previous: StepResult, mut latest: StepResult) -> StepResult {
    latest.attempts += previous.attempts;
    latest.cost += previous.cost;
    latest.elapsed_ms += previous.elapsed_ms;
    latest.started_at = previous.started_at;
    let mut log = previous.attempt_log;
    log.append(&mut latest.attempt_log);
    latest.attempt_log = log;
    latest
}

fn with_frames(ctx: &ExecutionContext, frames: &[(String, Value)]) -> ExecutionContext {
    let mut scope = ctx.clone();
    for (name, value) in frames {
        if let Err(e) = scope.set(name, value.clone()) {
            tracing::warn!(variable = %name, error = %e, "cannot restore loop binding for undo");
        }
    }
    scope
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that prevent a run from starting or from being recorded.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("missing capabilities: {}", .0.join(", "))]
    Preflight(Vec<String>),

    #[error("missing required input '{0}'")]
    MissingInput(String),

    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("workflow run not active: {0}")]
    RunNotFound(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::capability::testing::{ScriptedAction, ScriptedGenerator};
    use crate::capability::{ActionOutcome, CapabilityError, ExternalAction};
    use crate::repository::InMemoryRunRepository;
    use crate::workflow::definition::parse_workflow_yaml;

    fn parse(yaml: &str) -> WorkflowDefinition {
        parse_workflow_yaml(yaml).unwrap()
    }

    fn engine(table: CapabilityTable) -> WorkflowEngine<InMemoryRunRepository> {
        WorkflowEngine::new(InMemoryRunRepository::new(), table, EngineConfig::default())
    }

    fn actions(log: &[(String, Map<String, Value>)]) -> Vec<&str> {
        log.iter().map(|(action, _)| action.as_str()).collect()
    }

    fn status_of(run: &RunResult, step: &str) -> StepStatus {
        run.step(step).map(|r| r.status).unwrap()
    }

    const TRIAGE: &str = r#"
name: triage
inputs: [issue_id]
steps:
  - name: fetch
    kind: action
    target: tracker
    action: get_issue
    timeout: 5s
    inputs:
      id: "${issue_id}"
    outputs:
      title: title
  - name: generate
    kind: generate
    target: llm
    prompt: "Write a fix for ${title}"
    cost_limit: 3.0
    estimated_cost: 4.5
    outputs:
      artifact: patch
  - name: publish
    kind: action
    target: scm
    action: open_pr
    on_error: continue
    inputs:
      body: "${patch}"
"#;

    #[tokio::test(start_paused = true)]
    async fn test_budget_denial_fails_run_before_later_steps() {
        let tracker = ScriptedAction::ok().on(
            "get_issue",
            Ok(ActionOutcome::new(json!({ "title": "crash on save" })).with_cost(0.25)),
        );
        let scm = ScriptedAction::ok();
        let llm = ScriptedGenerator::returning("fn fix() {}");
        let (scm_log, llm_log) = (scm.log(), llm.log());
        let engine = engine(
            CapabilityTable::new()
                .with_action("tracker", tracker)
                .with_action("scm", scm)
                .with_generator("llm", llm),
        );

        let inputs = BTreeMap::from([("issue_id".to_string(), json!(42))]);
        let run = engine.execute(&parse(TRIAGE), inputs).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let failure = run.failure.as_ref().unwrap();
        assert_eq!(failure.step, "generate");
        assert_eq!(failure.kind, StepErrorKind::BudgetExceeded);
        assert_eq!(status_of(&run, "fetch"), StepStatus::Success);
        assert!(run.step("publish").is_none(), "publish must never be attempted");
        assert_eq!(scm_log.len(), 0);
        assert_eq!(llm_log.len(), 0);
        assert!((run.total_cost - 0.25).abs() < 1e-12);

        let stored = engine.repo().get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(engine.repo().load_checkpoint(&run.run_id).await.unwrap().is_none());
        assert!(!engine.is_active(run.run_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outputs_flow_forward_and_events_bracket_the_run() {
        let yaml = r#"
name: chain
steps:
  - name: first
    kind: action
    target: t
    action: one
    outputs:
      value: a
  - name: second
    kind: action
    target: t
    action: two
    inputs:
      from_first: "${a}"
"#;
        let action = ScriptedAction::ok().returning("one", json!({ "value": 1 }));
        let log = action.log();
        let engine = engine(CapabilityTable::new().with_action("t", action));
        let mut events = engine.subscribe();

        let run = engine.execute(&parse(yaml), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.failure.is_none());
        let calls = log.all();
        assert_eq!(calls[1].1["from_first"], json!(1));
        assert_eq!(run.outputs["a"], json!(1));

        let first = events.recv().await.unwrap();
        assert!(matches!(first, WorkflowEvent::RunStarted { .. }));
        let mut last = first;
        while let Ok(event) = events.try_recv() {
            last = event;
        }
        assert!(matches!(
            last,
            WorkflowEvent::RunFinished { status: RunStatus::Completed, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preflight_and_missing_inputs_reject_before_recording() {
        let engine = engine(CapabilityTable::new().with_action("tracker", ScriptedAction::ok()));
        let definition = parse(TRIAGE);

        let err = engine.execute(&definition, BTreeMap::new()).await.unwrap_err();
        match err {
            EngineError::Preflight(missing) => {
                assert_eq!(missing.len(), 2);
                assert!(missing.iter().any(|m| m.contains("'llm'")));
                assert!(missing.iter().any(|m| m.contains("'scm'")));
            }
            other => panic!("expected preflight error, got {other}"),
        }

        let engine = engine_with_all_targets();
        let err = engine.execute(&definition, BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingInput(ref name) if name == "issue_id"));
        assert_eq!(engine.repo().run_count(), 0);
    }

    fn engine_with_all_targets() -> WorkflowEngine<InMemoryRunRepository> {
        engine(
            CapabilityTable::new()
                .with_action("tracker", ScriptedAction::ok())
                .with_action("scm", ScriptedAction::ok())
                .with_generator("llm", ScriptedGenerator::returning("x")),
        )
    }

    const BRANCHES: &str = r#"
name: release
steps:
  - name: open_branch
    kind: action
    target: scm
    action: create_branch
    outputs:
      name: branch
    undo:
      name: delete_branch
      kind: action
      target: scm
      action: delete_branch
      inputs:
        branch: "${branch}"
  - name: label
    kind: action
    target: scm
    action: add_label
  - name: comment
    kind: action
    target: scm
    action: comment
    outputs:
      id: comment_id
    undo:
      name: delete_comment
      kind: action
      target: scm
      action: delete_comment
      inputs:
        id: "${comment_id}"
  - name: merge
    kind: action
    target: scm
    action: merge
    on_error: rollback
"#;

    #[tokio::test(start_paused = true)]
    async fn test_rollback_undoes_in_reverse_order() {
        let scm = ScriptedAction::ok()
            .returning("create_branch", json!({ "name": "fix-42" }))
            .returning("comment", json!({ "id": 9 }))
            .on("merge", Err(CapabilityError::permanent("merge conflict")));
        let log = scm.log();
        let engine = engine(CapabilityTable::new().with_action("scm", scm));
        let mut events = engine.subscribe();

        let run = engine.execute(&parse(BRANCHES), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure.as_ref().unwrap().step, "merge");
        assert_eq!(
            actions(&log.all()),
            vec![
                "create_branch",
                "add_label",
                "comment",
                "merge",
                "delete_comment",
                "delete_branch"
            ]
        );
        let calls = log.all();
        assert_eq!(calls[4].1["id"], json!(9));
        assert_eq!(calls[5].1["branch"], json!("fix-42"));

        let report = run.rollback.as_ref().unwrap();
        assert!(report.succeeded);
        assert_eq!(report.undone, vec!["comment", "open_branch"]);
        assert_eq!(report.not_reversible, vec!["label"]);
        assert_eq!(status_of(&run, "open_branch"), StepStatus::RolledBack);
        assert_eq!(status_of(&run, "comment"), StepStatus::RolledBack);
        assert_eq!(status_of(&run, "label"), StepStatus::Success);

        let mut rolled_back = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let WorkflowEvent::StepRolledBack { step, .. } = event {
                rolled_back.push(step);
            }
        }
        assert_eq!(rolled_back, vec!["comment", "open_branch"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_undo_aborts_with_both_errors() {
        let scm = ScriptedAction::ok()
            .returning("create_branch", json!({ "name": "fix-42" }))
            .returning("comment", json!({ "id": 9 }))
            .on("delete_comment", Err(CapabilityError::permanent("forbidden")))
            .on("merge", Err(CapabilityError::permanent("merge conflict")));
        let log = scm.log();
        let engine = engine(CapabilityTable::new().with_action("scm", scm));

        let run = engine.execute(&parse(BRANCHES), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Aborted);
        assert_eq!(run.failure.as_ref().unwrap().message, "merge conflict");
        let report = run.rollback.as_ref().unwrap();
        assert!(!report.succeeded);
        let undo_failure = report.failure.as_ref().unwrap();
        assert_eq!(undo_failure.kind, StepErrorKind::RollbackFailure);
        assert_eq!(undo_failure.step, "delete_comment");
        assert!(undo_failure.message.contains("forbidden"));
        assert!(!actions(&log.all()).contains(&"delete_branch"));
        assert_eq!(status_of(&run, "open_branch"), StepStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_policy_completes_run_and_records_failure() {
        let yaml = r#"
name: notify
steps:
  - name: ping
    kind: action
    target: chat
    action: ping
    on_error: continue
  - name: log
    kind: action
    target: chat
    action: log
"#;
        let chat = ScriptedAction::ok().on("ping", Err(CapabilityError::permanent("channel gone")));
        let log = chat.log();
        let engine = engine(CapabilityTable::new().with_action("chat", chat));

        let run = engine.execute(&parse(yaml), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(status_of(&run, "ping"), StepStatus::Failed);
        assert_eq!(status_of(&run, "log"), StepStatus::Success);
        assert_eq!(run.failure.as_ref().unwrap().step, "ping");
        assert_eq!(log.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conditions_skip_and_choose_branches() {
        let yaml = r#"
name: route
variables:
  severity: 1
steps:
  - name: page
    kind: action
    target: chat
    action: page
    condition: "severity > 2"
  - name: decide
    kind: conditional
    condition: "${severity > 2}"
    steps:
      - name: escalate
        kind: action
        target: chat
        action: escalate
    else:
      - name: queue
        kind: action
        target: chat
        action: queue
  - name: audit
    kind: conditional
    condition: "severity > 5"
    steps:
      - name: audit_log
        kind: action
        target: chat
        action: audit
"#;
        let chat = ScriptedAction::ok();
        let log = chat.log();
        let engine = engine(CapabilityTable::new().with_action("chat", chat));

        let run = engine.execute(&parse(yaml), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(actions(&log.all()), vec!["queue"]);
        assert_eq!(status_of(&run, "page"), StepStatus::Skipped);
        assert_eq!(status_of(&run, "audit"), StepStatus::Skipped);
        assert!(run.step("escalate").is_none());
    }

    /// Tracks how many invocations are in flight at once.
    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    struct GaugedAction(Arc<Gauge>);

    impl ExternalAction for GaugedAction {
        async fn invoke(
            &self,
            action: &str,
            _inputs: &Map<String, Value>,
        ) -> Result<ActionOutcome, CapabilityError> {
            let now = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.active.fetch_sub(1, Ordering::SeqCst);
            Ok(ActionOutcome::new(json!({ "value": action })))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_group_respects_fan_out_and_merges_in_order() {
        let yaml = r#"
name: fanout
steps:
  - name: group
    kind: parallel
    max_fan_out: 2
    steps:
      - name: a
        kind: action
        target: t
        action: a
        outputs:
          value: a_out
      - name: b
        kind: action
        target: t
        action: b
        outputs:
          value: b_out
      - name: c
        kind: action
        target: t
        action: c
        outputs:
          value: c_out
      - name: d
        kind: action
        target: t
        action: d
        outputs:
          value: d_out
"#;
        let gauge = Arc::new(Gauge::default());
        let engine = engine(CapabilityTable::new().with_action("t", GaugedAction(gauge.clone())));

        let run = engine.execute(&parse(yaml), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        let order: Vec<&str> = run.steps.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        assert_eq!(run.outputs["c_out"], json!("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_retry_reruns_only_failed_members() {
        let yaml = r#"
name: fanout
steps:
  - name: group
    kind: parallel
    on_error: retry
    retry_count: 3
    steps:
      - name: steady
        kind: action
        target: t
        action: steady
      - name: flaky
        kind: action
        target: t
        action: flaky
        outputs:
          value: flaky_out
"#;
        let action = ScriptedAction::ok()
            .on("flaky", Err(CapabilityError::transient("503")))
            .on("flaky", Ok(ActionOutcome::new(json!({ "value": "ok" }))));
        let log = action.log();
        let engine = engine(CapabilityTable::new().with_action("t", action));
        let mut events = engine.subscribe();

        let run = engine.execute(&parse(yaml), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        let calls = log.all();
        assert_eq!(actions(&calls).iter().filter(|a| **a == "steady").count(), 1);
        assert_eq!(actions(&calls).iter().filter(|a| **a == "flaky").count(), 2);
        let flaky = run.step("flaky").unwrap();
        assert_eq!(flaky.attempts, 2);
        assert_eq!(flaky.attempt_log.len(), 1);
        assert_eq!(run.outputs["flaky_out"], json!("ok"));

        let mut retried = false;
        while let Ok(event) = events.try_recv() {
            if let WorkflowEvent::StepRetrying { step, .. } = event {
                retried |= step == "group";
            }
        }
        assert!(retried);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_failure_follows_group_policy() {
        let yaml = r#"
name: fanout
steps:
  - name: group
    kind: parallel
    steps:
      - name: good
        kind: action
        target: t
        action: good
        outputs:
          value: good_out
      - name: bad
        kind: action
        target: t
        action: bad
  - name: never
    kind: action
    target: t
    action: never
"#;
        let action = ScriptedAction::ok()
            .returning("good", json!({ "value": 1 }))
            .on("bad", Err(CapabilityError::transient("503")));
        let log = action.log();
        let engine = engine(CapabilityTable::new().with_action("t", action));

        let run = engine.execute(&parse(yaml), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure.as_ref().unwrap().step, "bad");
        assert_eq!(run.outputs["good_out"], json!(1));
        assert!(!actions(&log.all()).contains(&"never"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_binds_item_and_index_and_collects_results() {
        let yaml = r#"
name: each
variables:
  files: ["a.rs", "b.rs", "c.rs"]
steps:
  - name: review
    kind: loop
    over: "${files}"
    as: file
    outputs:
      results: reviews
      count: reviewed
    step:
      name: lint
      kind: action
      target: t
      action: lint
      inputs:
        path: "${file}"
        position: "${loop.index}"
      outputs:
        inputs.path: linted
  - name: report
    kind: action
    target: t
    action: report
    inputs:
      total: "${reviewed}"
"#;
        let action = ScriptedAction::ok();
        let log = action.log();
        let engine = engine(CapabilityTable::new().with_action("t", action));

        let run = engine.execute(&parse(yaml), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        let calls = log.all();
        let positions: Vec<&Value> = calls[..3].iter().map(|(_, i)| &i["position"]).collect();
        assert_eq!(positions, vec![&json!(0), &json!(1), &json!(2)]);
        assert_eq!(calls[3].1["total"], json!(3));
        assert_eq!(
            run.outputs["reviews"],
            json!([{ "linted": "a.rs" }, { "linted": "b.rs" }, { "linted": "c.rs" }])
        );
        assert!(!run.outputs.contains_key("file"));
        assert!(!run.outputs.contains_key(LOOP_VAR));
        assert_eq!(run.outputs["linted"], json!("c.rs"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_over_object_is_capped() {
        let yaml = r#"
name: each
variables:
  owners:
    api: ana
    cli: bo
    web: cy
steps:
  - name: notify
    kind: loop
    over: "${owners}"
    as: entry
    max_iterations: 2
    outputs:
      count: notified
    step:
      name: send
      kind: action
      target: t
      action: send
      inputs:
        area: "${entry.key}"
        owner: "${entry.value}"
"#;
        let action = ScriptedAction::ok();
        let log = action.log();
        let engine = engine(CapabilityTable::new().with_action("t", action));

        let run = engine.execute(&parse(yaml), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        let calls = log.all();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1["area"], json!("api"));
        assert_eq!(calls[0].1["owner"], json!("ana"));
        assert_eq!(run.outputs["notified"], json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_iterations_each_get_their_own_step_ceiling() {
        let yaml = r#"
name: each
variables:
  files: ["a.rs", "b.rs", "c.rs", "d.rs", "e.rs"]
steps:
  - name: review
    kind: loop
    over: "${files}"
    as: file
    step:
      name: lint
      kind: action
      target: t
      action: lint
      cost_limit: 1.0
      estimated_cost: 0.4
      inputs:
        path: "${file}"
"#;
        let action = ScriptedAction::ok().on(
            "lint",
            Ok(ActionOutcome::new(json!({ "ok": true })).with_cost(0.4)),
        );
        let log = action.log();
        let engine = engine(CapabilityTable::new().with_action("t", action));

        let run = engine.execute(&parse(yaml), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed, "{:?}", run.failure);
        assert_eq!(log.len(), 5);
        assert!((run.total_cost - 2.0).abs() < 1e-9);
        assert_eq!(engine.budget().snapshot().outstanding_reservations, 0);
    }

    const SLOW: &str = r#"
name: slow
steps:
  - name: wait
    kind: action
    target: t
    action: wait
  - name: after
    kind: action
    target: t
    action: after
"#;

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_run() {
        let action = ScriptedAction::ok().with_delay(Duration::from_secs(60));
        let log = action.log();
        let engine = engine(CapabilityTable::new().with_action("t", action));
        let definition = parse(SLOW);
        let token = CancellationToken::new();

        let (run, ()) = tokio::join!(
            engine.execute_with_cancel(&definition, BTreeMap::new(), token.clone()),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            }
        );
        let run = run.unwrap();

        assert_eq!(run.status, RunStatus::Aborted);
        assert_eq!(run.failure.as_ref().unwrap().kind, StepErrorKind::Cancelled);
        assert_eq!(log.len(), 1, "'after' must not start");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_by_run_id() {
        let action = ScriptedAction::ok().with_delay(Duration::from_secs(60));
        let engine = engine(CapabilityTable::new().with_action("t", action));
        let definition = parse(SLOW);
        let mut events = engine.subscribe();

        let (run, cancelled) = tokio::join!(engine.execute(&definition, BTreeMap::new()), async {
            loop {
                if let Ok(WorkflowEvent::StepStarted { run_id, .. }) = events.recv().await {
                    return engine.cancel(run_id);
                }
            }
        });

        assert!(cancelled.is_ok());
        assert_eq!(run.unwrap().status, RunStatus::Aborted);
        assert!(matches!(
            engine.cancel(Uuid::now_v7()),
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_aborts() {
        let yaml = format!("settings:\n  timeout: 2s\n{}", SLOW.trim_start());
        let action = ScriptedAction::ok().with_delay(Duration::from_secs(10));
        let engine = engine(CapabilityTable::new().with_action("t", action));

        let run = engine.execute(&parse(&yaml), BTreeMap::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Aborted);
        let failure = run.failure.as_ref().unwrap();
        assert_eq!(failure.kind, StepErrorKind::Timeout);
        assert_eq!(failure.step, "wait");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_continues_after_last_checkpoint() {
        let yaml = r#"
name: ship
steps:
  - name: fetch
    kind: action
    target: tracker
    action: get_issue
    outputs:
      title: title
  - name: publish
    kind: action
    target: scm
    action: open_pr
    inputs:
      body: "${title}"
"#;
        let definition = parse(yaml);
        let repo = InMemoryRunRepository::new();

        // A run that crashed right after its first step.
        let run_id = Uuid::now_v7();
        let mut run = RunResult::new(run_id, &definition.name, &definition.fingerprint);
        run.status = RunStatus::Running;
        run.total_cost = 0.5;
        let manager = CheckpointManager::new(repo.clone());
        manager.record_start(&run).await.unwrap();
        let mut ctx = ExecutionContext::new(run_id, &definition.name, &definition.variables, []);
        ctx.set("title", json!("crash on save")).unwrap();
        manager.save(&run, &ctx, 1).await.unwrap();

        let tracker = ScriptedAction::ok();
        let scm = ScriptedAction::ok();
        let (tracker_log, scm_log) = (tracker.log(), scm.log());
        let engine = WorkflowEngine::new(
            repo.clone(),
            CapabilityTable::new()
                .with_action("tracker", tracker)
                .with_action("scm", scm),
            EngineConfig::default(),
        );

        let resumed = engine.resume(run_id, &definition).await.unwrap();

        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(tracker_log.len(), 0);
        assert_eq!(scm_log.all()[0].1["body"], json!("crash on save"));
        assert!((resumed.total_cost - 0.5).abs() < 1e-12);
        assert!(repo.load_checkpoint(&run_id).await.unwrap().is_none());

        let again = engine.resume(run_id, &definition).await.unwrap_err();
        assert!(matches!(
            again,
            EngineError::Checkpoint(CheckpointError::AlreadyFinished { .. })
        ));
    }
}
