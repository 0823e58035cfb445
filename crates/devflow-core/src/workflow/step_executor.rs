//! Step executor: runs one action or generation step through the guard
//! pipeline.
//!
//! Every attempt predicts and reserves budget, asks the target's circuit
//! breaker, takes a rate-limit token, invokes the capability under the step
//! timeout, records the outcome on the breaker and reconciles the
//! reservation. Generation steps then route the artifact through the quality
//! pipeline. The error policy decides between another attempt and a final
//! [`StepResult`] plus a [`StepDirective`] for the engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use devflow_types::budget::ReservationId;
use devflow_types::config::EngineConfig;
use devflow_types::event::WorkflowEvent;
use devflow_types::quality::{Artifact, QualityGateResult, QualityVerdict, TaskContext};
use devflow_types::run::{AttemptRecord, StepError, StepErrorKind, StepResult, StepStatus};
use devflow_types::workflow::{ErrorPolicy, QualitySpec, StepKind, StepSpec};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::budget::{
    BudgetEnforcer, BudgetError, BudgetRequest, CostEstimator, HeuristicEstimator, PricingTable,
};
use crate::capability::{
    ActionOutcome, CapabilityError, CapabilityTable, GenerationOutcome, GenerationRequest,
};
use crate::event::EventBus;
use crate::guard::{Cancelled, Guards};
use crate::quality::QualityPipeline;

use super::context::ExecutionContext;
use super::resolver::{ResolveError, extract_path, resolve_value};
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// StepDirective / StepOutcome
// ---------------------------------------------------------------------------

/// What the engine should do once a step has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirective {
    /// The step succeeded; go on.
    Proceed,
    /// The step failed under `on_error: continue`; record it and go on.
    Continue,
    /// Undo earlier successful steps, then fail the run.
    Rollback,
    /// Stop the run.
    Abort,
}

impl StepDirective {
    /// Directive for a step that ended with `error` under `policy`.
    ///
    /// An exhausted `Retry` escalates to `Fail`. Cancellation always aborts.
    pub fn after_failure(policy: &ErrorPolicy, error: &StepError) -> Self {
        if error.kind == StepErrorKind::Cancelled {
            return Self::Abort;
        }
        match policy {
            ErrorPolicy::Continue => Self::Continue,
            ErrorPolicy::Rollback => Self::Rollback,
            ErrorPolicy::Fail | ErrorPolicy::Retry { .. } => Self::Abort,
        }
    }
}

/// Final result of a step plus the engine directive.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: StepResult,
    pub directive: StepDirective,
}

// ---------------------------------------------------------------------------
// Attempt bookkeeping
// ---------------------------------------------------------------------------

/// Inputs and prompt resolved once per step.
struct Call {
    inputs: Map<String, Value>,
    prompt: Option<Value>,
}

enum Produced {
    Action(ActionOutcome),
    Generation(GenerationOutcome),
}

struct Attempt {
    output: Value,
    cost: f64,
    quality: Option<QualityGateResult>,
    review_required: bool,
}

/// Run, workflow and step budget account an attempt belongs to.
#[derive(Clone, Copy)]
struct AttemptScope<'a> {
    run_id: Uuid,
    budget: Uuid,
    workflow: &'a str,
}

struct AttemptFailure {
    error: StepError,
    /// Amount charged before the failure was detected.
    cost: f64,
    /// Whether the capability was actually called.
    invoked: bool,
    quality: Option<QualityGateResult>,
}

impl AttemptFailure {
    fn before_call(error: StepError) -> Self {
        Self {
            error,
            cost: 0.0,
            invoked: false,
            quality: None,
        }
    }

    fn after_call(error: StepError, cost: f64) -> Self {
        Self {
            error,
            cost,
            invoked: true,
            quality: None,
        }
    }
}

pub(super) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(super) async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Runs leaf steps. Cheap to clone; every shared component sits behind an
/// `Arc`.
#[derive(Clone)]
pub struct StepExecutor {
    capabilities: Arc<CapabilityTable>,
    guards: Guards,
    budget: Arc<BudgetEnforcer>,
    estimator: Arc<dyn CostEstimator>,
    quality: Arc<QualityPipeline>,
    pricing: Arc<PricingTable>,
    config: Arc<EngineConfig>,
    events: EventBus,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("capabilities", &self.capabilities)
            .field("quality", &self.quality)
            .finish_non_exhaustive()
    }
}

impl StepExecutor {
    /// Executor with guards, budget, estimator and quality pipeline built
    /// from `config`. Guard and budget events go to `events`.
    pub fn new(
        capabilities: Arc<CapabilityTable>,
        config: Arc<EngineConfig>,
        events: EventBus,
    ) -> Self {
        Self {
            guards: Guards::from_config(&config, events.clone()),
            budget: Arc::new(BudgetEnforcer::new(config.budget.clone(), events.clone())),
            estimator: Arc::new(HeuristicEstimator::new(&config)),
            quality: Arc::new(QualityPipeline::new(config.quality.clone())),
            pricing: Arc::new(PricingTable::new(config.pricing.clone())),
            capabilities,
            config,
            events,
        }
    }

    pub fn with_guards(mut self, guards: Guards) -> Self {
        self.guards = guards;
        self
    }

    pub fn with_budget(mut self, budget: Arc<BudgetEnforcer>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_quality_pipeline(mut self, pipeline: QualityPipeline) -> Self {
        self.quality = Arc::new(pipeline);
        self
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn guards(&self) -> &Guards {
        &self.guards
    }

    pub fn budget(&self) -> &Arc<BudgetEnforcer> {
        &self.budget
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run one action or generation step to its final result.
    ///
    /// The step's `condition` is the engine's concern; this always runs.
    /// Bound outputs are returned in `result.outputs`, not written to `ctx`.
    /// Each call has its own step budget account; retries share it.
    pub async fn execute(
        &self,
        step: &StepSpec,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let scope = Uuid::now_v7();
        let outcome = self.execute_in_scope(step, ctx, cancel, scope).await;
        self.budget.close_scope(ctx.run_id, scope);
        outcome
    }

    async fn execute_in_scope(
        &self,
        step: &StepSpec,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        scope: Uuid,
    ) -> StepOutcome {
        let run_id = ctx.run_id;
        let clock = Instant::now();
        let started_at = Utc::now();
        let mut result = StepResult {
            step: step.name.clone(),
            status: StepStatus::Failed,
            outputs: BTreeMap::new(),
            error: None,
            attempts: 0,
            attempt_log: Vec::new(),
            elapsed_ms: 0,
            cost: 0.0,
            review_required: false,
            quality: None,
            started_at,
            completed_at: started_at,
        };

        self.events.publish(WorkflowEvent::StepStarted {
            run_id,
            step: step.name.clone(),
            kind: step.kind_name().to_string(),
        });

        let Some(target) = step.target() else {
            let error = StepError::new(
                StepErrorKind::Resolution,
                format!("step '{}' does not call a capability", step.name),
            );
            return self.finish_failed(step, run_id, result, clock, error);
        };

        let call = match prepare(step, ctx) {
            Ok(call) => call,
            Err(e) => {
                let error = StepError::new(StepErrorKind::Resolution, e.to_string());
                return self.finish_failed(step, run_id, result, clock, error);
            }
        };

        let attempt_scope = AttemptScope {
            run_id,
            budget: scope,
            workflow: &ctx.workflow,
        };
        let max_attempts = step.policy.max_attempts();
        let mut circuit_waits = 0u32;
        let mut feedback: Vec<String> = Vec::new();

        loop {
            let attempt_clock = Instant::now();
            let number = result.attempts + 1;

            let failure = match self
                .attempt(step, target, &call, number, &feedback, attempt_scope, cancel)
                .await
            {
                Ok(attempt) => {
                    result.attempts = number;
                    result.cost += attempt.cost;
                    result.review_required = attempt.review_required;
                    result.quality = attempt.quality;
                    return match bind_outputs(step, &attempt.output) {
                        Ok(bound) => {
                            result.outputs = bound;
                            self.finish_success(step, run_id, result, clock)
                        }
                        Err(error) => self.finish_failed(step, run_id, result, clock, error),
                    };
                }
                Err(failure) => failure,
            };

            if failure.invoked {
                result.attempts = number;
            }
            result.cost += failure.cost;
            if let Some(quality) = &failure.quality {
                feedback = quality_feedback(quality);
            }
            if failure.quality.is_some() {
                result.quality = failure.quality.clone();
            }

            let circuit_open = failure.error.kind == StepErrorKind::CircuitOpen;
            let retry = if circuit_open {
                circuit_waits += 1;
                matches!(step.policy, ErrorPolicy::Retry { .. }) && circuit_waits <= max_attempts
            } else {
                RetryHandler::should_retry(&step.policy, result.attempts, &failure.error)
            };

            let mut record = AttemptRecord {
                attempt: if failure.invoked { number } else { 0 },
                error: failure.error.clone(),
                delay_ms: None,
                elapsed_ms: millis(attempt_clock.elapsed()),
                cost: failure.cost,
            };

            if !retry {
                result.attempt_log.push(record);
                return self.finish_failed(step, run_id, result, clock, failure.error);
            }

            let backoff_index = if circuit_open {
                circuit_waits
            } else {
                result.attempts
            };
            let delay = RetryHandler::backoff_delay(&self.config.retry, &step.policy, backoff_index);
            record.delay_ms = Some(millis(delay));
            result.attempt_log.push(record);

            tracing::warn!(
                run_id = %run_id,
                step = %step.name,
                target,
                attempt = number,
                delay_ms = millis(delay),
                error = %failure.error,
                "step attempt failed, retrying"
            );
            self.events.publish(WorkflowEvent::StepRetrying {
                run_id,
                step: step.name.clone(),
                attempt: number,
                delay_ms: millis(delay),
                error: failure.error.to_string(),
            });

            if pause(delay, cancel).await.is_err() {
                let error = StepError::new(StepErrorKind::Cancelled, "run cancelled during backoff");
                return self.finish_failed(step, run_id, result, clock, error);
            }
        }
    }

    // -----------------------------------------------------------------------
    // One attempt
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        step: &StepSpec,
        target: &str,
        call: &Call,
        number: u32,
        feedback: &[String],
        scope: AttemptScope<'_>,
        cancel: &CancellationToken,
    ) -> Result<Attempt, AttemptFailure> {
        let run_id = scope.run_id;
        if cancel.is_cancelled() {
            return Err(AttemptFailure::before_call(StepError::new(
                StepErrorKind::Cancelled,
                "run cancelled",
            )));
        }

        let predicted = self.estimator.predict(scope.workflow, step);
        let reservation = self
            .budget
            .reserve(&BudgetRequest {
                run_id,
                step: step.name.clone(),
                scope: scope.budget,
                amount: predicted,
                step_limit: step.cost_limit,
            })
            .map_err(|e| {
                AttemptFailure::before_call(StepError::new(
                    StepErrorKind::BudgetExceeded,
                    e.to_string(),
                ))
            })?;

        if !self.guards.breakers.allow(target) {
            self.release(reservation);
            return Err(AttemptFailure::before_call(StepError::new(
                StepErrorKind::CircuitOpen,
                format!("circuit open for target '{target}'"),
            )));
        }

        if self.guards.limiter.acquire(target, cancel).await.is_err() {
            self.release(reservation);
            return Err(AttemptFailure::before_call(StepError::new(
                StepErrorKind::Cancelled,
                "run cancelled while waiting for a rate limit token",
            )));
        }

        let timeout = step
            .timeout
            .unwrap_or_else(|| self.config.default_step_timeout());
        tracing::debug!(run_id = %run_id, step = %step.name, target, attempt = number, "invoking capability");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = tokio::time::timeout(timeout, self.invoke(step, call, number, feedback)) => Some(outcome),
        };

        let produced = match outcome {
            None => {
                self.release(reservation);
                return Err(AttemptFailure::after_call(
                    StepError::new(StepErrorKind::Cancelled, "run cancelled while the call was in flight"),
                    0.0,
                ));
            }
            Some(Err(_elapsed)) => {
                self.guards.breakers.record_failure(target, Some("timed out"));
                self.release(reservation);
                return Err(AttemptFailure::after_call(
                    StepError::new(
                        StepErrorKind::Timeout,
                        format!("'{target}' did not answer within {timeout:?}"),
                    ),
                    0.0,
                ));
            }
            Some(Ok(Err(err))) => {
                self.guards.breakers.record_failure(target, Some(&err.message));
                self.release(reservation);
                let error = if err.retryable {
                    StepError::new(StepErrorKind::ExternalCall, err.message)
                } else {
                    StepError::permanent(StepErrorKind::ExternalCall, err.message)
                };
                return Err(AttemptFailure::after_call(error, 0.0));
            }
            Some(Ok(Ok(produced))) => {
                self.guards.breakers.record_success(target);
                produced
            }
        };

        let actual = self.actual_cost(step, target, &produced);
        let charged = match self.budget.reconcile(reservation, actual) {
            Ok(settlement) => settlement.charged,
            Err(BudgetError::Overrun { actual, charged }) => {
                self.estimator.observe(scope.workflow, step, actual);
                return Err(AttemptFailure::after_call(
                    StepError::new(
                        StepErrorKind::BudgetExceeded,
                        format!("actual cost {actual:.4} exceeded the budget; charged {charged:.4}"),
                    ),
                    charged,
                ));
            }
            Err(e) => {
                return Err(AttemptFailure::after_call(
                    StepError::new(StepErrorKind::BudgetExceeded, e.to_string()),
                    0.0,
                ));
            }
        };
        self.estimator.observe(scope.workflow, step, actual);

        match produced {
            Produced::Action(outcome) => Ok(Attempt {
                output: outcome.outputs,
                cost: charged,
                quality: None,
                review_required: false,
            }),
            Produced::Generation(generated) => self.review(step, run_id, generated, charged),
        }
    }

    async fn invoke(
        &self,
        step: &StepSpec,
        call: &Call,
        attempt: u32,
        feedback: &[String],
    ) -> Result<Produced, CapabilityError> {
        match &step.kind {
            StepKind::ExternalAction { target, action } => {
                let capability = self.capabilities.action(target).ok_or_else(|| {
                    CapabilityError::permanent(format!("no action registered for target '{target}'"))
                })?;
                capability
                    .invoke(action, &call.inputs)
                    .await
                    .map(Produced::Action)
            }
            StepKind::GenerationAction {
                target,
                model,
                max_tokens,
                quality,
                ..
            } => {
                let generator = self.capabilities.generator(target).ok_or_else(|| {
                    CapabilityError::permanent(format!("no generator registered as '{target}'"))
                })?;
                let request = GenerationRequest {
                    prompt: call.prompt.clone().unwrap_or(Value::Null),
                    inputs: call.inputs.clone(),
                    model: model.clone(),
                    max_tokens: *max_tokens,
                    budget: step.cost_limit.unwrap_or(self.config.budget.step_limit),
                    language: quality.language.clone(),
                    attempt,
                    feedback: feedback.to_vec(),
                };
                generator.generate(&request).await.map(Produced::Generation)
            }
            _ => Err(CapabilityError::permanent(format!(
                "step '{}' does not call a capability",
                step.name
            ))),
        }
    }

    /// Reported cost, or the configured estimate when the capability
    /// reported none.
    fn actual_cost(&self, step: &StepSpec, target: &str, produced: &Produced) -> f64 {
        match produced {
            Produced::Action(outcome) => outcome
                .cost
                .unwrap_or_else(|| self.config.cost_per_call(target)),
            Produced::Generation(generated) => generated.cost.unwrap_or_else(|| {
                let model = generated.model.as_deref().or(requested_model(step));
                self.pricing
                    .cost(model, generated.tokens_in, generated.tokens_out)
            }),
        }
    }

    /// Route a generated artifact through the quality pipeline.
    fn review(
        &self,
        step: &StepSpec,
        run_id: Uuid,
        generated: GenerationOutcome,
        charged: f64,
    ) -> Result<Attempt, AttemptFailure> {
        let spec = match &step.kind {
            StepKind::GenerationAction { quality, .. } => quality.clone(),
            _ => QualitySpec::default(),
        };
        let language = generated.language.clone().or_else(|| spec.language.clone());
        let artifact = Artifact::new(generated.content, language.as_deref());

        let gate_result = if spec.skip {
            None
        } else {
            let task = TaskContext {
                step: step.name.clone(),
                language: artifact.language.clone(),
                requires_tests: spec.requires_tests,
            };
            let result = self.quality.validate(&artifact, &task);
            tracing::info!(
                run_id = %run_id,
                step = %step.name,
                overall = result.overall,
                verdict = %result.verdict,
                "quality gates evaluated"
            );
            self.events.publish(WorkflowEvent::QualityVerdict {
                run_id,
                step: step.name.clone(),
                overall: result.overall,
                verdict: result.verdict,
            });
            Some(result)
        };

        let verdict = gate_result
            .as_ref()
            .map_or(QualityVerdict::Approve, |r| r.verdict);

        if verdict == QualityVerdict::Regenerate {
            let message = match gate_result.as_ref().and_then(|r| r.short_circuited_by.as_deref()) {
                Some(gate) => format!("quality gate '{gate}' scored below its floor"),
                None => format!(
                    "quality score {:.2} below the review threshold",
                    gate_result.as_ref().map_or(0.0, |r| r.overall)
                ),
            };
            return Err(AttemptFailure {
                error: StepError::new(StepErrorKind::QualityGateRegenerate, message),
                cost: charged,
                invoked: true,
                quality: gate_result,
            });
        }

        let review_required = verdict == QualityVerdict::RequireHumanReview;
        let output = json!({
            "artifact": artifact.content,
            "language": artifact.language,
            "model": generated.model.as_deref().or(requested_model(step)),
            "tokens_in": generated.tokens_in,
            "tokens_out": generated.tokens_out,
            "cost": charged,
            "quality": gate_result,
            "review_required": review_required,
        });

        Ok(Attempt {
            output,
            cost: charged,
            quality: gate_result,
            review_required,
        })
    }

    fn release(&self, reservation: ReservationId) {
        if let Err(e) = self.budget.release(reservation) {
            tracing::warn!(reservation = %reservation, error = %e, "failed to release budget reservation");
        }
    }

    // -----------------------------------------------------------------------
    // Final results
    // -----------------------------------------------------------------------

    fn finish_success(
        &self,
        step: &StepSpec,
        run_id: Uuid,
        mut result: StepResult,
        clock: Instant,
    ) -> StepOutcome {
        result.status = StepStatus::Success;
        result.elapsed_ms = millis(clock.elapsed());
        result.completed_at = Utc::now();

        tracing::info!(
            run_id = %run_id,
            step = %step.name,
            attempts = result.attempts,
            cost = result.cost,
            review_required = result.review_required,
            "step completed"
        );
        self.events.publish(WorkflowEvent::StepCompleted {
            run_id,
            step: step.name.clone(),
            duration_ms: result.elapsed_ms,
            cost: result.cost,
        });

        StepOutcome {
            result,
            directive: StepDirective::Proceed,
        }
    }

    fn finish_failed(
        &self,
        step: &StepSpec,
        run_id: Uuid,
        mut result: StepResult,
        clock: Instant,
        error: StepError,
    ) -> StepOutcome {
        let directive = StepDirective::after_failure(&step.policy, &error);
        result.status = StepStatus::Failed;
        result.elapsed_ms = millis(clock.elapsed());
        result.completed_at = Utc::now();

        tracing::warn!(
            run_id = %run_id,
            step = %step.name,
            kind = %error.kind,
            attempts = result.attempts,
            policy = step.policy.name(),
            error = %error.message,
            "step failed"
        );
        self.events.publish(WorkflowEvent::StepFailed {
            run_id,
            step: step.name.clone(),
            kind: error.kind,
            error: error.message.clone(),
        });

        result.error = Some(error);
        StepOutcome { result, directive }
    }
}

fn prepare(step: &StepSpec, ctx: &ExecutionContext) -> Result<Call, ResolveError> {
    let mut inputs = Map::new();
    for (name, value) in &step.inputs {
        inputs.insert(name.clone(), resolve_value(value, ctx)?);
    }
    let prompt = match &step.kind {
        StepKind::GenerationAction { prompt, .. } => Some(resolve_value(prompt, ctx)?),
        _ => None,
    };
    Ok(Call { inputs, prompt })
}

fn requested_model(step: &StepSpec) -> Option<&str> {
    match &step.kind {
        StepKind::GenerationAction { model, .. } => model.as_deref(),
        _ => None,
    }
}

/// Extract every declared output path from a capability result.
fn bind_outputs(step: &StepSpec, output: &Value) -> Result<BTreeMap<String, Value>, StepError> {
    step.outputs
        .iter()
        .map(|(path, var)| {
            extract_path(output, path)
                .map(|value| (var.clone(), value.clone()))
                .ok_or_else(|| {
                    StepError::new(
                        StepErrorKind::Resolution,
                        format!("result path '{path}' not found in output of step '{}'", step.name),
                    )
                })
        })
        .collect()
}

/// Gate findings handed to the generator on the next attempt.
fn quality_feedback(result: &QualityGateResult) -> Vec<String> {
    result
        .gates
        .iter()
        .flat_map(|gate| {
            gate.issues
                .iter()
                .map(move |issue| format!("{}: {}", gate.gate, issue.message))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
