//! Cost prediction for budgeted steps.
//!
//! No trained model is assumed. [`HeuristicEstimator`] prefers, in order:
//! the step's declared `estimated_cost`, a moving average of what the same
//! step of the same workflow actually cost before, a token-priced estimate for generation steps,
//! and finally the target's flat per-call cost.

use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;
use devflow_types::config::{EngineConfig, ModelPricing};
use devflow_types::workflow::{StepKind, StepSpec};

/// Samples kept per step for the moving average.
const HISTORY_WINDOW: usize = 10;

/// Output tokens assumed when a generation step sets no `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Pluggable cost predictor.
pub trait CostEstimator: Send + Sync {
    /// Predicted cost of one attempt of `step` in `workflow`.
    fn predict(&self, workflow: &str, step: &StepSpec) -> f64;

    /// Feed back the actual cost of a completed attempt.
    fn observe(&self, workflow: &str, step: &StepSpec, actual: f64);
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Model pricing lookup with a conservative fallback.
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: Vec<ModelPricing>,
    fallback: ModelPricing,
}

impl PricingTable {
    pub fn new(entries: Vec<ModelPricing>) -> Self {
        Self {
            entries,
            fallback: ModelPricing {
                model_pattern: "*".to_string(),
                input_cost_per_million: 15.0,
                output_cost_per_million: 75.0,
            },
        }
    }

    /// First entry whose pattern matches `model`, else the fallback.
    pub fn price_for(&self, model: Option<&str>) -> &ModelPricing {
        let model = model.unwrap_or("");
        self.entries
            .iter()
            .find(|entry| pattern_matches(&entry.model_pattern, model))
            .unwrap_or(&self.fallback)
    }

    pub fn cost(&self, model: Option<&str>, tokens_in: u64, tokens_out: u64) -> f64 {
        let price = self.price_for(model);
        (tokens_in as f64 * price.input_cost_per_million
            + tokens_out as f64 * price.output_cost_per_million)
            / 1_000_000.0
    }
}

/// `*` matches any run of characters; everything else is literal.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !name.starts_with(first)
        || !name.ends_with(last)
        || name.len() < first.len() + last.len()
    {
        return false;
    }
    let mut rest = &name[first.len()..name.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

// ---------------------------------------------------------------------------
// HeuristicEstimator
// ---------------------------------------------------------------------------

/// Default estimator backed by configuration and observed history.
#[derive(Debug)]
pub struct HeuristicEstimator {
    pricing: PricingTable,
    per_call: HashMap<String, f64>,
    /// Recent actual costs keyed by `(workflow, step)`.
    history: DashMap<(String, String), VecDeque<f64>>,
}

impl HeuristicEstimator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            pricing: PricingTable::new(config.pricing.clone()),
            per_call: config
                .targets
                .iter()
                .map(|(name, target)| (name.clone(), target.cost_per_call))
                .collect(),
            history: DashMap::new(),
        }
    }

    fn average(&self, workflow: &str, step: &str) -> Option<f64> {
        let samples = self
            .history
            .get(&(workflow.to_string(), step.to_string()))?;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

impl CostEstimator for HeuristicEstimator {
    fn predict(&self, workflow: &str, step: &StepSpec) -> f64 {
        if let Some(declared) = step.estimated_cost {
            return declared;
        }
        if let Some(average) = self.average(workflow, &step.name) {
            return average;
        }
        match &step.kind {
            StepKind::GenerationAction {
                model, max_tokens, ..
            } => self.pricing.cost(
                model.as_deref(),
                0,
                u64::from(max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
            ),
            StepKind::ExternalAction { target, .. } => {
                self.per_call.get(target).copied().unwrap_or(0.0)
            }
            _ => 0.0,
        }
    }

    fn observe(&self, workflow: &str, step: &StepSpec, actual: f64) {
        if !actual.is_finite() || actual < 0.0 {
            return;
        }
        let mut samples = self
            .history
            .entry((workflow.to_string(), step.name.clone()))
            .or_default();
        samples.push_back(actual);
        if samples.len() > HISTORY_WINDOW {
            samples.pop_front();
        }
    }
}
