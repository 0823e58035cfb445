//! Engine configuration types for devflow.
//!
//! `EngineConfig` is the top-level `devflow.toml`. Every field has a default,
//! so an empty file (or no file at all) yields a working engine.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Step timeout when a step does not declare one.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Concurrent members per parallel group when the workflow does not say.
    #[serde(default = "default_max_fan_out")]
    pub max_fan_out: usize,

    /// Iteration cap for loop steps.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub quality: QualityConfig,

    /// Pricing used to estimate and reconcile generation cost.
    #[serde(default)]
    pub pricing: Vec<ModelPricing>,

    /// Per-target settings keyed by capability name.
    #[serde(default)]
    pub targets: HashMap<String, TargetConfig>,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_fan_out() -> usize {
    4
}

fn default_max_loop_iterations() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            max_fan_out: default_max_fan_out(),
            max_loop_iterations: default_max_loop_iterations(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limits: RateLimitConfig::default(),
            budget: BudgetConfig::default(),
            quality: QualityConfig::default(),
            pricing: Vec::new(),
            targets: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    /// Flat per-call cost configured for a target (0 when unset).
    pub fn cost_per_call(&self, target: &str) -> f64 {
        self.targets.get(target).map_or(0.0, |t| t.cost_per_call)
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Backoff schedule: `base * 2^(attempt-1)` plus jitter, capped at `max`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts for `on_error: retry` steps without `retry_count`.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the exponential delay, in `[0, 1)`.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Per-target overrides.
    #[serde(default)]
    pub targets: HashMap<String, BreakerOverride>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    2
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
            targets: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerOverride {
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub recovery_timeout_secs: Option<u64>,
    #[serde(default)]
    pub success_threshold: Option<u32>,
}

/// Effective breaker thresholds for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    pub fn settings_for(&self, target: &str) -> BreakerSettings {
        let overrides = self.targets.get(target).cloned().unwrap_or_default();
        BreakerSettings {
            failure_threshold: overrides
                .failure_threshold
                .unwrap_or(self.failure_threshold)
                .max(1),
            recovery_timeout: Duration::from_secs(
                overrides
                    .recovery_timeout_secs
                    .unwrap_or(self.recovery_timeout_secs),
            ),
            success_threshold: overrides
                .success_threshold
                .unwrap_or(self.success_threshold)
                .max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

/// Slowest rate a bucket refills at; lower configured rates are raised to it.
pub const MIN_RPS: f64 = 0.001;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per second for targets without an entry (None = unlimited).
    #[serde(default)]
    pub default_rps: Option<f64>,
    /// Requests per second keyed by target.
    #[serde(default)]
    pub targets: HashMap<String, f64>,
}

impl RateLimitConfig {
    /// Effective rate for `target`, never below [`MIN_RPS`].
    pub fn rate_for(&self, target: &str) -> Option<f64> {
        self.targets
            .get(target)
            .copied()
            .or(self.default_rps)
            .filter(|rps| rps.is_finite() && *rps > 0.0)
            .map(|rps| rps.max(MIN_RPS))
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: f64,
    /// Per-run ceiling when the workflow does not set `settings.cost_limit`.
    #[serde(default = "default_run_limit")]
    pub run_limit: f64,
    /// Per-step ceiling when a step does not set `cost_limit`.
    #[serde(default = "default_step_limit")]
    pub step_limit: f64,
    /// Fraction of the monthly limit that triggers a warning event.
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
}

fn default_monthly_limit() -> f64 {
    500.0
}

fn default_run_limit() -> f64 {
    25.0
}

fn default_step_limit() -> f64 {
    5.0
}

fn default_warning_ratio() -> f64 {
    0.8
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_limit: default_monthly_limit(),
            run_limit: default_run_limit(),
            step_limit: default_step_limit(),
            warning_ratio: default_warning_ratio(),
        }
    }
}

// ---------------------------------------------------------------------------
// Quality
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_approve_threshold")]
    pub approve_threshold: f64,
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
}

fn default_approve_threshold() -> f64 {
    0.85
}

fn default_review_threshold() -> f64 {
    0.70
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            approve_threshold: default_approve_threshold(),
            review_threshold: default_review_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pricing and targets
// ---------------------------------------------------------------------------

/// Cost information for a model pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Glob-like pattern for model names (e.g., "gpt-4o*"); `*` matches all.
    pub model_pattern: String,
    /// Cost per million input tokens in USD.
    pub input_cost_per_million: f64,
    /// Cost per million output tokens in USD.
    pub output_cost_per_million: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Flat cost charged per call, used for prediction and as the actual
    /// cost when the capability reports none.
    #[serde(default)]
    pub cost_per_call: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_step_timeout_secs, 300);
        assert_eq!(config.max_fan_out, 4);
        assert_eq!(config.retry.default_max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.recovery_timeout_secs, 60);
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert!((config.quality.approve_threshold - 0.85).abs() < f64::EPSILON);
        assert!((config.quality.review_threshold - 0.70).abs() < f64::EPSILON);
        assert!(config.pricing.is_empty());
    }

    #[test]
    fn test_rate_for_clamps_tiny_rates() {
        let config = RateLimitConfig {
            default_rps: Some(1e-300),
            targets: HashMap::from([("llm".to_string(), 2.0), ("off".to_string(), 0.0)]),
        };
        assert_eq!(config.rate_for("llm"), Some(2.0));
        assert_eq!(config.rate_for("other"), Some(MIN_RPS));
        assert_eq!(config.rate_for("off"), None);
    }

    #[test]
    fn test_engine_config_empty_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_loop_iterations, 100);
        assert!((config.budget.monthly_limit - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_engine_config_toml_overrides() {
        let toml_str = r#"
max_fan_out = 8

[retry]
base_delay_ms = 100

[circuit_breaker]
failure_threshold = 4

[circuit_breaker.targets.tracker]
failure_threshold = 2
recovery_timeout_secs = 10

[rate_limits]
default_rps = 20.0

[rate_limits.targets]
chat = 1.5

[budget]
monthly_limit = 100.0

[[pricing]]
model_pattern = "gpt-4o*"
input_cost_per_million = 2.5
output_cost_per_million = 10.0

[targets.tracker]
cost_per_call = 0.01
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_fan_out, 8);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.retry.max_delay_ms, 30_000);

        let tracker = config.circuit_breaker.settings_for("tracker");
        assert_eq!(tracker.failure_threshold, 2);
        assert_eq!(tracker.recovery_timeout, Duration::from_secs(10));
        assert_eq!(tracker.success_threshold, 2);
        let other = config.circuit_breaker.settings_for("wiki");
        assert_eq!(other.failure_threshold, 4);

        assert_eq!(config.rate_limits.rate_for("chat"), Some(1.5));
        assert_eq!(config.rate_limits.rate_for("wiki"), Some(20.0));
        assert!((config.budget.monthly_limit - 100.0).abs() < f64::EPSILON);
        assert!((config.budget.run_limit - 25.0).abs() < f64::EPSILON);
        assert_eq!(config.pricing.len(), 1);
        assert!((config.cost_per_call("tracker") - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.cost_per_call("wiki"), 0.0);
    }

    #[test]
    fn test_rate_for_ignores_non_positive_rates() {
        let mut config = RateLimitConfig::default();
        assert_eq!(config.rate_for("any"), None);
        config.targets.insert("zero".into(), 0.0);
        assert_eq!(config.rate_for("zero"), None);
    }
}
