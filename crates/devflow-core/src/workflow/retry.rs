//! Retry decisions and exponential backoff for step execution.
//!
//! Stateless: every function takes the policy and retry configuration it
//! needs. The attempt loop itself lives in the step executor.

use std::time::Duration;

use devflow_types::config::RetryConfig;
use devflow_types::run::StepError;
use devflow_types::workflow::{BackoffSpec, ErrorPolicy};

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler for failed attempts.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow a failure.
    ///
    /// `attempt` is 1-based. Only `Retry` policies retry, and only for errors
    /// marked retryable.
    pub fn should_retry(policy: &ErrorPolicy, attempt: u32, error: &StepError) -> bool {
        matches!(policy, ErrorPolicy::Retry { .. })
            && error.retryable
            && attempt < policy.max_attempts()
    }

    /// Delay before the attempt that follows `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)` plus up to `jitter_ratio` of that, capped at
    /// the maximum delay. Step-level `backoff` overrides the configured base
    /// and cap.
    pub fn backoff_delay(
        config: &RetryConfig,
        policy: &ErrorPolicy,
        attempt: u32,
    ) -> Duration {
        let jitter = rand::random::<f64>();
        Self::backoff_delay_with_jitter(config, Self::override_of(policy), attempt, jitter)
    }

    /// Deterministic form of [`backoff_delay`](Self::backoff_delay);
    /// `jitter` is a sample in `[0, 1)`.
    pub fn backoff_delay_with_jitter(
        config: &RetryConfig,
        backoff: Option<&BackoffSpec>,
        attempt: u32,
        jitter: f64,
    ) -> Duration {
        let base_ms = backoff
            .and_then(|b| b.base_ms)
            .unwrap_or(config.base_delay_ms) as f64;
        let max_ms = backoff
            .and_then(|b| b.max_ms)
            .unwrap_or(config.max_delay_ms) as f64;

        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let exponential = base_ms * 2f64.powi(exponent);
        let jitter = jitter.clamp(0.0, 1.0) * exponential * config.jitter_ratio.max(0.0);
        let delay_ms = (exponential + jitter).min(max_ms).max(0.0);
        Duration::from_millis(delay_ms.round() as u64)
    }

    fn override_of(policy: &ErrorPolicy) -> Option<&BackoffSpec> {
        match policy {
            ErrorPolicy::Retry { backoff, .. } => backoff.as_ref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_types::run::StepErrorKind;

    fn retry(max_attempts: u32) -> ErrorPolicy {
        ErrorPolicy::Retry {
            max_attempts,
            backoff: None,
        }
    }

    fn config() -> RetryConfig {
        RetryConfig {
            default_max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ratio: 0.1,
        }
    }

    #[test]
    fn test_should_retry_within_limit() {
        let err = StepError::new(StepErrorKind::ExternalCall, "503");
        assert!(RetryHandler::should_retry(&retry(3), 1, &err));
        assert!(RetryHandler::should_retry(&retry(3), 2, &err));
        assert!(!RetryHandler::should_retry(&retry(3), 3, &err));
    }

    #[test]
    fn test_permanent_errors_not_retried() {
        let err = StepError::permanent(StepErrorKind::ExternalCall, "404");
        assert!(!RetryHandler::should_retry(&retry(3), 1, &err));
        let resolution = StepError::new(StepErrorKind::Resolution, "missing");
        assert!(!RetryHandler::should_retry(&retry(3), 1, &resolution));
    }

    #[test]
    fn test_other_policies_never_retry() {
        let err = StepError::new(StepErrorKind::Timeout, "slow");
        for policy in [ErrorPolicy::Fail, ErrorPolicy::Continue, ErrorPolicy::Rollback] {
            assert!(!RetryHandler::should_retry(&policy, 1, &err));
        }
    }

    #[test]
    fn test_backoff_doubles_without_jitter() {
        let cfg = config();
        let delays: Vec<u64> = (1..=4)
            .map(|n| RetryHandler::backoff_delay_with_jitter(&cfg, None, n, 0.0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[test]
    fn test_backoff_strictly_increasing_with_jitter_below_cap() {
        let cfg = config();
        // Worst case: maximum jitter on the earlier delay, none on the later.
        for n in 1..=3 {
            let high = RetryHandler::backoff_delay_with_jitter(&cfg, None, n, 0.999);
            let low = RetryHandler::backoff_delay_with_jitter(&cfg, None, n + 1, 0.0);
            assert!(low > high, "attempt {n}: {low:?} <= {high:?}");
        }
    }

    #[test]
    fn test_backoff_capped_and_overridable() {
        let cfg = config();
        assert_eq!(
            RetryHandler::backoff_delay_with_jitter(&cfg, None, 10, 0.5),
            Duration::from_millis(1_000)
        );
        let spec = BackoffSpec {
            base_ms: Some(10),
            max_ms: Some(25),
        };
        assert_eq!(
            RetryHandler::backoff_delay_with_jitter(&cfg, Some(&spec), 2, 0.0),
            Duration::from_millis(20)
        );
        assert_eq!(
            RetryHandler::backoff_delay_with_jitter(&cfg, Some(&spec), 5, 0.0),
            Duration::from_millis(25)
        );
    }

    #[test]
    fn test_random_jitter_stays_in_range() {
        let cfg = config();
        for _ in 0..50 {
            let delay = RetryHandler::backoff_delay(&cfg, &retry(5), 2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(220));
        }
    }
}
