//! Per-target circuit breakers.
//!
//! Each target (logical service name) gets its own state machine:
//! `Closed -> Open` after `failure_threshold` consecutive failures,
//! `Open -> HalfOpen` once `recovery_timeout` has elapsed,
//! `HalfOpen -> Closed` after `success_threshold` consecutive successes and
//! `HalfOpen -> Open` on any failure.
//!
//! State lives in a `DashMap`; every transition runs while holding that
//! target's entry lock. Uses `tokio::time::Instant` so tests can drive
//! recovery with paused time.

use std::time::Duration;

use dashmap::DashMap;
use devflow_types::config::{BreakerSettings, CircuitBreakerConfig};
use devflow_types::event::WorkflowEvent;
use serde::Serialize;
use tokio::time::Instant;

use crate::event::EventBus;

/// Circuit breaker state for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward the threshold.
    Closed { consecutive_failures: u32 },
    /// Calls fast-fail until the recovery timeout has elapsed.
    Open { opened_at: Instant },
    /// Probing. Closes after enough consecutive successes.
    HalfOpen { consecutive_successes: u32 },
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed { .. } => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Health tracking for a single target.
#[derive(Debug)]
struct TargetHealth {
    state: CircuitState,
    settings: BreakerSettings,
    total_calls: u64,
    total_failures: u64,
    last_error: Option<String>,
}

/// A state change worth logging and publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Opened { consecutive_failures: u32 },
    Closed,
}

impl TargetHealth {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            settings,
            total_calls: 0,
            total_failures: 0,
            last_error: None,
        }
    }

    /// Handles the Open -> HalfOpen transition when the timeout has elapsed.
    fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed { .. } | CircuitState::HalfOpen { .. } => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.settings.recovery_timeout {
                    self.state = CircuitState::HalfOpen {
                        consecutive_successes: 0,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) -> Option<Transition> {
        self.total_calls += 1;
        match self.state {
            CircuitState::Closed { .. } => {
                self.state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
                None
            }
            CircuitState::HalfOpen {
                consecutive_successes,
            } => {
                let successes = consecutive_successes + 1;
                if successes >= self.settings.success_threshold {
                    self.state = CircuitState::Closed {
                        consecutive_failures: 0,
                    };
                    Some(Transition::Closed)
                } else {
                    self.state = CircuitState::HalfOpen {
                        consecutive_successes: successes,
                    };
                    None
                }
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::Open { .. } => None,
        }
    }

    fn record_failure(&mut self, error: Option<&str>) -> Option<Transition> {
        self.total_calls += 1;
        self.total_failures += 1;
        if let Some(error) = error {
            self.last_error = Some(error.to_string());
        }
        match self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.settings.failure_threshold {
                    self.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    Some(Transition::Opened {
                        consecutive_failures: failures,
                    })
                } else {
                    self.state = CircuitState::Closed {
                        consecutive_failures: failures,
                    };
                    None
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                Some(Transition::Opened {
                    consecutive_failures: 1,
                })
            }
            CircuitState::Open { .. } => None,
        }
    }
}

/// Status row for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub target: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    /// Time left before an open circuit admits a trial call.
    pub retry_in: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide circuit breakers keyed by target.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    entries: DashMap<String, TargetHealth>,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            events,
        }
    }

    /// Whether a call to `target` may proceed. False means fast-fail.
    pub fn allow(&self, target: &str) -> bool {
        let mut entry = self.entry(target);
        let was_open = matches!(entry.state, CircuitState::Open { .. });
        let allowed = entry.allow();
        if was_open && allowed {
            tracing::info!(target_name = target, "circuit half-open, probing");
        }
        allowed
    }

    /// Record the outcome of an admitted call.
    pub fn record_outcome(&self, target: &str, success: bool) {
        if success {
            self.record_success(target);
        } else {
            self.record_failure(target, None);
        }
    }

    pub fn record_success(&self, target: &str) {
        let transition = self.entry(target).record_success();
        self.announce(target, transition);
    }

    /// Record a failure, keeping `error` for status reporting.
    pub fn record_failure(&self, target: &str, error: Option<&str>) {
        let transition = self.entry(target).record_failure(error);
        self.announce(target, transition);
    }

    /// Current state (Closed for targets never seen).
    pub fn state(&self, target: &str) -> CircuitState {
        self.entries.get(target).map_or(
            CircuitState::Closed {
                consecutive_failures: 0,
            },
            |health| health.state,
        )
    }

    /// Status of every target seen so far, sorted by name.
    pub fn status(&self) -> Vec<CircuitStatus> {
        let mut rows: Vec<CircuitStatus> = self
            .entries
            .iter()
            .map(|entry| {
                let health = entry.value();
                let (consecutive_failures, retry_in) = match health.state {
                    CircuitState::Closed {
                        consecutive_failures,
                    } => (consecutive_failures, None),
                    CircuitState::Open { opened_at } => (
                        health.settings.failure_threshold,
                        Some(
                            health
                                .settings
                                .recovery_timeout
                                .saturating_sub(opened_at.elapsed()),
                        ),
                    ),
                    CircuitState::HalfOpen { .. } => (0, None),
                };
                CircuitStatus {
                    target: entry.key().clone(),
                    state: health.state.name(),
                    consecutive_failures,
                    total_calls: health.total_calls,
                    total_failures: health.total_failures,
                    last_error: health.last_error.clone(),
                    retry_in,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.target.cmp(&b.target));
        rows
    }

    fn entry(&self, target: &str) -> dashmap::mapref::one::RefMut<'_, String, TargetHealth> {
        self.entries
            .entry(target.to_string())
            .or_insert_with(|| TargetHealth::new(self.config.settings_for(target)))
    }

    fn announce(&self, target: &str, transition: Option<Transition>) {
        match transition {
            Some(Transition::Opened {
                consecutive_failures,
            }) => {
                tracing::warn!(
                    target_name = target,
                    consecutive_failures,
                    "circuit opened"
                );
                self.events.publish(WorkflowEvent::CircuitOpened {
                    target: target.to_string(),
                    consecutive_failures,
                });
            }
            Some(Transition::Closed) => {
                tracing::info!(target_name = target, "circuit closed");
                self.events.publish(WorkflowEvent::CircuitClosed {
                    target: target.to_string(),
                });
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use devflow_types::config::BreakerOverride;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), EventBus::new(16))
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exact_failure_threshold() {
        let breakers = registry();
        for _ in 0..4 {
            assert!(breakers.allow("tracker"));
            breakers.record_outcome("tracker", false);
        }
        assert!(breakers.allow("tracker"), "4 failures must not open");
        breakers.record_outcome("tracker", false);
        assert!(!breakers.allow("tracker"));
        assert_eq!(breakers.state("tracker").name(), "open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_through_half_open() {
        let breakers = registry();
        for _ in 0..5 {
            breakers.record_outcome("scm", false);
        }
        assert!(!breakers.allow("scm"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!breakers.allow("scm"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breakers.allow("scm"));
        assert_eq!(
            breakers.state("scm"),
            CircuitState::HalfOpen {
                consecutive_successes: 0
            }
        );

        breakers.record_outcome("scm", true);
        assert_eq!(breakers.state("scm").name(), "half_open");
        breakers.record_outcome("scm", true);
        assert_eq!(
            breakers.state("scm"),
            CircuitState::Closed {
                consecutive_failures: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breakers = registry();
        for _ in 0..5 {
            breakers.record_outcome("chat", false);
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(breakers.allow("chat"));
        breakers.record_failure("chat", Some("503 from chat"));
        assert!(!breakers.allow("chat"));

        let status = breakers.status();
        assert_eq!(status[0].state, "open");
        assert_eq!(status[0].last_error.as_deref(), Some("503 from chat"));
        assert_eq!(status[0].total_failures, 6);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breakers = registry();
        for _ in 0..4 {
            breakers.record_outcome("wiki", false);
        }
        breakers.record_outcome("wiki", true);
        for _ in 0..4 {
            breakers.record_outcome("wiki", false);
        }
        assert!(breakers.allow("wiki"));
    }

    #[tokio::test]
    async fn test_targets_are_independent_and_overridable() {
        let mut targets = HashMap::new();
        targets.insert(
            "flaky".to_string(),
            BreakerOverride {
                failure_threshold: Some(1),
                ..Default::default()
            },
        );
        let config = CircuitBreakerConfig {
            targets,
            ..Default::default()
        };
        let breakers = CircuitBreakerRegistry::new(config, EventBus::new(16));

        breakers.record_outcome("flaky", false);
        assert!(!breakers.allow("flaky"));
        breakers.record_outcome("steady", false);
        assert!(breakers.allow("steady"));
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), bus);
        for _ in 0..5 {
            breakers.record_outcome("tracker", false);
        }
        match rx.recv().await.unwrap() {
            WorkflowEvent::CircuitOpened {
                target,
                consecutive_failures,
            } => {
                assert_eq!(target, "tracker");
                assert_eq!(consecutive_failures, 5);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_open_exactly_once() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
            bus,
        ));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let breakers = Arc::clone(&breakers);
            handles.push(tokio::spawn(async move {
                breakers.record_outcome("shared", false);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut opened = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, WorkflowEvent::CircuitOpened { .. }) {
                opened += 1;
            }
        }
        assert_eq!(opened, 1);
        assert_eq!(breakers.status()[0].total_failures, 20);
    }
}
