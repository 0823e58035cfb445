//! Protection around external calls: circuit breakers and rate limiters.
//!
//! Both are shared by every run of an engine (and across engines through
//! [`Guards`]), keyed by target name.

pub mod circuit_breaker;
pub mod rate_limiter;

use std::sync::Arc;

use devflow_types::config::EngineConfig;
use thiserror::Error;

use crate::event::EventBus;

pub use circuit_breaker::{CircuitBreakerRegistry, CircuitState, CircuitStatus};
pub use rate_limiter::RateLimiter;

/// A cancellable wait was interrupted by its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait cancelled")]
pub struct Cancelled;

/// Circuit breakers and rate limiters for one process.
#[derive(Debug, Clone)]
pub struct Guards {
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub limiter: Arc<RateLimiter>,
}

impl Guards {
    /// Build guards from configuration. Circuit transitions are published on
    /// `events`.
    pub fn from_config(config: &EngineConfig, events: EventBus) -> Self {
        Self {
            breakers: Arc::new(CircuitBreakerRegistry::new(
                config.circuit_breaker.clone(),
                events,
            )),
            limiter: Arc::new(RateLimiter::new(config.rate_limits.clone())),
        }
    }
}
