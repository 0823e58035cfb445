//! Per-target token-bucket rate limiting.
//!
//! A bucket holds up to `max(1, ceil(rps))` tokens and refills at `rps`
//! tokens per second. `acquire` takes a token immediately when one is
//! available; otherwise it books the next token (the bucket goes negative)
//! and sleeps until it is due, so waiting callers are served in order.
//! Each target's bucket has its own async mutex.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use devflow_types::config::RateLimitConfig;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Cancelled;

/// Upper bound on a single wait.
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64) -> Self {
        let capacity = rate.ceil().max(1.0);
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token and return how long the caller must wait for it.
    fn take(&mut self) -> Duration {
        self.refill();
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-self.tokens / self.rate)
                .map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT))
        }
    }

    fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }
}

/// Rate limiter shared by every run that calls the same targets.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Wait for a slot on `target`. Targets without a configured rate return
    /// immediately. Fails only when `cancel` fires first.
    pub async fn acquire(&self, target: &str, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let Some(bucket) = self.bucket(target) else {
            return Ok(());
        };

        let wait = bucket.lock().await.take();
        if wait.is_zero() {
            return Ok(());
        }

        tracing::debug!(
            target_name = target,
            wait_ms = wait.as_millis() as u64,
            "rate limited, waiting for token"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                bucket.lock().await.refund();
                Err(Cancelled)
            }
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    /// Configured requests per second for a target, if limited.
    pub fn rate_for(&self, target: &str) -> Option<f64> {
        self.config.rate_for(target)
    }

    fn bucket(&self, target: &str) -> Option<Arc<Mutex<TokenBucket>>> {
        let rate = self.config.rate_for(target)?;
        let bucket = self
            .buckets
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(rate))));
        Some(Arc::clone(bucket.value()))
    }
}
