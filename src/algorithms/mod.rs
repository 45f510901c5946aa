//! Rate limiting algorithms module
//!
//! Three interchangeable algorithms share one `check_and_consume` contract:
//!
//! - [`token_bucket`]: continuously refilling pool, allows bursts up to `limit + burst`
//! - [`sliding_window`]: exact log of timestamps inside a trailing window
//! - [`fixed_window`]: counter per discrete window id, cheapest but allows a
//!   boundary burst of up to ~2x `limit` across adjacent windows
//!
//! The decision math lives here as pure functions; the [`CounterStore`]
//! executes each algorithm's critical section as one atomic operation.
//!
//! [`CounterStore`]: crate::store::CounterStore

pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

use crate::error::StoreResult;
use crate::rate_limit_config::RateLimitStrategy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

/// Composite key partitioning limiter state in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub namespace: &'static str,
    pub identifier: String,
    pub window_id: Option<u64>,
}

impl RateLimitKey {
    pub fn new(namespace: &'static str, identifier: &str) -> Self {
        Self {
            namespace,
            identifier: identifier.to_string(),
            window_id: None,
        }
    }

    pub fn with_window(mut self, window_id: u64) -> Self {
        self.window_id = Some(window_id);
        self
    }

    /// Convert to a store key string
    pub fn to_store_key(&self, prefix: &str) -> String {
        match self.window_id {
            Some(window_id) => format!(
                "{}:{}:{}:{}",
                prefix, self.namespace, self.identifier, window_id
            ),
            None => format!("{}:{}:{}", prefix, self.namespace, self.identifier),
        }
    }

    /// Prefix shared by every windowed key of this identifier.
    pub fn window_prefix(&self, prefix: &str) -> String {
        format!("{}:{}:{}:", prefix, self.namespace, self.identifier)
    }
}

/// Per-call overrides. Unset fields fall back to the limiter defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitOptions {
    pub limit: Option<u64>,
    #[serde(default, with = "humantime_serde")]
    pub window: Option<Duration>,
    pub burst: Option<u64>,
    pub cost: Option<u64>,
}

impl LimitOptions {
    pub fn cost(cost: u64) -> Self {
        Self {
            cost: Some(cost),
            ..Self::default()
        }
    }
}

/// Largest cost a single call may carry.
pub const MAX_COST: u64 = 10_000;

/// Fully resolved parameters for one limiter call.
#[derive(Debug, Clone, Copy, PartialEq, Validate)]
pub struct LimitParams {
    #[validate(range(min = 1))]
    pub limit: u64,
    #[validate(custom(function = "validate_window"))]
    pub window: Duration,
    /// Extra token-bucket capacity above `limit`. Ignored by the window algorithms.
    pub burst: u64,
    #[validate(range(max = MAX_COST))]
    pub cost: u64,
}

fn validate_window(window: &Duration) -> Result<(), ValidationError> {
    if *window < Duration::from_secs(1) {
        return Err(ValidationError::new("window_below_one_second"));
    }
    Ok(())
}

impl LimitParams {
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// Largest amount a single identifier can ever hold at once.
    pub fn capacity(&self, strategy: RateLimitStrategy) -> u64 {
        match strategy {
            RateLimitStrategy::TokenBucket => self.limit.saturating_add(self.burst),
            RateLimitStrategy::SlidingWindow | RateLimitStrategy::FixedWindow => self.limit,
        }
    }

    /// Store TTL for per-key state, at least twice the window.
    pub fn ttl_ms(&self) -> u64 {
        self.window_ms().saturating_mul(2).max(1)
    }
}

/// Outcome of a single `check_and_consume`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    /// Unrounded remaining capacity; token bucket keeps fractions.
    pub remaining: f64,
    pub reset_at_ms: u64,
    pub cost: u64,
    /// True when the store could not be reached and the call failed open.
    pub degraded: bool,
}

impl RateLimitDecision {
    pub fn allowed(limit: u64, remaining: f64, reset_at_ms: u64, cost: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at_ms,
            cost,
            degraded: false,
        }
    }

    pub fn denied(limit: u64, remaining: f64, reset_at_ms: u64, cost: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining,
            reset_at_ms,
            cost,
            degraded: false,
        }
    }

    /// Decision used when the store is unhealthy: allow with full capacity.
    pub fn fail_open(params: &LimitParams, now_ms: u64) -> Self {
        Self {
            allowed: true,
            limit: params.limit,
            remaining: params.limit as f64,
            reset_at_ms: now_ms.saturating_add(params.window_ms()),
            cost: params.cost,
            degraded: true,
        }
    }

    /// Remaining capacity as reported in headers and bodies.
    pub fn remaining_whole(&self) -> u64 {
        if self.remaining <= 0.0 {
            0
        } else {
            self.remaining.floor() as u64
        }
    }

    pub fn used(&self) -> u64 {
        self.limit.saturating_sub(self.remaining_whole())
    }

    /// Reset time in unix seconds, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    /// Seconds a denied caller should wait, never less than one.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1)
    }
}

/// Trait for rate limiting algorithms
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    fn strategy(&self) -> RateLimitStrategy;

    /// Atomically decide and, when allowed, consume `params.cost` units.
    ///
    /// A cost of zero is a read-only check.
    async fn check_and_consume(
        &self,
        identifier: &str,
        params: &LimitParams,
        now_ms: u64,
    ) -> StoreResult<RateLimitDecision>;

    /// Remove every piece of state this algorithm holds for `identifier`.
    async fn reset(&self, identifier: &str) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(limit: u64, window_secs: u64) -> LimitParams {
        LimitParams {
            limit,
            window: Duration::from_secs(window_secs),
            burst: 0,
            cost: 1,
        }
    }

    #[test]
    fn test_rate_limit_key_to_store_key() {
        let key = RateLimitKey::new("tb", "ip:10.0.0.1");
        assert_eq!(key.to_store_key("ratelimit"), "ratelimit:tb:ip:10.0.0.1");

        let key = RateLimitKey::new("fw", "user:42").with_window(27_000_000);
        assert_eq!(key.to_store_key("rl"), "rl:fw:user:42:27000000");
        assert_eq!(key.window_prefix("rl"), "rl:fw:user:42:");
    }

    #[test]
    fn test_params_validation() {
        assert!(params(10, 60).validate().is_ok());
        assert!(params(0, 60).validate().is_err());

        let mut short = params(10, 1);
        short.window = Duration::from_millis(500);
        assert!(short.validate().is_err());

        let mut heavy = params(10, 60);
        heavy.cost = MAX_COST;
        assert!(heavy.validate().is_ok());
        heavy.cost = MAX_COST + 1;
        assert!(heavy.validate().is_err());
    }

    #[test]
    fn test_capacity_per_strategy() {
        let mut p = params(100, 60);
        p.burst = 10;
        assert_eq!(p.capacity(RateLimitStrategy::TokenBucket), 110);
        assert_eq!(p.capacity(RateLimitStrategy::SlidingWindow), 100);
        assert_eq!(p.capacity(RateLimitStrategy::FixedWindow), 100);
        assert_eq!(p.ttl_ms(), 120_000);
    }

    #[test]
    fn test_retry_after_rounds_up_and_never_zero() {
        let decision = RateLimitDecision::denied(5, 0.0, 10_001, 1);
        assert_eq!(decision.retry_after_secs(9_000), 2);
        assert_eq!(decision.retry_after_secs(10_001), 1);
        assert_eq!(decision.retry_after_secs(20_000), 1);
    }

    #[test]
    fn test_remaining_whole_floors_fractions() {
        let decision = RateLimitDecision::allowed(100, 98.97, 0, 1);
        assert_eq!(decision.remaining_whole(), 98);
        assert_eq!(decision.used(), 2);

        let decision = RateLimitDecision::denied(100, -0.5, 0, 1);
        assert_eq!(decision.remaining_whole(), 0);
    }

    #[test]
    fn test_fail_open_reports_full_limit() {
        let p = params(50, 60);
        let decision = RateLimitDecision::fail_open(&p, 1_000);
        assert!(decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.remaining_whole(), 50);
        assert_eq!(decision.reset_at_ms, 61_000);
    }
}
