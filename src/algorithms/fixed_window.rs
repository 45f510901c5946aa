//! Fixed window counter algorithm
//!
//! One integer counter per `(identifier, window_id)` where
//! `window_id = floor(now / window)`. A new window id is a new key, so
//! counters reset implicitly and expire through the store TTL.
//!
//! Requests clustered around a window boundary can see up to ~2x `limit`
//! admitted across the two adjacent windows. Use the sliding window log
//! when that is not acceptable.

use super::{LimitParams, RateLimitAlgorithm, RateLimitDecision, RateLimitKey};
use crate::error::StoreResult;
use crate::rate_limit_config::RateLimitStrategy;
use crate::store::CounterStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    /// Counter value after the decision (rolled back when denied).
    pub count: u64,
}

pub fn window_id(params: &LimitParams, now_ms: u64) -> u64 {
    now_ms / params.window_ms().max(1)
}

/// First millisecond of the next window.
pub fn window_end_ms(params: &LimitParams, now_ms: u64) -> u64 {
    (window_id(params, now_ms) + 1).saturating_mul(params.window_ms())
}

/// Increment-then-rollback on an in-memory counter.
pub fn increment(counter: &mut u64, params: &LimitParams) -> WindowOutcome {
    let next = counter.saturating_add(params.cost);
    if next > params.limit {
        return WindowOutcome {
            allowed: false,
            count: *counter,
        };
    }
    *counter = next;
    WindowOutcome {
        allowed: true,
        count: next,
    }
}

/// Fixed window counter limiter backed by a shared [`CounterStore`].
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    key_prefix: String,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, key_prefix: &str) -> Self {
        Self {
            store,
            key_prefix: key_prefix.to_string(),
        }
    }

    fn base_key(identifier: &str) -> RateLimitKey {
        RateLimitKey::new(RateLimitStrategy::FixedWindow.namespace(), identifier)
    }

    /// Store key of the counter that `now_ms` falls into.
    pub fn counter_key(&self, identifier: &str, params: &LimitParams, now_ms: u64) -> String {
        Self::base_key(identifier)
            .with_window(window_id(params, now_ms))
            .to_store_key(&self.key_prefix)
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowLimiter {
    fn strategy(&self) -> RateLimitStrategy {
        RateLimitStrategy::FixedWindow
    }

    async fn check_and_consume(
        &self,
        identifier: &str,
        params: &LimitParams,
        now_ms: u64,
    ) -> StoreResult<RateLimitDecision> {
        let key = self.counter_key(identifier, params, now_ms);
        let outcome = self
            .store
            .fixed_window(&key, params, params.ttl_ms())
            .await?;

        let reset_at = window_end_ms(params, now_ms);
        let remaining = params.limit.saturating_sub(outcome.count) as f64;

        debug!(
            key = %key,
            allowed = outcome.allowed,
            count = outcome.count,
            cost = params.cost,
            "fixed window decision"
        );

        Ok(if outcome.allowed {
            RateLimitDecision::allowed(params.limit, remaining, reset_at, params.cost)
        } else {
            RateLimitDecision::denied(params.limit, remaining, reset_at, params.cost)
        })
    }

    async fn reset(&self, identifier: &str) -> StoreResult<()> {
        let prefix = Self::base_key(identifier).window_prefix(&self.key_prefix);
        self.store.delete_windows(&prefix).await?;
        Ok(())
    }
}
