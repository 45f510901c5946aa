//! Token bucket algorithm.
//!
//! Tokens refill continuously at `limit / window` per second up to
//! `limit + burst`. Each call spends `cost` tokens; a call that cannot be
//! paid for is denied without touching stored state.

use super::{LimitParams, RateLimitAlgorithm, RateLimitDecision, RateLimitKey};
use crate::error::StoreResult;
use crate::rate_limit_config::RateLimitStrategy;
use crate::store::CounterStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Persisted bucket state, one per key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

/// What the store reports back after running the bucket's critical section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// Tokens left after the decision (after subtraction when allowed).
    pub tokens: f64,
}

/// Tokens added per millisecond.
pub fn refill_rate_per_ms(params: &LimitParams) -> f64 {
    params.limit as f64 / params.window_ms().max(1) as f64
}

/// Current token count after applying refill since the last write.
///
/// An unseen key starts with `limit` tokens.
pub fn refill(state: Option<TokenBucketState>, params: &LimitParams, now_ms: u64) -> f64 {
    let capacity = params.capacity(RateLimitStrategy::TokenBucket) as f64;
    match state {
        Some(state) => {
            let elapsed_ms = now_ms.saturating_sub(state.last_refill_ms);
            let refilled = state.tokens + elapsed_ms as f64 * refill_rate_per_ms(params);
            refilled.clamp(0.0, capacity)
        }
        None => (params.limit as f64).min(capacity),
    }
}

/// Run one bucket decision. Returns the outcome and, when the call must be
/// persisted, the new state to write.
pub fn take(
    state: Option<TokenBucketState>,
    params: &LimitParams,
    now_ms: u64,
) -> (BucketOutcome, Option<TokenBucketState>) {
    let tokens = refill(state, params, now_ms);
    let cost = params.cost as f64;

    if tokens >= cost {
        let tokens = tokens - cost;
        let write = (params.cost > 0).then_some(TokenBucketState {
            tokens,
            last_refill_ms: now_ms,
        });
        (BucketOutcome { allowed: true, tokens }, write)
    } else {
        (BucketOutcome { allowed: false, tokens }, None)
    }
}

/// When the caller can expect capacity back.
///
/// Allowed calls report when the bucket is back at `limit`; denied calls
/// report when `cost` tokens will be available.
pub fn reset_at_ms(outcome: &BucketOutcome, params: &LimitParams, now_ms: u64) -> u64 {
    let rate = refill_rate_per_ms(params);
    let target = if outcome.allowed {
        params.limit as f64
    } else {
        params.cost as f64
    };
    let missing = (target - outcome.tokens).max(0.0);
    if missing == 0.0 || rate <= 0.0 {
        return now_ms;
    }
    now_ms.saturating_add((missing / rate).ceil() as u64)
}

/// Token bucket rate limiter backed by a shared [`CounterStore`].
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    key_prefix: String,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn CounterStore>, key_prefix: &str) -> Self {
        Self {
            store,
            key_prefix: key_prefix.to_string(),
        }
    }

    pub fn store_key(&self, identifier: &str) -> String {
        RateLimitKey::new(RateLimitStrategy::TokenBucket.namespace(), identifier)
            .to_store_key(&self.key_prefix)
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketLimiter {
    fn strategy(&self) -> RateLimitStrategy {
        RateLimitStrategy::TokenBucket
    }

    async fn check_and_consume(
        &self,
        identifier: &str,
        params: &LimitParams,
        now_ms: u64,
    ) -> StoreResult<RateLimitDecision> {
        let key = self.store_key(identifier);
        let outcome = self
            .store
            .token_bucket(&key, params, now_ms, params.ttl_ms())
            .await?;
        let reset_at = reset_at_ms(&outcome, params, now_ms);

        debug!(
            key = %key,
            allowed = outcome.allowed,
            tokens = outcome.tokens,
            cost = params.cost,
            "token bucket decision"
        );

        Ok(if outcome.allowed {
            RateLimitDecision::allowed(params.limit, outcome.tokens, reset_at, params.cost)
        } else {
            RateLimitDecision::denied(params.limit, outcome.tokens, reset_at, params.cost)
        })
    }

    async fn reset(&self, identifier: &str) -> StoreResult<()> {
        self.store.delete(&[self.store_key(identifier)]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params(limit: u64, window_secs: u64, burst: u64, cost: u64) -> LimitParams {
        LimitParams {
            limit,
            window: Duration::from_secs(window_secs),
            burst,
            cost,
        }
    }

    #[test]
    fn test_unseen_key_starts_at_limit() {
        let p = params(100, 3600, 10, 1);
        assert_eq!(refill(None, &p, 0), 100.0);
    }

    #[test]
    fn test_refill_is_capped_at_limit_plus_burst() {
        let p = params(10, 10, 5, 1);
        let state = TokenBucketState {
            tokens: 0.0,
            last_refill_ms: 0,
        };
        // One token per second; an hour later the bucket is only 15 deep.
        assert_eq!(refill(Some(state), &p, 3_600_000), 15.0);
        assert_eq!(refill(Some(state), &p, 2_500), 2.5);
    }

    #[test]
    fn test_take_allows_and_keeps_fraction() {
        let p = params(10, 10, 0, 1);
        let state = TokenBucketState {
            tokens: 1.5,
            last_refill_ms: 1_000,
        };
        let (outcome, write) = take(Some(state), &p, 1_000);
        assert!(outcome.allowed);
        assert_eq!(outcome.tokens, 0.5);
        assert_eq!(
            write,
            Some(TokenBucketState {
                tokens: 0.5,
                last_refill_ms: 1_000
            })
        );
    }

    #[test]
    fn test_take_denies_without_write() {
        let p = params(10, 10, 0, 3);
        let state = TokenBucketState {
            tokens: 2.0,
            last_refill_ms: 0,
        };
        let (outcome, write) = take(Some(state), &p, 0);
        assert!(!outcome.allowed);
        assert_eq!(outcome.tokens, 2.0);
        assert!(write.is_none());
    }

    #[test]
    fn test_zero_cost_never_writes() {
        let p = params(10, 10, 0, 0);
        let (outcome, write) = take(None, &p, 0);
        assert!(outcome.allowed);
        assert_eq!(outcome.tokens, 10.0);
        assert!(write.is_none());
    }

    #[test]
    fn test_reset_at_for_denied_waits_for_cost() {
        // 1 token per second, 0.25 tokens available, cost 2 -> 1.75s.
        let p = params(10, 10, 0, 2);
        let outcome = BucketOutcome {
            allowed: false,
            tokens: 0.25,
        };
        assert_eq!(reset_at_ms(&outcome, &p, 10_000), 11_750);
    }

    #[test]
    fn test_reset_at_for_allowed_is_time_to_limit() {
        let p = params(10, 10, 5, 1);
        let outcome = BucketOutcome {
            allowed: true,
            tokens: 7.0,
        };
        assert_eq!(reset_at_ms(&outcome, &p, 0), 3_000);

        // Already above limit thanks to burst.
        let full = BucketOutcome {
            allowed: true,
            tokens: 12.0,
        };
        assert_eq!(reset_at_ms(&full, &p, 500), 500);
    }

    #[test]
    fn test_admitted_cost_bounded_by_capacity_plus_refill() {
        // limit 20, burst 5, window 10s. Hammer the bucket and check that any
        // run of admissions between t_i and t_j never exceeds
        // (limit + burst) + rate * (t_j - t_i).
        let p = params(20, 10, 5, 1);
        let rate = refill_rate_per_ms(&p);
        let capacity = (p.limit + p.burst) as f64;
        let mut state = None;
        let mut admitted: Vec<u64> = Vec::new();

        for now in (0..60_000u64).step_by(7) {
            let (outcome, write) = take(state, &p, now);
            if outcome.allowed {
                admitted.push(now);
            }
            if write.is_some() {
                state = write;
            }
        }

        assert!(admitted.len() as u64 > p.limit);

        for i in 0..admitted.len() {
            for j in i..admitted.len() {
                let span = (admitted[j] - admitted[i]) as f64;
                let count = (j - i + 1) as f64;
                assert!(
                    count <= capacity + rate * span + 1e-6,
                    "{} admitted within {}ms",
                    count,
                    span
                );
            }
        }
    }
}
