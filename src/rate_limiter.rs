use crate::algorithms::{
    FixedWindowLimiter, LimitOptions, LimitParams, RateLimitAlgorithm, RateLimitDecision,
    SlidingWindowLimiter, TokenBucketLimiter,
};
use crate::clock::{system_clock, SharedClock};
use crate::error::{Result, StoreResult};
use crate::rate_limit_config::RateLimitStrategy;
use crate::store::{with_timeout, CounterStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use validator::Validate;

/// Construction options for [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimiterOptions {
    pub strategy: RateLimitStrategy,
    pub key_prefix: String,
    pub default_limit: u64,
    pub default_window: Duration,
    pub default_burst: u64,
    /// Upper bound on every store round trip.
    pub store_timeout: Duration,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::TokenBucket,
            key_prefix: "ratelimit".to_string(),
            default_limit: 100,
            default_window: Duration::from_secs(60),
            default_burst: 0,
            store_timeout: Duration::from_millis(50),
        }
    }
}

/// Point-in-time usage for one identifier.
#[derive(Debug, Clone, Serialize)]
pub struct Usage {
    pub identifier: String,
    pub strategy: RateLimitStrategy,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds.
    pub reset: u64,
}

/// Multi-algorithm rate limiter over a shared counter store.
///
/// Store failures on the decision path fail open: the call is allowed with
/// full remaining capacity and the decision is marked `degraded`.
#[derive(Clone)]
pub struct RateLimiter {
    options: Arc<RateLimiterOptions>,
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
    token_bucket: Arc<TokenBucketLimiter>,
    sliding_window: Arc<SlidingWindowLimiter>,
    fixed_window: Arc<FixedWindowLimiter>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, options: RateLimiterOptions) -> Self {
        Self::with_clock(store, options, system_clock())
    }

    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        options: RateLimiterOptions,
        clock: SharedClock,
    ) -> Self {
        let prefix = options.key_prefix.as_str();
        Self {
            token_bucket: Arc::new(TokenBucketLimiter::new(store.clone(), prefix)),
            sliding_window: Arc::new(SlidingWindowLimiter::new(store.clone(), prefix)),
            fixed_window: Arc::new(FixedWindowLimiter::new(store.clone(), prefix)),
            options: Arc::new(options),
            store,
            clock,
        }
    }

    pub fn strategy(&self) -> RateLimitStrategy {
        self.options.strategy
    }

    pub fn options(&self) -> &RateLimiterOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn algorithm(&self, strategy: RateLimitStrategy) -> &dyn RateLimitAlgorithm {
        match strategy {
            RateLimitStrategy::TokenBucket => self.token_bucket.as_ref(),
            RateLimitStrategy::SlidingWindow => self.sliding_window.as_ref(),
            RateLimitStrategy::FixedWindow => self.fixed_window.as_ref(),
        }
    }

    /// Merge per-call overrides with the defaults and validate the result.
    pub fn resolve(&self, opts: &LimitOptions) -> Result<LimitParams> {
        let params = LimitParams {
            limit: opts.limit.unwrap_or(self.options.default_limit),
            window: opts.window.unwrap_or(self.options.default_window),
            burst: opts.burst.unwrap_or(self.options.default_burst),
            cost: opts.cost.unwrap_or(1),
        };
        params.validate()?;
        Ok(params)
    }

    /// Decide and consume with the configured strategy.
    pub async fn check_and_consume(
        &self,
        identifier: &str,
        opts: &LimitOptions,
    ) -> Result<RateLimitDecision> {
        self.check_with(self.options.strategy, identifier, opts)
            .await
    }

    /// Decide and consume with an explicit strategy.
    ///
    /// Only invalid options produce an error; store failures fail open.
    pub async fn check_with(
        &self,
        strategy: RateLimitStrategy,
        identifier: &str,
        opts: &LimitOptions,
    ) -> Result<RateLimitDecision> {
        let params = self.resolve(opts)?;
        let now_ms = self.now_ms();

        match self.run(strategy, identifier, &params, now_ms).await {
            Ok(decision) => Ok(decision),
            Err(e) => {
                warn!(
                    identifier = %identifier,
                    strategy = %strategy,
                    error = %e,
                    "Counter store failed, allowing request"
                );
                Ok(RateLimitDecision::fail_open(&params, now_ms))
            }
        }
    }

    async fn run(
        &self,
        strategy: RateLimitStrategy,
        identifier: &str,
        params: &LimitParams,
        now_ms: u64,
    ) -> StoreResult<RateLimitDecision> {
        let algorithm = self.algorithm(strategy);
        with_timeout(
            self.options.store_timeout,
            algorithm.check_and_consume(identifier, params, now_ms),
        )
        .await
    }

    /// Read current usage with a zero-cost check. Never consumes.
    pub async fn get_usage(&self, identifier: &str, opts: &LimitOptions) -> Result<Usage> {
        let read_only = LimitOptions {
            cost: Some(0),
            ..*opts
        };
        let params = self.resolve(&read_only)?;
        let strategy = self.options.strategy;
        let decision = self
            .run(strategy, identifier, &params, self.now_ms())
            .await?;

        debug!(identifier = %identifier, remaining = decision.remaining, "usage read");

        Ok(Usage {
            identifier: identifier.to_string(),
            strategy,
            used: decision.used(),
            limit: decision.limit,
            remaining: decision.remaining_whole().min(decision.limit),
            reset: decision.reset_at_secs(),
        })
    }

    /// Delete every piece of limiter state held for `identifier`, across all
    /// strategies.
    pub async fn reset(&self, identifier: &str) -> Result<()> {
        for strategy in RateLimitStrategy::all() {
            with_timeout(
                self.options.store_timeout,
                self.algorithm(strategy).reset(identifier),
            )
            .await?;
        }
        info!(identifier = %identifier, "Rate limit state reset");
        Ok(())
    }

    pub async fn ping(&self) -> StoreResult<()> {
        with_timeout(self.options.store_timeout, self.store.ping()).await
    }
}
