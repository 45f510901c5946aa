//! Request admission.
//!
//! [`Throttler::admit`] runs one request through
//! `resolve -> bypass -> blocklist -> endpoint policy -> key validation ->
//! cost -> limiter` and returns an [`Admission`] for the HTTP layer to render.
//! Infrastructure failures at any step are logged and fail open.

use crate::algorithms::{LimitOptions, LimitParams, RateLimitDecision};
use crate::api_keys::{hash_api_key, ApiKeyValidator};
use crate::blocklist::Blocklist;
use crate::identifier;
use crate::metrics::{AdmissionEvent, MetricsCollector};
use crate::policy::AdmissionPolicy;
use crate::rate_limit_config::TierConfig;
use crate::rate_limiter::RateLimiter;
use crate::store::with_timeout;
use axum::http::{HeaderMap, Method};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Identity established by an upstream authentication layer, carried as a
/// request extension.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser {
    pub id: String,
    pub tier: Option<String>,
}

/// The parts of a request admission looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub remote_addr: Option<IpAddr>,
    pub user: Option<&'a AuthenticatedUser>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Whitelisted,
    UnlimitedEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Exceeded,
    DailyLimit,
    TierUpgradeRequired,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Exceeded => "exceeded",
            DenyReason::DailyLimit => "daily_limit",
            DenyReason::TierUpgradeRequired => "tier_upgrade_required",
        }
    }
}

/// A limiter decision together with what the response needs to describe it.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitOutcome {
    pub identifier: String,
    pub tier: String,
    pub decision: RateLimitDecision,
    /// Remaining capacity fell under the warning threshold.
    pub warning: bool,
    pub now_ms: u64,
}

impl LimitOutcome {
    pub fn retry_after_secs(&self) -> u64 {
        self.decision.retry_after_secs(self.now_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Bypass { reason: BypassReason, tier: String },
    Allowed(LimitOutcome),
    Denied {
        outcome: LimitOutcome,
        reason: DenyReason,
        message: String,
    },
    Unauthorized { message: String },
    Blocked { message: String },
}

#[derive(Debug, Clone, Copy)]
pub struct ThrottlerSettings {
    /// Honour `X-Real-IP` / `X-Forwarded-For`.
    pub trust_proxy: bool,
    /// Fraction of the limit below which allowed responses carry a warning.
    pub warning_threshold: f64,
}

impl Default for ThrottlerSettings {
    fn default() -> Self {
        Self {
            trust_proxy: false,
            warning_threshold: 0.2,
        }
    }
}

/// Admission middleware core, shared across requests.
pub struct Throttler {
    limiter: RateLimiter,
    blocklist: Blocklist,
    api_keys: Arc<dyn ApiKeyValidator>,
    policy: Arc<AdmissionPolicy>,
    metrics: MetricsCollector,
    settings: ThrottlerSettings,
}

impl Throttler {
    pub fn new(
        limiter: RateLimiter,
        blocklist: Blocklist,
        api_keys: Arc<dyn ApiKeyValidator>,
        policy: Arc<AdmissionPolicy>,
        metrics: MetricsCollector,
        settings: ThrottlerSettings,
    ) -> Self {
        Self {
            limiter,
            blocklist,
            api_keys,
            policy,
            metrics,
            settings,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub async fn admit(&self, ctx: &RequestContext<'_>) -> Admission {
        let ip = identifier::client_ip(ctx.headers, ctx.remote_addr, self.settings.trust_proxy);
        let api_key = identifier::api_key(ctx.headers);
        let id = identifier::resolve(ctx.user.map(|u| u.id.as_str()), api_key, ip);
        let default_tier = self.policy.default_tier(ctx.user.is_some()).to_string();

        if ip.is_some_and(|ip| self.policy.is_whitelisted(&ip)) {
            debug!(identifier = %id, "Whitelisted caller, skipping rate limit");
            self.metrics.record(&default_tier, AdmissionEvent::Bypassed).await;
            return Admission::Bypass {
                reason: BypassReason::Whitelisted,
                tier: default_tier,
            };
        }

        if self.is_blocked(ip, &id).await {
            self.metrics.record(&default_tier, AdmissionEvent::Blocked).await;
            return Admission::Blocked {
                message: "Access denied".to_string(),
            };
        }

        if self.policy.is_unlimited(ctx.path) {
            self.metrics.record(&default_tier, AdmissionEvent::Unlimited).await;
            return Admission::Bypass {
                reason: BypassReason::UnlimitedEndpoint,
                tier: default_tier,
            };
        }

        let mut tier_name = ctx
            .user
            .and_then(|u| u.tier.clone())
            .unwrap_or_else(|| default_tier.clone());

        if let Some(raw) = api_key {
            match self.validate_api_key(raw).await {
                KeyCheck::Valid(tier) => tier_name = tier,
                KeyCheck::Rejected(message) => {
                    self.metrics
                        .record(&default_tier, AdmissionEvent::Unauthorized)
                        .await;
                    return Admission::Unauthorized { message };
                }
                KeyCheck::Unverified => {}
            }
        }

        if self.policy.tier(&tier_name).is_none() {
            warn!(tier = %tier_name, "Unknown tier, using default");
            tier_name = default_tier.clone();
        }
        // Default tiers are checked when the policy is built.
        let Some(tier) = self.policy.tier(&tier_name) else {
            return Admission::Bypass {
                reason: BypassReason::UnlimitedEndpoint,
                tier: tier_name,
            };
        };

        let cost = self.policy.cost_for(ctx.method.as_str(), ctx.path, tier);
        let opts = LimitOptions {
            limit: Some(tier.limit),
            window: Some(tier.window),
            burst: Some(tier.burst),
            cost: Some(cost),
        };

        let now_ms = self.limiter.now_ms();
        let decision = match self.limiter.check_and_consume(&id, &opts).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(identifier = %id, tier = %tier_name, error = %e, "Limiter rejected tier parameters, allowing request");
                RateLimitDecision::fail_open(&tier_params(tier, cost), now_ms)
            }
        };

        let warning = decision.allowed
            && (decision.remaining / decision.limit.max(1) as f64) < self.settings.warning_threshold;
        let outcome = LimitOutcome {
            identifier: id,
            tier: tier_name,
            decision,
            warning,
            now_ms,
        };

        if decision.allowed {
            let event = if decision.degraded {
                AdmissionEvent::FailOpen
            } else {
                AdmissionEvent::Allowed
            };
            self.metrics.record(&outcome.tier, event).await;
            return Admission::Allowed(outcome);
        }

        self.metrics
            .record(&outcome.tier, AdmissionEvent::Throttled)
            .await;
        let capacity = tier_params(tier, cost).capacity(self.limiter.strategy());
        let reason = deny_reason(tier, cost, capacity);
        let message = deny_message(reason, &outcome, capacity);

        warn!(
            identifier = %outcome.identifier,
            tier = %outcome.tier,
            cost,
            reason = reason.as_str(),
            "Rate limit exceeded"
        );

        Admission::Denied {
            outcome,
            reason,
            message,
        }
    }

    async fn is_blocked(&self, ip: Option<IpAddr>, id: &str) -> bool {
        let ip = ip.map(|ip| ip.to_string());
        let mut targets = vec![id];
        if let Some(ip) = ip.as_deref() {
            targets.push(ip);
        }

        match self.blocklist.is_blocked(&targets).await {
            Ok(blocked) => blocked,
            Err(e) => {
                warn!(identifier = %id, error = %e, "Blocklist unavailable, skipping check");
                false
            }
        }
    }

    async fn validate_api_key(&self, raw: &str) -> KeyCheck {
        let hash = hash_api_key(raw);
        let timeout = self.limiter.options().store_timeout;
        let now_ms = self.limiter.now_ms();

        match with_timeout(timeout, self.api_keys.lookup(&hash)).await {
            Ok(Some(record)) if record.is_usable(now_ms) => KeyCheck::Valid(record.tier),
            Ok(Some(record)) if !record.active => {
                KeyCheck::Rejected("API key has been revoked".to_string())
            }
            Ok(Some(_)) => KeyCheck::Rejected("API key has expired".to_string()),
            Ok(None) => KeyCheck::Rejected("Invalid API key".to_string()),
            Err(e) => {
                warn!(error = %e, "API key validation unavailable, continuing without key tier");
                KeyCheck::Unverified
            }
        }
    }
}

enum KeyCheck {
    Valid(String),
    Rejected(String),
    Unverified,
}

fn tier_params(tier: &TierConfig, cost: u64) -> LimitParams {
    LimitParams {
        limit: tier.limit,
        window: tier.window,
        burst: tier.burst,
        cost,
    }
}

fn deny_reason(tier: &TierConfig, cost: u64, capacity: u64) -> DenyReason {
    if cost > capacity {
        DenyReason::TierUpgradeRequired
    } else if tier.window >= DAY {
        DenyReason::DailyLimit
    } else {
        DenyReason::Exceeded
    }
}

fn deny_message(reason: DenyReason, outcome: &LimitOutcome, capacity: u64) -> String {
    let retry_after = outcome.retry_after_secs();
    match reason {
        DenyReason::Exceeded => format!(
            "Rate limit exceeded. Try again in {} seconds.",
            retry_after
        ),
        DenyReason::DailyLimit => format!(
            "Daily request limit reached for the {} tier. Limit resets in {} seconds.",
            outcome.tier, retry_after
        ),
        DenyReason::TierUpgradeRequired => format!(
            "This request costs {} units but the {} tier allows at most {}. Upgrade your plan to continue.",
            outcome.decision.cost, outcome.tier, capacity
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_keys::{ApiKeyRecord, StaticApiKeyValidator};
    use crate::clock::ManualClock;
    use crate::rate_limit_config::{RateLimitConfig, RateLimitStrategy};
    use crate::rate_limiter::RateLimiterOptions;
    use crate::store::InMemoryStore;
    use axum::http::HeaderValue;

    struct Harness {
        throttler: Throttler,
        store: Arc<InMemoryStore>,
        clock: ManualClock,
    }

    fn harness(config: RateLimitConfig, strategy: RateLimitStrategy) -> Harness {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let options = RateLimiterOptions {
            strategy,
            ..RateLimiterOptions::default()
        };
        let limiter = RateLimiter::with_clock(store.clone(), options, Arc::new(clock.clone()));
        let blocklist = Blocklist::new(store.clone(), "ratelimit", Duration::from_millis(50));
        let api_keys = StaticApiKeyValidator::from_records([
            ApiKeyRecord {
                hash: hash_api_key("sk_pro"),
                owner_id: "acme".into(),
                tier: "pro".into(),
                active: true,
                expires_at_ms: None,
            },
            ApiKeyRecord {
                hash: hash_api_key("sk_old"),
                owner_id: "acme".into(),
                tier: "pro".into(),
                active: true,
                expires_at_ms: Some(1_000),
            },
        ]);
        let policy = AdmissionPolicy::new(config, Vec::<IpAddr>::new()).unwrap();

        Harness {
            throttler: Throttler::new(
                limiter,
                blocklist,
                Arc::new(api_keys),
                Arc::new(policy),
                MetricsCollector::new(),
                ThrottlerSettings::default(),
            ),
            store,
            clock,
        }
    }

    fn small_anonymous_tier(limit: u64, window: Duration) -> RateLimitConfig {
        let mut config = RateLimitConfig::default();
        config
            .tiers
            .insert("anonymous".into(), TierConfig::new(limit, window, 0));
        config
    }

    async fn admit(
        throttler: &Throttler,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        remote: &str,
        user: Option<&AuthenticatedUser>,
    ) -> Admission {
        let ctx = RequestContext {
            method,
            path,
            headers,
            remote_addr: Some(remote.parse().unwrap()),
            user,
        };
        throttler.admit(&ctx).await
    }

    #[tokio::test]
    async fn test_loopback_bypasses_regardless_of_volume() {
        let h = harness(
            small_anonymous_tier(1, Duration::from_secs(60)),
            RateLimitStrategy::FixedWindow,
        );
        let headers = HeaderMap::new();
        for _ in 0..200 {
            let admission = admit(&h.throttler, &Method::GET, "/api", &headers, "127.0.0.1", None).await;
            assert!(matches!(
                admission,
                Admission::Bypass {
                    reason: BypassReason::Whitelisted,
                    ..
                }
            ));
        }
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_deny_then_allow_after_window() {
        let h = harness(
            small_anonymous_tier(2, Duration::from_secs(10)),
            RateLimitStrategy::SlidingWindow,
        );
        let headers = HeaderMap::new();

        for _ in 0..2 {
            let admission = admit(&h.throttler, &Method::GET, "/api", &headers, "10.0.0.1", None).await;
            assert!(matches!(admission, Admission::Allowed(_)));
        }
        match admit(&h.throttler, &Method::GET, "/api", &headers, "10.0.0.1", None).await {
            Admission::Denied { outcome, reason, .. } => {
                assert_eq!(reason, DenyReason::Exceeded);
                assert_eq!(outcome.identifier, "ip:10.0.0.1");
                assert_eq!(outcome.tier, "anonymous");
                assert_eq!(outcome.retry_after_secs(), 10);
            }
            other => panic!("expected denial, got {:?}", other),
        }

        h.clock.advance(Duration::from_secs(11));
        let admission = admit(&h.throttler, &Method::GET, "/api", &headers, "10.0.0.1", None).await;
        assert!(matches!(admission, Admission::Allowed(_)));
    }

    #[tokio::test]
    async fn test_post_costs_two_units() {
        let h = harness(
            small_anonymous_tier(2, Duration::from_secs(60)),
            RateLimitStrategy::FixedWindow,
        );
        let headers = HeaderMap::new();

        match admit(&h.throttler, &Method::POST, "/api", &headers, "10.0.0.2", None).await {
            Admission::Allowed(outcome) => {
                assert_eq!(outcome.decision.cost, 2);
                assert_eq!(outcome.decision.remaining_whole(), 0);
                assert!(outcome.warning);
            }
            other => panic!("expected allow, got {:?}", other),
        }
        let admission = admit(&h.throttler, &Method::POST, "/api", &headers, "10.0.0.2", None).await;
        assert!(matches!(admission, Admission::Denied { .. }));
    }

    #[tokio::test]
    async fn test_cost_above_capacity_requires_upgrade() {
        let h = harness(
            small_anonymous_tier(1, Duration::from_secs(60)),
            RateLimitStrategy::FixedWindow,
        );
        let admission = admit(&h.throttler, &Method::DELETE, "/api/x", &HeaderMap::new(), "10.0.0.3", None).await;
        assert!(matches!(
            admission,
            Admission::Denied {
                reason: DenyReason::TierUpgradeRequired,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_daily_tier_denial_reason() {
        let mut config = RateLimitConfig::default();
        config
            .tiers
            .insert("free".into(), TierConfig::new(1, DAY, 0));
        let h = harness(config, RateLimitStrategy::FixedWindow);
        let user = AuthenticatedUser {
            id: "42".into(),
            tier: Some("free".into()),
        };
        let headers = HeaderMap::new();

        let first = admit(&h.throttler, &Method::GET, "/api", &headers, "10.0.0.4", Some(&user)).await;
        assert!(matches!(first, Admission::Allowed(ref o) if o.identifier == "user:42"));
        let second = admit(&h.throttler, &Method::GET, "/api", &headers, "10.0.0.4", Some(&user)).await;
        assert!(matches!(
            second,
            Admission::Denied {
                reason: DenyReason::DailyLimit,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_api_key_tier_and_rejections() {
        let h = harness(RateLimitConfig::default(), RateLimitStrategy::TokenBucket);

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk_pro"));
        match admit(&h.throttler, &Method::GET, "/api", &headers, "10.0.0.5", None).await {
            Admission::Allowed(outcome) => {
                assert_eq!(outcome.tier, "pro");
                assert!(outcome.identifier.starts_with("key:"));
            }
            other => panic!("expected allow, got {:?}", other),
        }

        headers.insert("x-api-key", HeaderValue::from_static("sk_unknown"));
        let admission = admit(&h.throttler, &Method::GET, "/api", &headers, "10.0.0.5", None).await;
        assert!(matches!(admission, Admission::Unauthorized { .. }));

        headers.insert("x-api-key", HeaderValue::from_static("sk_old"));
        match admit(&h.throttler, &Method::GET, "/api", &headers, "10.0.0.5", None).await {
            Admission::Unauthorized { message } => assert!(message.contains("expired")),
            other => panic!("expected 401, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocked_ip_never_reaches_limiter() {
        let h = harness(RateLimitConfig::default(), RateLimitStrategy::FixedWindow);
        h.throttler.blocklist().block("10.0.0.6", None).await.unwrap();

        let admission = admit(&h.throttler, &Method::GET, "/api", &HeaderMap::new(), "10.0.0.6", None).await;
        assert!(matches!(admission, Admission::Blocked { .. }));
        // Only the blocklist entry exists.
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unlimited_endpoint_skips_accounting() {
        let h = harness(
            small_anonymous_tier(1, Duration::from_secs(60)),
            RateLimitStrategy::TokenBucket,
        );
        for _ in 0..5 {
            let admission = admit(&h.throttler, &Method::GET, "/health", &HeaderMap::new(), "10.0.0.7", None).await;
            assert!(matches!(
                admission,
                Admission::Bypass {
                    reason: BypassReason::UnlimitedEndpoint,
                    ..
                }
            ));
        }
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open_end_to_end() {
        let h = harness(
            small_anonymous_tier(1, Duration::from_secs(60)),
            RateLimitStrategy::SlidingWindow,
        );
        h.store.set_available(false);

        for _ in 0..10 {
            match admit(&h.throttler, &Method::GET, "/api", &HeaderMap::new(), "10.0.0.8", None).await {
                Admission::Allowed(outcome) => {
                    assert!(outcome.decision.degraded);
                    assert_eq!(outcome.decision.remaining_whole(), 1);
                }
                other => panic!("expected fail-open, got {:?}", other),
            }
        }

        let metrics = h.throttler.metrics().get_tier_metrics("anonymous").await.unwrap();
        assert_eq!(metrics.fail_open_requests, 10);
    }
}
