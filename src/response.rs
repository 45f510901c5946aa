use crate::algorithms::RateLimitDecision;
use crate::throttler::LimitOutcome;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_COST: HeaderName = HeaderName::from_static("x-ratelimit-cost");
pub const X_RATELIMIT_TIER: HeaderName = HeaderName::from_static("x-ratelimit-tier");
pub const X_RATELIMIT_WARNING: HeaderName = HeaderName::from_static("x-ratelimit-warning");

const UNLIMITED: HeaderValue = HeaderValue::from_static("unlimited");

/// Decision as returned by the admin check endpoint.
#[derive(Debug, Serialize)]
pub struct RateLimitResponse {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: u64,
    pub retry_after: Option<u64>,
    pub degraded: bool,
}

impl RateLimitResponse {
    pub fn from_decision(decision: &RateLimitDecision, now_ms: u64) -> Self {
        Self {
            allowed: decision.allowed,
            limit: decision.limit,
            remaining: decision.remaining_whole(),
            reset_time: decision.reset_at_secs(),
            retry_after: (!decision.allowed).then(|| decision.retry_after_secs(now_ms)),
            degraded: decision.degraded,
        }
    }
}

/// 429 body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitExceededBody {
    pub error: &'static str,
    pub message: String,
    pub retry_after: u64,
    pub limit: u64,
    pub reset: u64,
    pub tier: String,
}

/// Standard rate limit headers for a metered decision.
pub fn decision_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(
        X_RATELIMIT_REMAINING,
        HeaderValue::from(decision.remaining_whole()),
    );
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
    headers.insert(X_RATELIMIT_COST, HeaderValue::from(decision.cost));
}

/// Headers for an admitted or denied request that went through the limiter.
pub fn limit_headers(headers: &mut HeaderMap, outcome: &LimitOutcome) {
    decision_headers(headers, &outcome.decision);
    if let Ok(tier) = HeaderValue::from_str(&outcome.tier) {
        headers.insert(X_RATELIMIT_TIER, tier);
    }

    if outcome.warning {
        let warning = format!(
            "Approaching rate limit: {} of {} remaining",
            outcome.decision.remaining_whole(),
            outcome.decision.limit
        );
        if let Ok(value) = HeaderValue::from_str(&warning) {
            headers.insert(X_RATELIMIT_WARNING, value);
        }
    }

    if !outcome.decision.allowed {
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(outcome.retry_after_secs()),
        );
    }
}

/// Marker headers for requests that skipped accounting.
pub fn unlimited_headers(headers: &mut HeaderMap, tier: &str) {
    headers.insert(X_RATELIMIT_LIMIT, UNLIMITED);
    headers.insert(X_RATELIMIT_REMAINING, UNLIMITED);
    if let Ok(tier) = HeaderValue::from_str(tier) {
        headers.insert(X_RATELIMIT_TIER, tier);
    }
}

pub fn too_many_requests(outcome: &LimitOutcome, message: &str) -> Response {
    let body = RateLimitExceededBody {
        error: "rate_limit_exceeded",
        message: message.to_string(),
        retry_after: outcome.retry_after_secs(),
        limit: outcome.decision.limit,
        reset: outcome.decision.reset_at_secs(),
        tier: outcome.tier.clone(),
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    limit_headers(response.headers_mut(), outcome);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(allowed: bool, remaining: f64, warning: bool) -> LimitOutcome {
        let decision = if allowed {
            RateLimitDecision::allowed(100, remaining, 1_700_000_060_000, 1)
        } else {
            RateLimitDecision::denied(100, remaining, 1_700_000_060_000, 1)
        };
        LimitOutcome {
            identifier: "ip:1.2.3.4".to_string(),
            tier: "free".to_string(),
            decision,
            warning,
            now_ms: 1_700_000_000_500,
        }
    }

    #[test]
    fn test_limit_headers_on_allow() {
        let mut headers = HeaderMap::new();
        limit_headers(&mut headers, &outcome(true, 41.7, false));

        assert_eq!(headers[&X_RATELIMIT_LIMIT], "100");
        assert_eq!(headers[&X_RATELIMIT_REMAINING], "41");
        assert_eq!(headers[&X_RATELIMIT_RESET], "1700000060");
        assert_eq!(headers[&X_RATELIMIT_COST], "1");
        assert_eq!(headers[&X_RATELIMIT_TIER], "free");
        assert!(headers.get(&X_RATELIMIT_WARNING).is_none());
        assert!(headers.get(axum::http::header::RETRY_AFTER).is_none());
    }

    #[test]
    fn test_warning_header() {
        let mut headers = HeaderMap::new();
        limit_headers(&mut headers, &outcome(true, 3.0, true));
        assert_eq!(
            headers[&X_RATELIMIT_WARNING],
            "Approaching rate limit: 3 of 100 remaining"
        );
    }

    #[test]
    fn test_too_many_requests_response() {
        let response = too_many_requests(&outcome(false, 0.0, false), "slow down");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        // 59.5s left rounds up.
        assert_eq!(response.headers()[axum::http::header::RETRY_AFTER], "60");
        assert_eq!(response.headers()[&X_RATELIMIT_REMAINING], "0");
    }

    #[test]
    fn test_exceeded_body_uses_camel_case() {
        let body = RateLimitExceededBody {
            error: "rate_limit_exceeded",
            message: "m".into(),
            retry_after: 5,
            limit: 10,
            reset: 123,
            tier: "pro".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["retryAfter"], 5);
        assert_eq!(json["error"], "rate_limit_exceeded");
    }

    #[test]
    fn test_unlimited_headers() {
        let mut headers = HeaderMap::new();
        unlimited_headers(&mut headers, "anonymous");
        assert_eq!(headers[&X_RATELIMIT_LIMIT], "unlimited");
        assert_eq!(headers[&X_RATELIMIT_REMAINING], "unlimited");
    }

    #[test]
    fn test_rate_limit_response_from_decision() {
        let denied = RateLimitDecision::denied(5, 0.0, 10_000, 1);
        let body = RateLimitResponse::from_decision(&denied, 8_500);
        assert!(!body.allowed);
        assert_eq!(body.retry_after, Some(2));
        assert_eq!(body.reset_time, 10);
    }
}
