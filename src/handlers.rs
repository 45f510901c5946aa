use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ThrottlerError;
use crate::health::HealthChecker;
use crate::response::RateLimitResponse;
use crate::throttler::Throttler;
use crate::validation::{BlockRequest, CheckRequest, RequestValidator, UsageQuery};
use validator::Validate;

/// Shared application state
pub type SharedState = Arc<AppState>;

/// Application state built once at startup and shared by every handler.
pub struct AppState {
    pub throttler: Arc<Throttler>,
    pub health: HealthChecker,
}

impl AppState {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        let health = HealthChecker::new(throttler.limiter().clone());
        Self { throttler, health }
    }
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub status: String,
    pub message: String,
    pub target: String,
}

impl ActionResponse {
    fn success(message: &str, target: String) -> Self {
        Self {
            status: "success".to_string(),
            message: message.to_string(),
            target,
        }
    }
}

/// Consume from an identifier's budget and report the decision.
pub async fn check_rate_limit(
    State(state): State<SharedState>,
    Path(identifier): Path<String>,
    payload: Option<Json<CheckRequest>>,
) -> Result<impl IntoResponse, ThrottlerError> {
    RequestValidator::validate_identifier(&identifier)?;
    let body = payload.map(|Json(body)| body).unwrap_or_default();
    let opts = RequestValidator::validate_check_request(&body)?;

    let limiter = state.throttler.limiter();
    let decision = limiter.check_and_consume(&identifier, &opts).await?;
    let now_ms = limiter.now_ms();

    let mut resp = Json(RateLimitResponse::from_decision(&decision, now_ms)).into_response();
    if !decision.allowed {
        *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        resp.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from(decision.retry_after_secs(now_ms)),
        );
    }

    Ok(resp)
}

/// Current usage of an identifier under the `limit`/`window_secs`/`burst`
/// given in the query, falling back to the configured defaults. Does not
/// consume.
pub async fn get_rate_limit(
    State(state): State<SharedState>,
    Path(identifier): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<impl IntoResponse, ThrottlerError> {
    RequestValidator::validate_identifier(&identifier)?;
    let opts = RequestValidator::validate_usage_query(&query)?;

    let usage = state
        .throttler
        .limiter()
        .get_usage(&identifier, &opts)
        .await?;

    Ok(Json(usage))
}

/// Delete all limiter state for an identifier
pub async fn delete_rate_limit(
    State(state): State<SharedState>,
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, ThrottlerError> {
    RequestValidator::validate_identifier(&identifier)?;

    state.throttler.limiter().reset(&identifier).await?;

    Ok(Json(ActionResponse::success(
        "Rate limit state reset",
        identifier,
    )))
}

pub async fn block_target(
    State(state): State<SharedState>,
    Path(target): Path<String>,
    payload: Option<Json<BlockRequest>>,
) -> Result<impl IntoResponse, ThrottlerError> {
    RequestValidator::validate_identifier(&target)?;
    let body = payload.map(|Json(body)| body).unwrap_or_default();
    body.validate()?;

    state
        .throttler
        .blocklist()
        .block(&target, body.ttl_secs.map(Duration::from_secs))
        .await?;

    Ok(Json(ActionResponse::success("Target blocked", target)))
}

pub async fn unblock_target(
    State(state): State<SharedState>,
    Path(target): Path<String>,
) -> Result<impl IntoResponse, ThrottlerError> {
    RequestValidator::validate_identifier(&target)?;

    let removed = state.throttler.blocklist().unblock(&target).await?;
    let message = if removed {
        "Target unblocked"
    } else {
        "Target was not blocked"
    };

    Ok(Json(ActionResponse::success(message, target)))
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let connected = state.health.is_store_available().await;

    if connected {
        (StatusCode::OK, Json(serde_json::json!({
            "status": "ready",
            "store": "connected"
        })))
    } else {
        (StatusCode::OK, Json(serde_json::json!({
            "status": "ready",
            "store": "disconnected",
            "note": "Requests are admitted without limiting until the store recovers"
        })))
    }
}

pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.throttler.metrics().snapshot().await)
}
