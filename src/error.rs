use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the shared counter store.
///
/// Every variant is an infrastructure failure and is absorbed by the
/// fail-open policy on the request path.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum ThrottlerError {
    #[error("unknown rate limit strategy '{0}', expected one of: token-bucket, sliding-window, fixed-window")]
    UnknownStrategy(String),
    #[error("{0}")]
    InvalidApiKey(String),
    #[error("{0}")]
    Blocked(String),
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<validator::ValidationErrors> for ThrottlerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottlerError::ValidationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ThrottlerError>;

/// JSON body for every error response except the 429.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }

    pub fn from_throttler_error(err: &ThrottlerError) -> (StatusCode, Self) {
        match err {
            ThrottlerError::UnknownStrategy(_) | ThrottlerError::Configuration(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Self::new("configuration_error", &err.to_string()),
            ),
            ThrottlerError::InvalidApiKey(msg) => {
                (StatusCode::UNAUTHORIZED, Self::new("unauthorized", msg))
            }
            ThrottlerError::Blocked(msg) => (StatusCode::FORBIDDEN, Self::new("access_denied", msg)),
            ThrottlerError::ValidationError(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Self::new("validation_error", msg),
            ),
            ThrottlerError::Store(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Self::new("service_unavailable", &e.to_string()),
            ),
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let (status, body) = ErrorResponse::from_throttler_error(&self);
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(body)).into_response()
    }
}
