use crate::error::ThrottlerError;
use crate::response::{limit_headers, too_many_requests, unlimited_headers};
use crate::throttler::{Admission, AuthenticatedUser, RequestContext, Throttler};
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Rate limiting middleware. Runs admission for every request and decorates
/// the downstream response with rate limit headers.
pub async fn admission_middleware(
    State(throttler): State<Arc<Throttler>>,
    request: Request,
    next: Next,
) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let admission = {
        let ctx = RequestContext {
            method: request.method(),
            path: request.uri().path(),
            headers: request.headers(),
            remote_addr,
            user: request.extensions().get::<AuthenticatedUser>(),
        };
        throttler.admit(&ctx).await
    };

    match admission {
        Admission::Bypass { tier, .. } => {
            let mut response = next.run(request).await;
            unlimited_headers(response.headers_mut(), &tier);
            response
        }
        Admission::Allowed(outcome) => {
            let mut response = next.run(request).await;
            limit_headers(response.headers_mut(), &outcome);
            response
        }
        Admission::Denied {
            outcome, message, ..
        } => too_many_requests(&outcome, &message),
        Admission::Unauthorized { message } => {
            ThrottlerError::InvalidApiKey(message).into_response()
        }
        Admission::Blocked { message } => ThrottlerError::Blocked(message).into_response(),
    }
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        target: "throttler::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    let status = response.status();
    info!(
        target: "throttler::middleware",
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    response
}
