//! Caller identity resolution.

use crate::api_keys::hash_api_key;
use axum::http::HeaderMap;
use std::net::IpAddr;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Client IP for the request.
///
/// Forwarding headers are only honoured in trust-proxy mode; otherwise the
/// transport address is the only source.
pub fn client_ip(headers: &HeaderMap, remote: Option<IpAddr>, trust_proxy: bool) -> Option<IpAddr> {
    if trust_proxy {
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        if real_ip.is_some() {
            return real_ip;
        }

        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    remote
}

pub fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Limiter identifier: `user:{id}`, else `key:{16 hex of sha256}`, else `ip:{ip}`.
pub fn resolve(user_id: Option<&str>, api_key: Option<&str>, ip: Option<IpAddr>) -> String {
    if let Some(id) = user_id {
        return format!("user:{}", sanitize_key(id));
    }
    if let Some(key) = api_key {
        let hash = hash_api_key(key);
        return format!("key:{}", &hash[..16]);
    }
    match ip {
        Some(ip) => format!("ip:{}", ip),
        None => "ip:unknown".to_string(),
    }
}

/// Sanitize key components to ensure valid store keys
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ':' | '-' | '_' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
