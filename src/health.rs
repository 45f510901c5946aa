use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime};

use crate::rate_limiter::RateLimiter;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub strategy: String,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub store: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub backend: String,
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    rate_limiter: RateLimiter,
}

impl HealthChecker {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self { rate_limiter }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME)
            .unwrap_or_default()
            .as_secs();

        let store_status = self.check_store().await;

        let overall_status = if store_status.status == "healthy" {
            "healthy"
        } else {
            "degraded" // Requests fail open while the store is down
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            strategy: self.rate_limiter.strategy().to_string(),
            dependencies: DependencyStatus {
                store: store_status,
            },
        }
    }

    /// True when the counter store answers a ping.
    pub async fn is_store_available(&self) -> bool {
        self.rate_limiter.ping().await.is_ok()
    }

    async fn check_store(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = self.rate_limiter.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;
        let backend = self.rate_limiter.store().backend_name().to_string();

        match result {
            Ok(()) => ServiceStatus {
                backend,
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(e) => ServiceStatus {
                backend,
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some(e.to_string()),
            },
        }
    }
}
