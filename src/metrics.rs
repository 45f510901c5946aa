use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Admission counters for one tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
    pub bypassed_requests: u64,
    pub unlimited_requests: u64,
    pub fail_open_requests: u64,
    pub unauthorized_requests: u64,
    pub blocked_requests: u64,
}

/// What happened to one request at the admission layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionEvent {
    Allowed,
    Throttled,
    Bypassed,
    Unlimited,
    FailOpen,
    Unauthorized,
    Blocked,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub since: u64,
    pub global: TierMetrics,
    pub tiers: HashMap<String, TierMetrics>,
}

#[derive(Debug, Clone)]
pub struct MetricsCollector {
    tier_metrics: Arc<RwLock<HashMap<String, TierMetrics>>>,
    started_at: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tier_metrics: Arc::new(RwLock::new(HashMap::new())),
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub async fn record(&self, tier: &str, event: AdmissionEvent) {
        let mut metrics = self.tier_metrics.write().await;
        let tier_metrics = metrics.entry(tier.to_string()).or_default();

        tier_metrics.total_requests += 1;
        match event {
            AdmissionEvent::Allowed => tier_metrics.allowed_requests += 1,
            AdmissionEvent::Throttled => tier_metrics.throttled_requests += 1,
            AdmissionEvent::Bypassed => tier_metrics.bypassed_requests += 1,
            AdmissionEvent::Unlimited => tier_metrics.unlimited_requests += 1,
            AdmissionEvent::FailOpen => {
                tier_metrics.fail_open_requests += 1;
                tier_metrics.allowed_requests += 1;
            }
            AdmissionEvent::Unauthorized => tier_metrics.unauthorized_requests += 1,
            AdmissionEvent::Blocked => tier_metrics.blocked_requests += 1,
        }
    }

    pub async fn get_tier_metrics(&self, tier: &str) -> Option<TierMetrics> {
        let metrics = self.tier_metrics.read().await;
        metrics.get(tier).cloned()
    }

    pub async fn get_global_metrics(&self) -> TierMetrics {
        let metrics = self.tier_metrics.read().await;
        let mut global = TierMetrics::default();

        for m in metrics.values() {
            global.total_requests += m.total_requests;
            global.allowed_requests += m.allowed_requests;
            global.throttled_requests += m.throttled_requests;
            global.bypassed_requests += m.bypassed_requests;
            global.unlimited_requests += m.unlimited_requests;
            global.fail_open_requests += m.fail_open_requests;
            global.unauthorized_requests += m.unauthorized_requests;
            global.blocked_requests += m.blocked_requests;
        }

        global
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let tiers = self.tier_metrics.read().await.clone();
        MetricsSnapshot {
            since: self.started_at,
            global: self.get_global_metrics().await,
            tiers,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
