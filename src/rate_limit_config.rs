use crate::error::ThrottlerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Rate limit strategy enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitStrategy {
    #[default]
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl RateLimitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitStrategy::TokenBucket => "token-bucket",
            RateLimitStrategy::SlidingWindow => "sliding-window",
            RateLimitStrategy::FixedWindow => "fixed-window",
        }
    }

    /// Store key namespace of this strategy's state.
    pub fn namespace(&self) -> &'static str {
        match self {
            RateLimitStrategy::TokenBucket => "tb",
            RateLimitStrategy::SlidingWindow => "sw",
            RateLimitStrategy::FixedWindow => "fw",
        }
    }

    pub fn all() -> [RateLimitStrategy; 3] {
        [
            RateLimitStrategy::TokenBucket,
            RateLimitStrategy::SlidingWindow,
            RateLimitStrategy::FixedWindow,
        ]
    }
}

impl fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitStrategy {
    type Err = ThrottlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "token-bucket" => Ok(RateLimitStrategy::TokenBucket),
            "sliding-window" => Ok(RateLimitStrategy::SlidingWindow),
            "fixed-window" => Ok(RateLimitStrategy::FixedWindow),
            _ => Err(ThrottlerError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Quota attached to a caller class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TierConfig {
    #[validate(range(min = 1))]
    pub limit: u64,
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_tier_window"))]
    pub window: Duration,
    #[serde(default)]
    pub burst: u64,
    /// Per-method multiplier applied to the request cost, keyed by upper-case method.
    #[serde(default)]
    #[validate(custom(function = "validate_multipliers"))]
    pub cost_multipliers: HashMap<String, f64>,
}

impl TierConfig {
    pub fn new(limit: u64, window: Duration, burst: u64) -> Self {
        Self {
            limit,
            window,
            burst,
            cost_multipliers: HashMap::new(),
        }
    }

    pub fn multiplier(&self, method: &str) -> f64 {
        self.cost_multipliers
            .get(&method.to_ascii_uppercase())
            .copied()
            .unwrap_or(1.0)
    }
}

fn validate_tier_window(window: &Duration) -> Result<(), ValidationError> {
    if *window < Duration::from_secs(1) {
        return Err(ValidationError::new("window_below_one_second"));
    }
    Ok(())
}

fn validate_multipliers(multipliers: &HashMap<String, f64>) -> Result<(), ValidationError> {
    if multipliers.values().any(|m| !m.is_finite() || *m <= 0.0) {
        return Err(ValidationError::new("cost_multiplier_must_be_positive"));
    }
    Ok(())
}

/// Cost override for requests whose path matches `path` (a regex).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRule {
    #[serde(default)]
    pub method: Option<String>,
    pub path: String,
    pub cost: u64,
}

/// API key known to the built-in validator. Only the sha256 hash is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub hash: String,
    pub owner_id: String,
    pub tier: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub expires_at_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl ApiKeyRecord {
    pub fn is_usable(&self, now_ms: u64) -> bool {
        self.active && self.expires_at_ms.map_or(true, |at| now_ms < at)
    }
}

/// Admission policy loaded from `POLICY_FILE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tiers: HashMap<String, TierConfig>,
    pub anonymous_tier: String,
    pub authenticated_tier: String,
    /// Regexes of paths that skip accounting.
    pub unlimited_endpoints: Vec<String>,
    pub method_costs: HashMap<String, u64>,
    pub cost_rules: Vec<CostRule>,
    pub default_cost: u64,
    /// Exempt loopback callers from limiting.
    pub bypass_loopback: bool,
    pub api_keys: Vec<ApiKeyRecord>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "anonymous".to_string(),
            TierConfig::new(60, Duration::from_secs(60), 10),
        );
        tiers.insert(
            "authenticated".to_string(),
            TierConfig::new(300, Duration::from_secs(60), 50),
        );
        tiers.insert(
            "free".to_string(),
            TierConfig::new(1_000, Duration::from_secs(24 * 3600), 0),
        );
        tiers.insert(
            "pro".to_string(),
            TierConfig::new(5_000, Duration::from_secs(3600), 500),
        );
        tiers.insert(
            "enterprise".to_string(),
            TierConfig::new(20_000, Duration::from_secs(3600), 2_000),
        );

        let method_costs = ["POST", "PUT", "PATCH", "DELETE"]
            .into_iter()
            .map(|m| (m.to_string(), 2))
            .collect();

        Self {
            tiers,
            anonymous_tier: "anonymous".to_string(),
            authenticated_tier: "authenticated".to_string(),
            unlimited_endpoints: vec!["^/health$".to_string(), "^/ready$".to_string()],
            method_costs,
            cost_rules: Vec::new(),
            default_cost: 1,
            bypass_loopback: true,
            api_keys: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn from_json(json: &str) -> Result<Self, ThrottlerError> {
        serde_json::from_str(json)
            .map_err(|e| ThrottlerError::Configuration(format!("Invalid policy file: {}", e)))
    }

    /// Get the named tier, if configured.
    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_str_accepts_both_spellings() {
        assert_eq!(
            "token-bucket".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::TokenBucket
        );
        assert_eq!(
            "sliding_window".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::SlidingWindow
        );
        assert_eq!(
            " Fixed-Window ".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::FixedWindow
        );
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let err = "leaky-bucket".parse::<RateLimitStrategy>().unwrap_err();
        assert!(matches!(err, ThrottlerError::UnknownStrategy(s) if s == "leaky-bucket"));
    }

    #[test]
    fn test_strategy_serde_and_namespace() {
        let json = serde_json::to_string(&RateLimitStrategy::SlidingWindow).unwrap();
        assert_eq!(json, "\"sliding-window\"");
        let namespaces: Vec<_> = RateLimitStrategy::all().iter().map(|s| s.namespace()).collect();
        assert_eq!(namespaces, vec!["tb", "sw", "fw"]);
    }

    #[test]
    fn test_default_policy_tiers_are_valid() {
        let config = RateLimitConfig::default();
        for (name, tier) in &config.tiers {
            assert!(tier.validate().is_ok(), "tier {} invalid", name);
        }
        assert!(config.tier(&config.anonymous_tier).is_some());
        assert!(config.tier(&config.authenticated_tier).is_some());
        assert_eq!(config.method_costs.get("POST"), Some(&2));
    }

    #[test]
    fn test_policy_json_with_humantime_windows() {
        let json = r#"{
            "tiers": {
                "anonymous": { "limit": 5, "window": "1m" },
                "free": { "limit": 1000, "window": "24h", "cost_multipliers": { "POST": 1.5 } }
            },
            "unlimited_endpoints": ["^/status$"]
        }"#;

        let config = RateLimitConfig::from_json(json).unwrap();
        let free = config.tier("free").unwrap();
        assert_eq!(free.window, Duration::from_secs(86_400));
        assert_eq!(free.multiplier("post"), 1.5);
        assert_eq!(free.multiplier("GET"), 1.0);
        assert_eq!(config.tier("anonymous").unwrap().burst, 0);
        // Unspecified fields keep their defaults.
        assert_eq!(config.default_cost, 1);
        assert_eq!(config.anonymous_tier, "anonymous");
    }

    #[test]
    fn test_invalid_tier_is_caught_by_validation() {
        let mut tier = TierConfig::new(0, Duration::from_millis(10), 0);
        tier.cost_multipliers.insert("POST".into(), -1.0);
        let errors = tier.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("limit"));
        assert!(fields.contains_key("window"));
        assert!(fields.contains_key("cost_multipliers"));
    }

    #[test]
    fn test_api_key_record_usability() {
        let mut record = ApiKeyRecord {
            hash: "abc".into(),
            owner_id: "acme".into(),
            tier: "pro".into(),
            active: true,
            expires_at_ms: Some(1_000),
        };
        assert!(record.is_usable(999));
        assert!(!record.is_usable(1_000));
        record.expires_at_ms = None;
        record.active = false;
        assert!(!record.is_usable(0));
    }
}
