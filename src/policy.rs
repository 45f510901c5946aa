//! Compiled admission policy: tiers, whitelist, unlimited endpoints and
//! request cost rules.

use crate::algorithms::MAX_COST;
use crate::error::{Result, ThrottlerError};
use crate::rate_limit_config::{RateLimitConfig, TierConfig};
use regex::Regex;
use std::collections::HashSet;
use std::net::IpAddr;
use validator::Validate;

struct CompiledCostRule {
    method: Option<String>,
    path: Regex,
    cost: u64,
}

pub struct AdmissionPolicy {
    config: RateLimitConfig,
    whitelist: HashSet<IpAddr>,
    unlimited: Vec<Regex>,
    cost_rules: Vec<CompiledCostRule>,
}

impl AdmissionPolicy {
    /// Validate `config` and compile its regexes.
    pub fn new(config: RateLimitConfig, whitelist: impl IntoIterator<Item = IpAddr>) -> Result<Self> {
        for (name, tier) in &config.tiers {
            tier.validate().map_err(|e| {
                ThrottlerError::Configuration(format!("tier '{}' is invalid: {}", name, e))
            })?;
        }
        for name in [&config.anonymous_tier, &config.authenticated_tier] {
            if !config.tiers.contains_key(name) {
                return Err(ThrottlerError::Configuration(format!(
                    "default tier '{}' is not defined",
                    name
                )));
            }
        }

        let unlimited = config
            .unlimited_endpoints
            .iter()
            .map(|pattern| compile(pattern))
            .collect::<Result<Vec<_>>>()?;

        let cost_rules = config
            .cost_rules
            .iter()
            .map(|rule| {
                Ok(CompiledCostRule {
                    method: rule.method.as_ref().map(|m| m.to_ascii_uppercase()),
                    path: compile(&rule.path)?,
                    cost: rule.cost,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            whitelist: whitelist.into_iter().collect(),
            unlimited,
            cost_rules,
            config,
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.config.tier(name)
    }

    /// Tier name for a caller without an explicit tier.
    pub fn default_tier(&self, authenticated: bool) -> &str {
        if authenticated {
            &self.config.authenticated_tier
        } else {
            &self.config.anonymous_tier
        }
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.contains(ip) || (self.config.bypass_loopback && ip.is_loopback())
    }

    pub fn is_unlimited(&self, path: &str) -> bool {
        self.unlimited.iter().any(|re| re.is_match(path))
    }

    /// Cost of one request: method/path base cost times the tier multiplier,
    /// rounded up and capped at [`MAX_COST`]. Later cost rules win over
    /// earlier ones.
    pub fn cost_for(&self, method: &str, path: &str, tier: &TierConfig) -> u64 {
        let method = method.to_ascii_uppercase();
        let mut base = self
            .config
            .method_costs
            .get(&method)
            .copied()
            .unwrap_or(self.config.default_cost);

        for rule in &self.cost_rules {
            let method_matches = rule.method.as_ref().map_or(true, |m| *m == method);
            if method_matches && rule.path.is_match(path) {
                base = rule.cost;
            }
        }

        ((base as f64 * tier.multiplier(&method)).ceil() as u64).min(MAX_COST)
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        ThrottlerError::Configuration(format!("invalid path pattern '{}': {}", pattern, e))
    })
}
