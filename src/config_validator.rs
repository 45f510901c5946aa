use crate::error::ThrottlerError;
use crate::rate_limit_config::RateLimitConfig;
use validator::Validate;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL. Empty selects the in-memory store.
    pub fn validate_redis_url(url: &str) -> Result<(), ThrottlerError> {
        if url.is_empty() {
            return Ok(());
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ThrottlerError::ValidationError(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a bind address
    pub fn validate_bind_address(address: &str) -> Result<(), ThrottlerError> {
        if address.is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Bind address cannot be empty".to_string(),
            ));
        }

        // Check if it looks like host:port format
        if !address.contains(':') {
            return Err(ThrottlerError::ValidationError(
                "Bind address must be in host:port format".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates default limiter parameters
    pub fn validate_rate_limit(limit: u64, window_secs: u64) -> Result<(), ThrottlerError> {
        if limit == 0 {
            return Err(ThrottlerError::ValidationError(
                "Rate limit must be greater than 0".to_string(),
            ));
        }

        if window_secs == 0 {
            return Err(ThrottlerError::ValidationError(
                "Rate limit window must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_warning_threshold(threshold: f64) -> Result<(), ThrottlerError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ThrottlerError::ValidationError(format!(
                "Warning threshold must be between 0 and 1, got {}",
                threshold
            )));
        }
        Ok(())
    }

    pub fn validate_key_prefix(prefix: &str) -> Result<(), ThrottlerError> {
        if prefix.is_empty() || prefix.chars().any(|c| c.is_whitespace() || c == '*') {
            return Err(ThrottlerError::ValidationError(
                "Key prefix must be non-empty and contain no whitespace or '*'".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates every tier and the default tier references of a policy.
    pub fn validate_policy(policy: &RateLimitConfig) -> Result<(), ThrottlerError> {
        if policy.tiers.is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Policy must define at least one tier".to_string(),
            ));
        }

        for (name, tier) in &policy.tiers {
            tier.validate().map_err(|e| {
                ThrottlerError::ValidationError(format!("Tier '{}': {}", name, e))
            })?;
        }

        for name in [&policy.anonymous_tier, &policy.authenticated_tier] {
            if !policy.tiers.contains_key(name) {
                return Err(ThrottlerError::ValidationError(format!(
                    "Default tier '{}' is not defined",
                    name
                )));
            }
        }

        for record in &policy.api_keys {
            if !policy.tiers.contains_key(&record.tier) {
                return Err(ThrottlerError::ValidationError(format!(
                    "API key for '{}' references unknown tier '{}'",
                    record.owner_id, record.tier
                )));
            }
        }

        Ok(())
    }
}
