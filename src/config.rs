use crate::config_validator::ConfigValidator;
use crate::error::{Result, ThrottlerError};
use crate::rate_limit_config::{RateLimitConfig, RateLimitStrategy};
use crate::rate_limiter::RateLimiterOptions;
use crate::throttler::ThrottlerSettings;
use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Process configuration. Every option can also be set through the
/// environment (or a `.env` file).
#[derive(Debug, Clone, Parser)]
#[command(name = "throttler", version, about = "Distributed rate limiting service")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; empty selects the in-process store
    #[arg(long, env = "REDIS_URL", default_value = "")]
    pub redis_url: String,

    /// token-bucket, sliding-window or fixed-window
    #[arg(long, env = "RATE_LIMIT_STRATEGY", default_value = "token-bucket")]
    pub strategy: RateLimitStrategy,

    #[arg(long, env = "RATE_LIMIT_KEY_PREFIX", default_value = "ratelimit")]
    pub key_prefix: String,

    #[arg(long, env = "DEFAULT_LIMIT", default_value_t = 100)]
    pub default_limit: u64,

    #[arg(long, env = "DEFAULT_WINDOW_SECS", default_value_t = 60)]
    pub default_window_secs: u64,

    #[arg(long, env = "DEFAULT_BURST", default_value_t = 0)]
    pub default_burst: u64,

    /// Per-call store timeout; slower calls fail open
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 50)]
    pub store_timeout_ms: u64,

    /// Trust X-Real-IP / X-Forwarded-For
    #[arg(long, env = "TRUST_PROXY")]
    pub trust_proxy: bool,

    /// Comma-separated IPs that are never limited
    #[arg(long, env = "WHITELIST_IPS", value_delimiter = ',')]
    pub whitelist_ips: Vec<IpAddr>,

    #[arg(long, env = "WARNING_THRESHOLD", default_value_t = 0.2)]
    pub warning_threshold: f64,

    /// JSON file with tiers, unlimited endpoints and cost rules
    #[arg(long, env = "POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from the command line and environment
    pub fn from_env() -> std::result::Result<Self, clap::Error> {
        Config::try_parse()
    }

    pub fn limiter_options(&self) -> RateLimiterOptions {
        RateLimiterOptions {
            strategy: self.strategy,
            key_prefix: self.key_prefix.clone(),
            default_limit: self.default_limit,
            default_window: Duration::from_secs(self.default_window_secs),
            default_burst: self.default_burst,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
        }
    }

    pub fn throttler_settings(&self) -> ThrottlerSettings {
        ThrottlerSettings {
            trust_proxy: self.trust_proxy,
            warning_threshold: self.warning_threshold,
        }
    }

    /// Policy from `POLICY_FILE`, or the built-in tiers.
    pub fn load_policy(&self) -> Result<RateLimitConfig> {
        match &self.policy_file {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    ThrottlerError::Configuration(format!(
                        "Failed to read policy file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                RateLimitConfig::from_json(&json)
            }
            None => Ok(RateLimitConfig::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_redis_url(&self.redis_url)?;
        ConfigValidator::validate_bind_address(&self.bind_addr.to_string())?;
        ConfigValidator::validate_rate_limit(self.default_limit, self.default_window_secs)?;
        ConfigValidator::validate_warning_threshold(self.warning_threshold)?;
        ConfigValidator::validate_key_prefix(&self.key_prefix)?;
        if self.store_timeout_ms == 0 {
            return Err(ThrottlerError::ValidationError(
                "Store timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
