pub mod algorithms;
pub mod api_keys;
pub mod blocklist;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod identifier;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod store;
pub mod throttler;
pub mod validation;

pub use algorithms::{LimitOptions, RateLimitDecision};
pub use config::Config;
pub use error::{Result, StoreError, ThrottlerError};
pub use rate_limit_config::RateLimitStrategy;
pub use rate_limiter::{RateLimiter, RateLimiterOptions};
pub use server::create_app;
pub use throttler::{Admission, Throttler};
