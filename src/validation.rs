use crate::algorithms::{LimitOptions, MAX_COST};
use crate::error::ThrottlerError;
use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

const MAX_IDENTIFIER_LEN: usize = 256;

/// Body of `POST /rate-limit/:identifier/check`.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct CheckRequest {
    #[validate(range(min = 1))]
    pub limit: Option<u64>,
    #[validate(range(min = 1))]
    pub window_secs: Option<u64>,
    pub burst: Option<u64>,
    #[validate(range(max = MAX_COST))]
    pub cost: Option<u64>,
}

impl CheckRequest {
    pub fn to_options(&self) -> LimitOptions {
        LimitOptions {
            limit: self.limit,
            window: self.window_secs.map(Duration::from_secs),
            burst: self.burst,
            cost: self.cost,
        }
    }
}

/// Query of `GET /rate-limit/:identifier`. Carries the limits the
/// identifier is checked against so usage is read under the same parameters.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct UsageQuery {
    #[validate(range(min = 1))]
    pub limit: Option<u64>,
    #[validate(range(min = 1))]
    pub window_secs: Option<u64>,
    pub burst: Option<u64>,
}

impl UsageQuery {
    pub fn to_options(&self) -> LimitOptions {
        LimitOptions {
            limit: self.limit,
            window: self.window_secs.map(Duration::from_secs),
            burst: self.burst,
            cost: None,
        }
    }
}

/// Body of `PUT /blocklist/:target`.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct BlockRequest {
    #[validate(range(min = 1))]
    pub ttl_secs: Option<u64>,
}

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Validates a limiter identifier or blocklist target taken from the path.
    pub fn validate_identifier(identifier: &str) -> Result<(), ThrottlerError> {
        let identifier = identifier.trim();

        if identifier.is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Identifier cannot be empty".to_string(),
            ));
        }

        if identifier.len() > MAX_IDENTIFIER_LEN {
            return Err(ThrottlerError::ValidationError(format!(
                "Identifier cannot be longer than {} characters",
                MAX_IDENTIFIER_LEN
            )));
        }

        if !identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '-' | '@'))
        {
            return Err(ThrottlerError::ValidationError(
                "Identifier can only contain alphanumeric characters and ':', '.', '_', '-', '@'"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_check_request(body: &CheckRequest) -> Result<LimitOptions, ThrottlerError> {
        body.validate()?;
        Ok(body.to_options())
    }

    pub fn validate_usage_query(query: &UsageQuery) -> Result<LimitOptions, ThrottlerError> {
        query.validate()?;
        Ok(query.to_options())
    }
}
