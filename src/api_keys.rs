//! API key lookup.
//!
//! Raw keys are never stored or logged; callers are matched on the sha256
//! hex digest of the `X-API-Key` header value.

use crate::error::StoreResult;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub use crate::rate_limit_config::ApiKeyRecord;

/// sha256 hex digest of a raw API key.
pub fn hash_api_key(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

/// Lookup of API key records by hash. Implemented by the identity subsystem.
#[async_trait]
pub trait ApiKeyValidator: Send + Sync {
    async fn lookup(&self, key_hash: &str) -> StoreResult<Option<ApiKeyRecord>>;
}

/// In-process validator seeded from the policy file. Records are fixed for
/// the life of the process.
pub struct StaticApiKeyValidator {
    records: HashMap<String, ApiKeyRecord>,
}

impl StaticApiKeyValidator {
    pub fn from_records(records: impl IntoIterator<Item = ApiKeyRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.hash.to_ascii_lowercase(), r))
            .collect();
        Self { records }
    }
}

#[async_trait]
impl ApiKeyValidator for StaticApiKeyValidator {
    async fn lookup(&self, key_hash: &str) -> StoreResult<Option<ApiKeyRecord>> {
        Ok(self.records.get(key_hash).cloned())
    }
}
