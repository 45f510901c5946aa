//! Store-backed blocklist of IPs and identifiers.
//!
//! Entries live in the shared store under `{prefix}:block:{target}` so every
//! process sees the same list. An optional TTL lets blocks lapse on their own.

use crate::error::StoreResult;
use crate::store::{with_timeout, CounterStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct Blocklist {
    store: Arc<dyn CounterStore>,
    key_prefix: String,
    timeout: Duration,
}

impl Blocklist {
    pub fn new(store: Arc<dyn CounterStore>, key_prefix: &str, timeout: Duration) -> Self {
        Self {
            store,
            key_prefix: key_prefix.to_string(),
            timeout,
        }
    }

    fn key(&self, target: &str) -> String {
        format!("{}:block:{}", self.key_prefix, target)
    }

    /// True when any of `targets` is blocked.
    pub async fn is_blocked(&self, targets: &[&str]) -> StoreResult<bool> {
        for target in targets {
            let value = with_timeout(self.timeout, self.store.get(&self.key(target))).await?;
            if value.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn block(&self, target: &str, ttl: Option<Duration>) -> StoreResult<()> {
        with_timeout(self.timeout, self.store.set(&self.key(target), "1", ttl)).await?;
        info!(target_id = %target, ttl = ?ttl, "Blocked");
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub async fn unblock(&self, target: &str) -> StoreResult<bool> {
        let removed = with_timeout(self.timeout, self.store.delete(&[self.key(target)])).await?;
        info!(target_id = %target, removed, "Unblocked");
        Ok(removed > 0)
    }
}
