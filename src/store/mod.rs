//! Shared counter store
//!
//! The store is the only place limiter state lives. Each algorithm's
//! read-compute-write sequence is exposed as a single method so a backend can
//! run it atomically: Redis through a Lua script, the in-memory store under
//! its mutex.

pub mod memory;
pub mod redis_store;

use crate::algorithms::fixed_window::WindowOutcome;
use crate::algorithms::sliding_window::LogOutcome;
use crate::algorithms::token_bucket::BucketOutcome;
use crate::algorithms::LimitParams;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Refill, compare and (when allowed with a non-zero cost) persist a bucket.
    async fn token_bucket(
        &self,
        key: &str,
        params: &LimitParams,
        now_ms: u64,
        ttl_ms: u64,
    ) -> StoreResult<BucketOutcome>;

    /// Prune, count and insert one entry per tag when they all fit.
    async fn sliding_window(
        &self,
        key: &str,
        params: &LimitParams,
        now_ms: u64,
        tags: &[String],
        ttl_ms: u64,
    ) -> StoreResult<LogOutcome>;

    /// Increment by `params.cost`, rolling back when the limit is exceeded.
    /// A zero cost reads the counter without creating it.
    async fn fixed_window(
        &self,
        key: &str,
        params: &LimitParams,
        ttl_ms: u64,
    ) -> StoreResult<WindowOutcome>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Returns the number of keys removed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// Remove every key that is `prefix` followed by a numeric window id.
    async fn delete_windows(&self, prefix: &str) -> StoreResult<u64>;

    /// Open backing connections ahead of the first call. Runs without the
    /// per-call timeout.
    async fn connect(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// True when `key` is `prefix` followed by digits only. Identifiers may
/// themselves contain `:`, so a bare prefix match would also hit longer
/// identifiers that share it.
pub fn is_window_key(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Bound a store call. An elapsed timer becomes [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}
