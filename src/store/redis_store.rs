//! Redis-backed counter store.
//!
//! Each algorithm runs as a Lua script so the read-compute-write sequence is
//! atomic across every process sharing the server. The connection is opened
//! by `connect` at startup or by a background task with backoff, never inside
//! a per-call timeout.

use super::{is_window_key, CounterStore};
use crate::algorithms::fixed_window::WindowOutcome;
use crate::algorithms::sliding_window::LogOutcome;
use crate::algorithms::token_bucket::BucketOutcome;
use crate::algorithms::LimitParams;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local capacity = limit + tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])
local rate = limit / window_ms

local state = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = math.min(limit, capacity)
else
  local elapsed = math.max(0, now - last)
  tokens = math.max(0, math.min(capacity, tokens + elapsed * rate))
end

local allowed = 0
if tokens >= cost then
  allowed = 1
  tokens = tokens - cost
  if cost > 0 then
    redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill_ms', now)
    redis.call('PEXPIRE', key, ttl)
  end
end
return {allowed, tostring(tokens)}
"#;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local cost = #ARGV - 4

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window_ms))
local count = redis.call('ZCARD', key)

local allowed = 0
if count + cost <= limit then
  allowed = 1
  for i = 5, #ARGV do
    redis.call('ZADD', key, now, ARGV[i])
  end
  count = count + cost
  if cost > 0 then
    redis.call('PEXPIRE', key, ttl)
  end
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ms = -1
if #oldest > 0 then
  oldest_ms = tonumber(oldest[2])
end
return {allowed, count, oldest_ms}
"#;

const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local cost = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

if cost == 0 then
  local current = tonumber(redis.call('GET', key) or '0')
  if current <= limit then
    return {1, current}
  end
  return {0, current}
end

local current = redis.call('INCRBY', key, cost)
if current == cost then
  redis.call('PEXPIRE', key, ttl)
end
if current > limit then
  current = redis.call('DECRBY', key, cost)
  return {0, current}
end
return {1, current}
"#;

pub struct RedisStore {
    client: Client,
    connection: Arc<RwLock<Option<ConnectionManager>>>,
    connecting: Arc<AtomicBool>,
    token_bucket: Script,
    sliding_window: Script,
    fixed_window: Script,
}

impl RedisStore {
    /// Parses the URL only. No connection is made until `connect` or the
    /// first call.
    pub fn new(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis client: {}", e))
        })?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
            connecting: Arc::new(AtomicBool::new(false)),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
        })
    }

    /// The cached connection. Until one exists, a background task keeps
    /// connecting and calls fail immediately with `Unavailable`.
    async fn connection(&self) -> StoreResult<ConnectionManager> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        self.spawn_connect();
        Err(StoreError::Unavailable(
            "Redis connection is not established yet".to_string(),
        ))
    }

    fn spawn_connect(&self) {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let client = self.client.clone();
        let slot = self.connection.clone();
        let connecting = self.connecting.clone();

        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                match ConnectionManager::new(client.clone()).await {
                    Ok(conn) => {
                        *slot.write().await = Some(conn);
                        connecting.store(false, Ordering::SeqCst);
                        info!("Connected to Redis counter store");
                        return;
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            retry_in_ms = backoff.as_millis() as u64,
                            "Failed to connect to Redis"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });
    }
}

/// Escape glob metacharacters so a key prefix matches literally in SCAN.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn token_bucket(
        &self,
        key: &str,
        params: &LimitParams,
        now_ms: u64,
        ttl_ms: u64,
    ) -> StoreResult<BucketOutcome> {
        let mut conn = self.connection().await?;
        let (allowed, tokens): (i64, String) = self
            .token_bucket
            .key(key)
            .arg(params.limit)
            .arg(params.burst)
            .arg(params.window_ms())
            .arg(params.cost)
            .arg(now_ms)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        let tokens = tokens.parse::<f64>().map_err(|e| {
            StoreError::Unavailable(format!("Malformed token count '{}': {}", tokens, e))
        })?;

        Ok(BucketOutcome {
            allowed: allowed == 1,
            tokens,
        })
    }

    async fn sliding_window(
        &self,
        key: &str,
        params: &LimitParams,
        now_ms: u64,
        tags: &[String],
        ttl_ms: u64,
    ) -> StoreResult<LogOutcome> {
        let mut conn = self.connection().await?;
        let mut invocation = self.sliding_window.key(key);
        invocation
            .arg(params.limit)
            .arg(params.window_ms())
            .arg(now_ms)
            .arg(ttl_ms);
        for tag in tags {
            invocation.arg(tag);
        }

        let (allowed, count, oldest): (i64, u64, i64) = invocation.invoke_async(&mut conn).await?;

        Ok(LogOutcome {
            allowed: allowed == 1,
            count,
            oldest_ms: u64::try_from(oldest).ok(),
        })
    }

    async fn fixed_window(
        &self,
        key: &str,
        params: &LimitParams,
        ttl_ms: u64,
    ) -> StoreResult<WindowOutcome> {
        let mut conn = self.connection().await?;
        let (allowed, count): (i64, u64) = self
            .fixed_window
            .key(key)
            .arg(params.limit)
            .arg(params.cost)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowOutcome {
            allowed: allowed == 1,
            count,
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let deleted: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(deleted)
    }

    async fn delete_windows(&self, prefix: &str) -> StoreResult<u64> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let (next, mut keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            keys.retain(|key| is_window_key(key, prefix));
            if !keys.is_empty() {
                let removed: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                deleted += removed;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, deleted, "deleted window keys");
        Ok(deleted)
    }

    async fn connect(&self) -> StoreResult<()> {
        if self.connection.read().await.is_some() {
            return Ok(());
        }
        let conn = ConnectionManager::new(self.client.clone()).await?;
        *self.connection.write().await = Some(conn);
        info!("Connected to Redis counter store");
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::sliding_window::entry_tags;
    use crate::store::with_timeout;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn params(limit: u64, cost: u64) -> LimitParams {
        LimitParams {
            limit,
            window: Duration::from_secs(60),
            burst: 0,
            cost,
        }
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("rl:fw:ip:1:"), "rl:fw:ip:1:");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[tokio::test]
    async fn test_calls_fail_fast_while_connecting() {
        let store = RedisStore::new("redis://127.0.0.1:1").unwrap();

        for _ in 0..3 {
            let result = with_timeout(Duration::from_millis(50), store.ping()).await;
            assert!(matches!(result, Err(StoreError::Unavailable(_))));
        }
        assert!(store.connecting.load(Ordering::SeqCst));
        assert!(store.connection.read().await.is_none());
    }

    #[test]
    fn test_new_rejects_bad_url_without_connecting() {
        assert!(RedisStore::new("not a url").is_err());
        assert!(RedisStore::new("redis://127.0.0.1:1").is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_fixed_window_script_rolls_back() {
        let store = RedisStore::new(&redis_url()).unwrap();
        store.connect().await.unwrap();
        let key = format!("test:fw:{}", uuid::Uuid::new_v4());
        let p = params(2, 1);

        assert!(store.fixed_window(&key, &p, 60_000).await.unwrap().allowed);
        assert!(store.fixed_window(&key, &p, 60_000).await.unwrap().allowed);
        let denied = store.fixed_window(&key, &p, 60_000).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 2);
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("2"));

        store.delete(&[key]).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_sliding_window_script_counts_entries() {
        let store = RedisStore::new(&redis_url()).unwrap();
        store.connect().await.unwrap();
        let key = format!("test:sw:{}", uuid::Uuid::new_v4());
        let p = params(3, 2);

        let first = store
            .sliding_window(&key, &p, 1_000, &entry_tags(1_000, 2), 120_000)
            .await
            .unwrap();
        assert!(first.allowed);
        assert_eq!(first.count, 2);
        assert_eq!(first.oldest_ms, Some(1_000));

        let second = store
            .sliding_window(&key, &p, 1_001, &entry_tags(1_001, 2), 120_000)
            .await
            .unwrap();
        assert!(!second.allowed);
        assert_eq!(second.count, 2);

        store.delete(&[key]).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_token_bucket_script_matches_in_memory_math() {
        let store = RedisStore::new(&redis_url()).unwrap();
        store.connect().await.unwrap();
        let key = format!("test:tb:{}", uuid::Uuid::new_v4());
        let p = params(10, 1);

        let outcome = store.token_bucket(&key, &p, 0, 120_000).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.tokens, 9.0);

        store.delete(&[key]).await.unwrap();
    }
}
