//! In-memory counter store for development, tests and single-instance
//! deployments. State is not shared between processes.

use super::{is_window_key, CounterStore};
use crate::algorithms::fixed_window::{self, WindowOutcome};
use crate::algorithms::sliding_window::{self, LogEntry, LogOutcome};
use crate::algorithms::token_bucket::{self, BucketOutcome, TokenBucketState};
use crate::algorithms::LimitParams;
use crate::clock::{system_clock, SharedClock};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Counter(u64),
    Bucket(TokenBucketState),
    Log(BTreeSet<LogEntry>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms < at)
    }
}

/// Map size at which the first expiry sweep runs.
const MIN_SWEEP_WATERMARK: usize = 1024;

pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: SharedClock,
    available: AtomicBool,
    /// Next map size that triggers a sweep of expired entries.
    sweep_watermark: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Expiry is evaluated against `clock`, so tests can age entries.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
            sweep_watermark: AtomicUsize::new(MIN_SWEEP_WATERMARK),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current fixed-window counter value, if the key is live.
    pub async fn counter(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(Entry {
                value: Value::Counter(n),
                expires_at_ms,
            }) if expires_at_ms.map_or(true, |at| now < at) => Some(*n),
            _ => None,
        }
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = self.clock.now_ms();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }

    /// Insert `entry`, first dropping every expired key once the map has
    /// grown past the watermark. The watermark then moves to twice the live
    /// size, so the sweep cost is amortised over the inserts.
    fn insert(&self, entries: &mut HashMap<String, Entry>, key: &str, entry: Entry, now_ms: u64) {
        if !entries.contains_key(key)
            && entries.len() >= self.sweep_watermark.load(Ordering::Relaxed)
        {
            let before = entries.len();
            entries.retain(|_, e| e.is_live(now_ms));
            let next = entries.len().saturating_mul(2).max(MIN_SWEEP_WATERMARK);
            self.sweep_watermark.store(next, Ordering::Relaxed);
            debug!(
                swept = before - entries.len(),
                live = entries.len(),
                "swept expired entries"
            );
        }
        entries.insert(key.to_string(), entry);
    }

    /// Drop the entry at `key` if it has expired and return what is left.
    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now_ms: u64) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| !e.is_live(now_ms)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn token_bucket(
        &self,
        key: &str,
        params: &LimitParams,
        now_ms: u64,
        ttl_ms: u64,
    ) -> StoreResult<BucketOutcome> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut entries = self.entries.lock().await;

        let state = match Self::live(&mut entries, key, clock_now) {
            Some(Entry {
                value: Value::Bucket(state),
                ..
            }) => Some(*state),
            _ => None,
        };

        let (outcome, write) = token_bucket::take(state, params, now_ms);
        if let Some(state) = write {
            let entry = Entry {
                value: Value::Bucket(state),
                expires_at_ms: Some(clock_now.saturating_add(ttl_ms)),
            };
            self.insert(&mut entries, key, entry, clock_now);
        }
        Ok(outcome)
    }

    async fn sliding_window(
        &self,
        key: &str,
        params: &LimitParams,
        now_ms: u64,
        tags: &[String],
        ttl_ms: u64,
    ) -> StoreResult<LogOutcome> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut entries = self.entries.lock().await;

        let mut log = match Self::live(&mut entries, key, clock_now) {
            Some(Entry {
                value: Value::Log(log),
                ..
            }) => std::mem::take(log),
            _ => BTreeSet::new(),
        };

        let outcome = sliding_window::admit(&mut log, params, now_ms, tags);

        if log.is_empty() {
            entries.remove(key);
        } else {
            let expires_at_ms = if outcome.allowed && !tags.is_empty() {
                Some(clock_now.saturating_add(ttl_ms))
            } else {
                entries
                    .get(key)
                    .and_then(|e| e.expires_at_ms)
                    .or(Some(clock_now.saturating_add(ttl_ms)))
            };
            let entry = Entry {
                value: Value::Log(log),
                expires_at_ms,
            };
            self.insert(&mut entries, key, entry, clock_now);
        }
        Ok(outcome)
    }

    async fn fixed_window(
        &self,
        key: &str,
        params: &LimitParams,
        ttl_ms: u64,
    ) -> StoreResult<WindowOutcome> {
        self.check_available()?;
        let clock_now = self.clock.now_ms();
        let mut entries = self.entries.lock().await;

        let existing = match Self::live(&mut entries, key, clock_now) {
            Some(Entry {
                value: Value::Counter(n),
                expires_at_ms,
            }) => Some((*n, *expires_at_ms)),
            _ => None,
        };

        if params.cost == 0 {
            let count = existing.map_or(0, |(n, _)| n);
            return Ok(WindowOutcome {
                allowed: count <= params.limit,
                count,
            });
        }

        let (mut counter, expires_at_ms) = match existing {
            Some((n, expires)) => (n, expires),
            None => (0, Some(clock_now.saturating_add(ttl_ms))),
        };
        let outcome = fixed_window::increment(&mut counter, params);
        if outcome.allowed {
            let entry = Entry {
                value: Value::Counter(counter),
                expires_at_ms,
            };
            self.insert(&mut entries, key, entry, clock_now);
        }
        Ok(outcome)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().await;
        Ok(match Self::live(&mut entries, key, now).map(|e| &e.value) {
            Some(Value::Text(s)) => Some(s.clone()),
            Some(Value::Counter(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().await;
        let entry = Entry {
            value: Value::Text(value.to_string()),
            expires_at_ms: ttl.map(|ttl| now.saturating_add(ttl.as_millis() as u64)),
        };
        self.insert(&mut entries, key, entry, now);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let removed = keys.iter().filter(|k| entries.remove(*k).is_some()).count();
        Ok(removed as u64)
    }

    async fn delete_windows(&self, prefix: &str) -> StoreResult<u64> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| !is_window_key(key, prefix));
        let removed = (before - entries.len()) as u64;
        debug!(prefix = %prefix, removed, "deleted matching keys");
        Ok(removed)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
