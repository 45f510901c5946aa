//! Sliding window log algorithm
//!
//! Keeps one uniquely tagged entry per consumed unit inside a trailing
//! window. Gives the strictest bound of the three algorithms at the cost of
//! O(window) storage per key and pruning work on every call.

use super::{LimitParams, RateLimitAlgorithm, RateLimitDecision, RateLimitKey};
use crate::error::StoreResult;
use crate::rate_limit_config::RateLimitStrategy;
use crate::store::CounterStore;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// `(timestamp_ms, tag)`; ordered by time, unique by tag.
pub type LogEntry = (u64, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOutcome {
    pub allowed: bool,
    /// Entries in the window after the decision.
    pub count: u64,
    pub oldest_ms: Option<u64>,
}

/// Lowest timestamp still inside the window; older entries are pruned.
pub fn window_start(params: &LimitParams, now_ms: u64) -> u64 {
    now_ms.saturating_sub(params.window_ms())
}

/// Prune, count and (when the cost fits) insert one entry per tag.
pub fn admit(
    log: &mut BTreeSet<LogEntry>,
    params: &LimitParams,
    now_ms: u64,
    tags: &[String],
) -> LogOutcome {
    let cutoff = window_start(params, now_ms);
    log.retain(|(ts, _)| *ts >= cutoff);

    let count = log.len() as u64;
    let cost = tags.len() as u64;
    let allowed = count + cost <= params.limit;

    if allowed {
        for tag in tags {
            log.insert((now_ms, tag.clone()));
        }
    }

    LogOutcome {
        allowed,
        count: log.len() as u64,
        oldest_ms: log.iter().next().map(|(ts, _)| *ts),
    }
}

/// Tags that keep same-millisecond entries distinct.
pub fn entry_tags(now_ms: u64, cost: u64) -> Vec<String> {
    (0..cost)
        .map(|_| format!("{}-{}", now_ms, Uuid::new_v4().simple()))
        .collect()
}

/// Sliding window log limiter backed by a shared [`CounterStore`].
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    key_prefix: String,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, key_prefix: &str) -> Self {
        Self {
            store,
            key_prefix: key_prefix.to_string(),
        }
    }

    pub fn store_key(&self, identifier: &str) -> String {
        RateLimitKey::new(RateLimitStrategy::SlidingWindow.namespace(), identifier)
            .to_store_key(&self.key_prefix)
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowLimiter {
    fn strategy(&self) -> RateLimitStrategy {
        RateLimitStrategy::SlidingWindow
    }

    async fn check_and_consume(
        &self,
        identifier: &str,
        params: &LimitParams,
        now_ms: u64,
    ) -> StoreResult<RateLimitDecision> {
        let key = self.store_key(identifier);
        // A cost above the limit can never fit; read the log without tagging.
        let oversized = params.cost > params.limit;
        let tags = if oversized {
            Vec::new()
        } else {
            entry_tags(now_ms, params.cost)
        };
        let mut outcome = self
            .store
            .sliding_window(&key, params, now_ms, &tags, params.ttl_ms())
            .await?;
        if oversized {
            outcome.allowed = false;
        }

        let reset_at = outcome
            .oldest_ms
            .unwrap_or(now_ms)
            .saturating_add(params.window_ms());
        let remaining = params.limit.saturating_sub(outcome.count) as f64;

        debug!(
            key = %key,
            allowed = outcome.allowed,
            count = outcome.count,
            cost = params.cost,
            "sliding window decision"
        );

        Ok(if outcome.allowed {
            RateLimitDecision::allowed(params.limit, remaining, reset_at, params.cost)
        } else {
            RateLimitDecision::denied(params.limit, remaining, reset_at, params.cost)
        })
    }

    async fn reset(&self, identifier: &str) -> StoreResult<()> {
        self.store.delete(&[self.store_key(identifier)]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::time::{Duration, Instant};

    fn params(limit: u64, window_secs: u64) -> LimitParams {
        LimitParams {
            limit,
            window: Duration::from_secs(window_secs),
            burst: 0,
            cost: 1,
        }
    }

    #[test]
    fn test_tags_are_unique_within_a_millisecond() {
        let tags = entry_tags(1_000, 5);
        let unique: BTreeSet<_> = tags.iter().collect();
        assert_eq!(unique.len(), 5);
        assert!(tags.iter().all(|t| t.starts_with("1000-")));
    }

    #[test]
    fn test_admit_prunes_entries_older_than_window() {
        let p = params(3, 10);
        let mut log = BTreeSet::new();

        for _ in 0..3 {
            assert!(admit(&mut log, &p, 0, &entry_tags(0, 1)).allowed);
        }
        let denied = admit(&mut log, &p, 5_000, &entry_tags(5_000, 1));
        assert!(!denied.allowed);
        assert_eq!(denied.count, 3);

        let later = admit(&mut log, &p, 11_000, &entry_tags(11_000, 1));
        assert!(later.allowed);
        assert_eq!(later.count, 1);
        assert_eq!(later.oldest_ms, Some(11_000));
    }

    #[test]
    fn test_entry_exactly_at_window_edge_is_kept() {
        let p = params(1, 10);
        let mut log = BTreeSet::new();
        assert!(admit(&mut log, &p, 0, &entry_tags(0, 1)).allowed);
        assert!(!admit(&mut log, &p, 10_000, &entry_tags(10_000, 1)).allowed);
        assert!(admit(&mut log, &p, 10_001, &entry_tags(10_001, 1)).allowed);
    }

    #[test]
    fn test_multi_cost_is_all_or_nothing() {
        let p = params(5, 60);
        let mut log = BTreeSet::new();
        assert!(admit(&mut log, &p, 0, &entry_tags(0, 3)).allowed);

        let outcome = admit(&mut log, &p, 1, &entry_tags(1, 3));
        assert!(!outcome.allowed);
        assert_eq!(outcome.count, 3);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_zero_cost_inserts_nothing() {
        let p = params(2, 60);
        let mut log = BTreeSet::new();
        admit(&mut log, &p, 0, &entry_tags(0, 2));

        let peek = admit(&mut log, &p, 10, &[]);
        assert!(peek.allowed);
        assert_eq!(peek.count, 2);
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_cost_above_limit_is_denied_without_tagging() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = SlidingWindowLimiter::new(store.clone(), "rl");
        let p = LimitParams {
            cost: u64::MAX,
            ..params(10, 60)
        };

        let started = Instant::now();
        let decision = limiter.check_and_consume("ip:1.2.3.4", &p, 1_000).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!decision.allowed);
        assert_eq!(decision.remaining_whole(), 10);
        assert!(store.is_empty().await);

        let ok = limiter
            .check_and_consume("ip:1.2.3.4", &params(10, 60), 1_000)
            .await
            .unwrap();
        assert!(ok.allowed);
        assert_eq!(ok.remaining_whole(), 9);
    }
}
