use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use common::utils::config::AppConfig;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::{RetrievalResult, RetrievalStrategy};

/// Exact-match key: normalized question text, strategy and result count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    question: String,
    strategy: RetrievalStrategy,
    top_k: usize,
}

impl CacheKey {
    pub fn new(question: &str, strategy: RetrievalStrategy, top_k: usize) -> Self {
        Self {
            question: normalize_question(question),
            strategy,
            top_k,
        }
    }
}

/// Lowercases and collapses runs of whitespace.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
}

struct CacheEntry {
    result: RetrievalResult,
    inserted_at: Instant,
    generation: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Insertion order. Records whose generation no longer matches the entry are stale.
    order: VecDeque<(CacheKey, u64)>,
    next_generation: u64,
    /// Bumped by every clear.
    epoch: u64,
}

impl CacheState {
    fn is_current(&self, key: &CacheKey, generation: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
    }

    fn purge_expired_front(&mut self, ttl: Duration, now: Instant) {
        while let Some((key, generation)) = self.order.front() {
            let expired_or_stale = match self.entries.get(key) {
                Some(entry) if entry.generation == *generation => {
                    now.saturating_duration_since(entry.inserted_at) >= ttl
                }
                _ => true,
            };
            if !expired_or_stale {
                break;
            }
            if let Some((key, generation)) = self.order.pop_front() {
                if self.is_current(&key, generation) {
                    self.entries.remove(&key);
                }
            }
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((key, generation)) = self.order.pop_front() {
            if self.is_current(&key, generation) {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    fn compact_order(&mut self, limit: usize) {
        if self.order.len() <= limit {
            return;
        }
        let entries = &self.entries;
        self.order.retain(|(key, generation)| {
            entries
                .get(key)
                .is_some_and(|entry| entry.generation == *generation)
        });
    }
}

/// Bounded, time-expiring map from query keys to retrieval results.
///
/// Eviction follows insertion order, not access recency. A capacity of zero disables caching.
pub struct QueryCache {
    capacity: usize,
    ttl: Duration,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.cache_capacity,
            Duration::from_secs(config.cache_ttl_secs),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0 && !self.ttl.is_zero()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &CacheKey) -> Option<RetrievalResult> {
        if !self.is_enabled() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let now = Instant::now();
        let mut state = self.lock();
        let expired = state
            .entries
            .get(key)
            .map(|entry| now.saturating_duration_since(entry.inserted_at) >= self.ttl);
        let found = match expired {
            Some(false) => state.entries.get(key).map(|entry| entry.result.clone()),
            Some(true) => {
                // Lazily expire; the order record turns stale and is skipped later.
                state.entries.remove(key);
                None
            }
            None => None,
        };
        drop(state);

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Current invalidation epoch. Pair with [`QueryCache::put_since`].
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn put(&self, key: CacheKey, result: RetrievalResult) {
        if !self.is_enabled() {
            return;
        }
        let state = self.lock();
        self.insert(state, key, result);
    }

    /// Stores `result` only if no clear happened since `epoch` was read.
    ///
    /// Returns whether the entry was stored.
    pub fn put_since(&self, epoch: u64, key: CacheKey, result: RetrievalResult) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let state = self.lock();
        if state.epoch != epoch {
            debug!(
                computed_at = epoch,
                current = state.epoch,
                "Dropping result computed before the cache was cleared"
            );
            return false;
        }
        self.insert(state, key, result);
        true
    }

    fn insert(&self, mut state: MutexGuard<'_, CacheState>, key: CacheKey, result: RetrievalResult) {
        let now = Instant::now();
        state.purge_expired_front(self.ttl, now);

        let generation = state.next_generation;
        state.next_generation = generation.wrapping_add(1);
        state.entries.insert(
            key.clone(),
            CacheEntry {
                result,
                inserted_at: now,
                generation,
            },
        );
        state.order.push_back((key, generation));

        let mut evicted = 0usize;
        while state.entries.len() > self.capacity && state.evict_oldest() {
            evicted = evicted.saturating_add(1);
        }
        state.compact_order(self.capacity.saturating_mul(2));
        let entries = state.entries.len();
        drop(state);

        if evicted > 0 {
            debug!(evicted, entries, "Query cache evicted oldest entries");
        }
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
        state.epoch = state.epoch.wrapping_add(1);
    }

    /// Entries physically held, expired ones included until they are purged.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self.capacity,
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(strategy: RetrievalStrategy) -> RetrievalResult {
        RetrievalResult::empty(strategy)
    }

    fn key(question: &str) -> CacheKey {
        CacheKey::new(question, RetrievalStrategy::Hybrid, 5)
    }

    #[test]
    fn keys_normalize_question_text() {
        assert_eq!(key("  What IS   Rust? "), key("what is rust?"));
        assert_ne!(
            key("what is rust?"),
            CacheKey::new("what is rust?", RetrievalStrategy::Dense, 5)
        );
        assert_ne!(
            key("what is rust?"),
            CacheKey::new("what is rust?", RetrievalStrategy::Hybrid, 6)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn put_then_get_round_trips_until_ttl() {
        let cache = QueryCache::new(10, Duration::from_secs(300));
        let stored = result(RetrievalStrategy::Hybrid);
        cache.put(key("rust"), stored.clone());

        assert_eq!(cache.get(&key("rust")), Some(stored));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.get(&key("rust")).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(&key("rust")).is_none());
        assert_eq!(cache.len(), 0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn results_computed_before_a_clear_are_dropped() {
        let cache = QueryCache::new(10, Duration::from_secs(60));
        let before = cache.epoch();
        cache.clear();

        assert!(!cache.put_since(before, key("rust"), result(RetrievalStrategy::Hybrid)));
        assert!(cache.is_empty());

        let current = cache.epoch();
        assert!(cache.put_since(current, key("rust"), result(RetrievalStrategy::Hybrid)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn never_returns_a_different_key() {
        let cache = QueryCache::new(10, Duration::from_secs(60));
        cache.put(key("rust"), result(RetrievalStrategy::Hybrid));

        assert!(cache
            .get(&CacheKey::new("rust", RetrievalStrategy::Bm25, 5))
            .is_none());
        assert!(cache.get(&key("rust lang")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_oldest_insertion_first() {
        let cache = QueryCache::new(2, Duration::from_secs(60));
        cache.put(key("first"), result(RetrievalStrategy::Dense));
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put(key("second"), result(RetrievalStrategy::Bm25));

        // Reading does not refresh insertion order.
        assert!(cache.get(&key("first")).is_some());

        cache.put(key("third"), result(RetrievalStrategy::Hybrid));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("first")).is_none());
        assert!(cache.get(&key("second")).is_some());
        assert!(cache.get(&key("third")).is_some());
    }

    #[tokio::test]
    async fn reinsert_counts_as_newest() {
        let cache = QueryCache::new(2, Duration::from_secs(60));
        cache.put(key("a"), result(RetrievalStrategy::Dense));
        cache.put(key("b"), result(RetrievalStrategy::Dense));
        cache.put(key("a"), result(RetrievalStrategy::Bm25));
        cache.put(key("c"), result(RetrievalStrategy::Dense));

        assert!(cache.get(&key("b")).is_none());
        assert_eq!(
            cache.get(&key("a")).map(|r| r.strategy),
            Some(RetrievalStrategy::Bm25)
        );
        assert!(cache.get(&key("c")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_purged_before_evicting_live_ones() {
        let cache = QueryCache::new(2, Duration::from_secs(10));
        cache.put(key("old"), result(RetrievalStrategy::Dense));
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.put(key("recent"), result(RetrievalStrategy::Dense));
        tokio::time::advance(Duration::from_secs(3)).await;

        cache.put(key("new"), result(RetrievalStrategy::Dense));
        assert!(cache.get(&key("recent")).is_some());
        assert!(cache.get(&key("new")).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn zero_capacity_disables_caching() {
        let cache = QueryCache::new(0, Duration::from_secs(60));
        assert!(!cache.is_enabled());
        cache.put(key("rust"), result(RetrievalStrategy::Hybrid));
        assert!(cache.get(&key("rust")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let cache = QueryCache::new(4, Duration::from_secs(60));
        cache.put(key("a"), result(RetrievalStrategy::Dense));
        cache.put(key("b"), result(RetrievalStrategy::Dense));
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&key("a")).is_none());
    }
}
