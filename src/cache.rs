// =============================================================================
// Query Cache — bounded LRU over backing-store query results
// =============================================================================
//
// One cache instance is shared by every poll cycle. A hit on behalf of one
// connection benefits every other connection subscribed to the same
// (ticker, resolution, window_start) key, which is what keeps the backing
// store from being hammered once subscription overlap builds up.
//
// Thread safety:
//   - A single parking_lot::Mutex guards the map plus the recency list, so
//     get/put (including the per-entry hit counter) are one atomic step.
//   - Global hit/miss counters are lock-free atomics, mirroring the
//     rate-limit tracker pattern: any thread may read them for the metrics
//     surface without touching the map lock.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::types::{Resolution, SentimentItem};

/// Identifies one cached query result.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CacheKey {
    pub ticker: String,
    pub resolution: Resolution,
    pub window_start: i64,
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.ticker, self.resolution, self.window_start)
    }
}

/// The last-known result for a key, with freshness metadata.
#[derive(Debug, Clone)]
pub struct CachedResult {
    /// Items covering the key's window and its predecessor, oldest-first.
    pub items: Vec<SentimentItem>,
    /// The `since` bound of the query that produced `items`: every stored
    /// item with a timestamp past this is present. A reader needing an
    /// earlier bound must not treat this entry as a hit.
    pub covers_since: i64,
    /// Epoch milliseconds at which the backing-store query completed.
    pub computed_at: i64,
    /// How many times this particular entry has been served.
    pub hit_count: u64,
}

struct CacheInner {
    entries: HashMap<CacheKey, CachedResult>,
    /// Keys ordered least- to most-recently used. Front is the eviction
    /// candidate.
    recency: VecDeque<CacheKey>,
}

impl CacheInner {
    /// Move `key` to the most-recently-used position.
    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_back(key.clone());
    }
}

/// Bounded, shared, in-memory cache of backing-store query results.
pub struct QueryCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Immutable snapshot of the cache counters (suitable for serialisation
/// into the metrics payload).
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses); 0.0 before any lookup.
    pub hit_rate: f64,
}

impl QueryCache {
    /// Create a cache that retains at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity),
                recency: VecDeque::with_capacity(capacity),
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up `key`. A hit bumps the entry to most-recently-used and
    /// increments both the entry's and the global hit counters; a miss only
    /// increments the global miss counter.
    pub fn get(&self, key: &CacheKey) -> Option<CachedResult> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.hit_count += 1;
                let result = entry.clone();
                inner.touch(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace the entry for `key`, evicting the least-recently
    /// used entry when at capacity.
    pub fn put(&self, key: CacheKey, items: Vec<SentimentItem>, covers_since: i64, computed_at: i64) {
        let mut inner = self.inner.lock();

        if inner.entries.contains_key(&key) {
            // Refresh in place, preserving the entry's hit count.
            let hit_count = inner.entries[&key].hit_count;
            inner.entries.insert(
                key.clone(),
                CachedResult {
                    items,
                    covers_since,
                    computed_at,
                    hit_count,
                },
            );
            inner.touch(&key);
            return;
        }

        while inner.entries.len() >= self.capacity {
            if let Some(victim) = inner.recency.pop_front() {
                inner.entries.remove(&victim);
                debug!(key = %victim, "cache entry evicted (LRU)");
            } else {
                break;
            }
        }

        inner.entries.insert(
            key.clone(),
            CachedResult {
                items,
                covers_since,
                computed_at,
                hit_count: 0,
            },
        );
        inner.recency.push_back(key);
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produce a serialisable snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn key(ticker: &str, ws: i64) -> CacheKey {
        CacheKey {
            ticker: ticker.into(),
            resolution: Resolution::FiveMinutes,
            window_start: ws,
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = QueryCache::new(4);
        let k = key("AAPL", 0);

        assert!(cache.get(&k).is_none());
        cache.put(k.clone(), Vec::new(), 0, 1_000);

        let entry = cache.get(&k).expect("should hit after put");
        assert_eq!(entry.computed_at, 1_000);
        assert_eq!(entry.hit_count, 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn capacity_never_exceeded_and_lru_evicted() {
        let cache = QueryCache::new(3);
        for i in 0..3 {
            cache.put(key("T", i), Vec::new(), 0, i);
        }
        assert_eq!(cache.len(), 3);

        // Touch key 0 so key 1 becomes the LRU victim.
        assert!(cache.get(&key("T", 0)).is_some());

        cache.put(key("T", 99), Vec::new(), 0, 99);
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&key("T", 1)).is_none(), "LRU entry must be gone");
        assert!(cache.get(&key("T", 0)).is_some());
        assert!(cache.get(&key("T", 2)).is_some());
        assert!(cache.get(&key("T", 99)).is_some());
    }

    #[test]
    fn put_existing_key_refreshes_without_eviction() {
        let cache = QueryCache::new(2);
        cache.put(key("T", 0), Vec::new(), 0, 1);
        cache.put(key("T", 1), Vec::new(), 0, 1);

        // Re-putting an existing key at capacity must not evict anything.
        cache.put(key("T", 0), Vec::new(), 0, 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("T", 0)).unwrap().computed_at, 2);
        assert!(cache.get(&key("T", 1)).is_some());
    }

    #[test]
    fn concurrent_hits_do_not_double_count() {
        use std::sync::Arc;

        let cache = Arc::new(QueryCache::new(8));
        cache.put(key("AAPL", 0), Vec::new(), 0, 1);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = cache.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    c.get(&key("AAPL", 0));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.hits, 800);
        assert_eq!(stats.misses, 0);
        assert_eq!(cache.get(&key("AAPL", 0)).unwrap().hit_count, 801);
    }
}
