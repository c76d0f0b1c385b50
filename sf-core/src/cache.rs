//! TTL reading cache
//!
//! Per-key memoisation of hardware readings. Entries expire after a fixed
//! lifetime and the map is bounded; time comes from `tokio::time::Instant` so
//! tests can pause and advance the clock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// A value and the time it was stored.
#[derive(Debug, Clone)]
pub struct CachedValue<T> {
    pub value: T,
    pub timestamp: Instant,
    pub ttl: Duration,
}

impl<T> CachedValue<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            timestamp: Instant::now(),
            ttl,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.timestamp.elapsed() < self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CachedValue<V>>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached value if still valid; counts a hit or a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_valid() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        entries.insert(key, CachedValue::new(value, self.ttl));
        if entries.len() > self.max_entries {
            Self::evict(&mut entries, self.max_entries);
        }
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries, then the oldest until within the bound.
    /// Returns how many entries were removed.
    pub fn purge(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        Self::evict(&mut entries, self.max_entries);
        before - entries.len()
    }

    fn evict(entries: &mut HashMap<K, CachedValue<V>>, max_entries: usize) {
        entries.retain(|_, e| e.is_valid());

        if entries.len() > max_entries {
            let mut by_age: Vec<(K, Instant)> =
                entries.iter().map(|(k, e)| (k.clone(), e.timestamp)).collect();
            by_age.sort_by_key(|(_, ts)| *ts);
            let excess = entries.len() - max_entries;
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache: TtlCache<String, f64> = TtlCache::new(Duration::from_secs(1), 10);
        cache.insert("TC0P".into(), 45.0);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(cache.get(&"TC0P".to_string()), Some(45.0));

        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(cache.get(&"TC0P".to_string()), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oldest_evicted_over_bound() {
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::from_secs(60), 3);
        for i in 0..4u8 {
            cache.insert(i, i);
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&0), None);
        assert_eq!(cache.get(&3), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_removes_expired() {
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::from_secs(1), 10);
        cache.insert(1, 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.insert(2, 2);
        assert_eq!(cache.purge(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate() {
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::from_secs(60), 10);
        cache.insert(0, 42);
        cache.invalidate(&0);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hit_rate(), 0.0);
    }
}
