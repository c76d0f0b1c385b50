//! Performance Optimizer
//!
//! Tracks per-key access statistics, keeps the caches and the connection pool
//! trimmed, and turns the numbers into tuning hints.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheStats, TtlCache};
use crate::constants::optimizer::{HIGH_LATENCY, HIGH_POOL_UTILISATION, LOW_HIT_RATE};
use crate::pool::{PoolMetrics, PoolStats};

/// Counters for one key; monotonic for the life of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccessStat {
    pub total_accesses: u64,
    pub successful_accesses: u64,
    pub total_duration: Duration,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl AccessStat {
    pub fn average_latency(&self) -> Duration {
        if self.total_accesses == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.total_accesses as u32
        }
    }
}

/// A cache the optimizer can trim.
pub trait CacheMaintenance: Send + Sync {
    fn purge(&self) -> usize;
    fn cache_stats(&self) -> CacheStats;
}

impl<K, V> CacheMaintenance for TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn purge(&self) -> usize {
        TtlCache::purge(self)
    }

    fn cache_stats(&self) -> CacheStats {
        self.stats()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PerformanceSnapshot {
    pub total_accesses: u64,
    pub successful_accesses: u64,
    pub cache_hit_rate: f64,
    pub average_latency: Duration,
    pub cache_entries: usize,
    pub pool: Option<PoolStats>,
    pub keys: Vec<(String, AccessStat)>,
}

impl PerformanceSnapshot {
    pub fn pool_utilisation(&self) -> f64 {
        self.pool.map(|p| p.utilisation()).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Suggestion {
    IncreaseCacheTtl { hit_rate: f64 },
    EnlargePool { utilisation: f64 },
    ReducePolling { average_latency: Duration },
}

impl fmt::Display for Suggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncreaseCacheTtl { hit_rate } => write!(
                f,
                "cache hit rate is {:.0}%, consider a longer cache TTL",
                hit_rate * 100.0
            ),
            Self::EnlargePool { utilisation } => write!(
                f,
                "connection pool is {:.0}% utilised, consider more connections",
                utilisation * 100.0
            ),
            Self::ReducePolling { average_latency } => write!(
                f,
                "average latency is {} ms, consider polling less often",
                average_latency.as_millis()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub cache_evicted: usize,
    pub pool_closed: usize,
}

pub struct PerformanceOptimizer {
    stats: Mutex<HashMap<String, AccessStat>>,
    caches: Vec<Arc<dyn CacheMaintenance>>,
    pool: Option<Arc<dyn PoolMetrics>>,
    min_idle: usize,
    interval: Duration,
    running: AtomicBool,
    shutdown: Notify,
}

impl PerformanceOptimizer {
    pub fn new(
        caches: Vec<Arc<dyn CacheMaintenance>>,
        pool: Option<Arc<dyn PoolMetrics>>,
        min_idle: usize,
        interval: Duration,
    ) -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            caches,
            pool,
            min_idle,
            interval,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Record one backend call.
    pub fn record_access(&self, key: &str, duration: Duration, success: bool) {
        let mut stats = self.stats.lock();
        let stat = stats.entry(key.to_string()).or_default();
        stat.total_accesses += 1;
        stat.total_duration += duration;
        if success {
            stat.successful_accesses += 1;
        }
    }

    pub fn record_cache(&self, key: &str, hit: bool) {
        let mut stats = self.stats.lock();
        let stat = stats.entry(key.to_string()).or_default();
        if hit {
            stat.cache_hits += 1;
        } else {
            stat.cache_misses += 1;
        }
    }

    pub fn access_stat(&self, key: &str) -> Option<AccessStat> {
        self.stats.lock().get(key).copied()
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let stats = self.stats.lock();
        let mut snap = PerformanceSnapshot::default();
        let mut total_duration = Duration::ZERO;
        let (mut hits, mut misses) = (0u64, 0u64);

        for (key, stat) in stats.iter() {
            snap.total_accesses += stat.total_accesses;
            snap.successful_accesses += stat.successful_accesses;
            total_duration += stat.total_duration;
            hits += stat.cache_hits;
            misses += stat.cache_misses;
            snap.keys.push((key.clone(), *stat));
        }
        drop(stats);

        snap.keys.sort_by(|a, b| a.0.cmp(&b.0));
        if hits + misses > 0 {
            snap.cache_hit_rate = hits as f64 / (hits + misses) as f64;
        }
        if snap.total_accesses > 0 {
            snap.average_latency = total_duration / snap.total_accesses as u32;
        }
        snap.cache_entries = self.caches.iter().map(|c| c.cache_stats().entries).sum();
        snap.pool = self.pool.as_ref().map(|p| p.stats());
        snap
    }

    /// Purge the caches, then close idle pool connections down to the reserve.
    pub fn cleanup(&self) -> CleanupReport {
        let cache_evicted = self.caches.iter().map(|c| c.purge()).sum();
        let pool_closed = self
            .pool
            .as_ref()
            .map(|p| p.close_idle(self.min_idle))
            .unwrap_or(0);

        if cache_evicted + pool_closed > 0 {
            debug!(
                "Cleanup evicted {} cache entries, closed {} idle connections",
                cache_evicted, pool_closed
            );
        }
        CleanupReport {
            cache_evicted,
            pool_closed,
        }
    }

    pub fn suggestions(&self) -> Vec<Suggestion> {
        let snap = self.snapshot();
        let mut out = Vec::new();

        let lookups = snap.keys.iter().map(|(_, s)| s.cache_hits + s.cache_misses).sum::<u64>();
        if lookups > 0 && snap.cache_hit_rate < LOW_HIT_RATE {
            out.push(Suggestion::IncreaseCacheTtl { hit_rate: snap.cache_hit_rate });
        }
        let utilisation = snap.pool_utilisation();
        if utilisation > HIGH_POOL_UTILISATION {
            out.push(Suggestion::EnlargePool { utilisation });
        }
        if snap.average_latency > HIGH_LATENCY {
            out.push(Suggestion::ReducePolling { average_latency: snap.average_latency });
        }
        out
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run `cleanup` every interval until [`stop`](Self::stop).
    ///
    /// Returns `None` if the task is already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let this = Arc::clone(self);
        info!("Maintenance task started (every {:?})", this.interval);

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(this.interval) => {}
                    _ = this.shutdown.notified() => {}
                }
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.cleanup();
            }
            debug!("Maintenance task stopped");
        }))
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }
}
