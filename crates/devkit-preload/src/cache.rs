//! Bounded TTL cache for loaded modules

use crate::lock;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Time-to-live applied when `set` is given none (ms)
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Period of the background sweep (ms)
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            default_ttl_ms: default_ttl_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

fn default_capacity() -> usize {
    100
}

fn default_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_cleanup_interval_ms() -> u64 {
    60 * 1000
}

/// A cached value with its expiry metadata
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Cached value
    pub data: V,
    /// Insertion time
    pub inserted_at: Instant,
    /// Time-to-live
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// Whether the entry has outlived its ttl
    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live entries (expired ones not yet swept included)
    pub entries: usize,
    /// Cache hits
    pub hits: u64,
    /// Cache misses (absent or expired)
    pub misses: u64,
    /// Entries evicted to make room
    pub evictions: u64,
    /// Entries dropped because they expired
    pub expirations: u64,
}

impl CacheStats {
    /// Hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheStatsInner {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Default)]
struct Sweeper {
    subscribers: usize,
    task: Option<JoinHandle<()>>,
}

/// Bounded TTL cache
///
/// When full, the oldest insertion is evicted (FIFO, not recency).
/// Expired entries are dropped lazily on read, by [`TtlCache::cleanup`], or
/// by the periodic sweeper while at least one [`CleanupSubscription`] lives.
pub struct TtlCache<K, V> {
    config: CacheConfig,
    entries: Mutex<IndexMap<K, CacheEntry<V>>>,
    stats: CacheStatsInner,
    sweeper: Mutex<Sweeper>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a new cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(IndexMap::with_capacity(config.capacity)),
            config,
            stats: CacheStatsInner::default(),
            sweeper: Mutex::new(Sweeper::default()),
        }
    }

    /// Insert a value, evicting the oldest insertion when full
    pub fn set(&self, key: K, data: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or_else(|| Duration::from_millis(self.config.default_ttl_ms));
        let mut entries = lock(&self.entries);

        if !entries.contains_key(&key) && entries.len() >= self.config.capacity {
            if entries.shift_remove_index(0).is_some() {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                data,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Get a live value
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = lock(&self.entries);

        match entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data.clone())
            }
            Some(_) => {
                entries.shift_remove(key);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Check for a live value without touching statistics
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.entries)
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false)
    }

    /// Remove a value
    pub fn remove(&self, key: &K) -> Option<V> {
        lock(&self.entries).shift_remove(key).map(|entry| entry.data)
    }

    /// Sweep every expired entry, returning how many were dropped
    pub fn cleanup(&self) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let removed = before - entries.len();

        if removed > 0 {
            self.stats
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Swept {} expired cache entries", removed);
        }

        removed
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
        }
    }

    /// Zero the counters
    pub fn reset_stats(&self) {
        self.stats.hits.store(0, Ordering::Relaxed);
        self.stats.misses.store(0, Ordering::Relaxed);
        self.stats.evictions.store(0, Ordering::Relaxed);
        self.stats.expirations.store(0, Ordering::Relaxed);
    }

    /// Opt in to the periodic sweep
    ///
    /// The sweep task starts with the first subscription and stops when the
    /// last one is dropped. Must be called within a tokio runtime.
    pub fn subscribe_cleanup(self: &Arc<Self>) -> CleanupSubscription<K, V> {
        let mut sweeper = lock(&self.sweeper);
        sweeper.subscribers += 1;

        if sweeper.task.is_none() {
            let period = Duration::from_millis(self.config.cleanup_interval_ms.max(1));
            let cache = Arc::downgrade(self);
            sweeper.task = Some(tokio::spawn(sweep(cache, period)));
            debug!("Started cache sweeper ({:?} period)", period);
        }

        CleanupSubscription {
            cache: Arc::clone(self),
        }
    }

    /// Number of live cleanup subscriptions
    pub fn cleanup_subscribers(&self) -> usize {
        lock(&self.sweeper).subscribers
    }

    fn release_cleanup(&self) {
        let mut sweeper = lock(&self.sweeper);
        sweeper.subscribers = sweeper.subscribers.saturating_sub(1);

        if sweeper.subscribers == 0 {
            if let Some(task) = sweeper.task.take() {
                task.abort();
                debug!("Stopped cache sweeper");
            }
        }
    }
}

async fn sweep<K, V>(cache: Weak<TtlCache<K, V>>, period: Duration)
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        interval.tick().await;
        let Some(cache) = cache.upgrade() else {
            return;
        };
        cache.cleanup();
    }
}

/// Keeps the periodic sweep alive while held
pub struct CleanupSubscription<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    cache: Arc<TtlCache<K, V>>,
}

impl<K, V> Drop for CleanupSubscription<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.cache.release_cleanup();
    }
}
