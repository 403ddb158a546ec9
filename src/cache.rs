//! Time-to-live cache with lazy expiry and background sweeping.
//!
//! Every entry expires a fixed TTL after its most recent write. Reads treat
//! expired-but-unswept entries as absent without removing them; a periodic
//! sweep task (every `ttl / 2`) reclaims them under the write lock. The whole
//! map sits behind one `RwLock`: readers run concurrently, any mutation is
//! exclusive.
//!
//! The sweep task is tied to the cache lifecycle. It stops on an explicit
//! [`TtlCache::close`] and also terminates on its own once the last cache
//! handle is dropped, so discarding a cache never leaks a task.

use metrics::counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry time-to-live. The background sweep fires every `ttl / 2`.
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: default_ttl() }
    }
}

fn default_ttl() -> Duration {
    Duration::from_secs(300)
}

/// A single cached value and its absolute expiry instant.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that returned a live value.
    pub hits: u64,
    /// Reads that found nothing or an expired entry.
    pub misses: u64,
    /// Entries physically removed by the background sweep.
    pub swept: u64,
    /// Current entry count, including expired-but-unswept entries.
    pub entries: usize,
}

impl CacheStats {
    /// Hit rate as a percentage; 0 when no reads have happened.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        (self.hits as f64 / total as f64) * 100.0
    }
}

struct CacheShared<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    swept: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl<K, V> CacheShared<K, V>
where
    K: Eq + Hash,
{
    /// Remove every expired entry. Returns how many were removed.
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            self.swept.fetch_add(removed as u64, Ordering::Relaxed);
            counter!("taskmill_cache_swept_total").increment(removed as u64);
        }
        removed
    }
}

/// Expiring key→value store.
///
/// Cloning is cheap and shares the underlying map; the sweep task runs once
/// per cache, not once per handle.
pub struct TtlCache<K, V> {
    inner: Arc<CacheShared<K, V>>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache and start its background sweep task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: CacheConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(CacheShared {
            entries: RwLock::new(HashMap::new()),
            ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            swept: AtomicU64::new(0),
            shutdown: shutdown_tx,
        });

        let period = (config.ttl / 2).max(Duration::from_millis(1));
        tokio::spawn(run_sweeper(Arc::downgrade(&inner), shutdown_rx, period));

        Self { inner }
    }

    /// Create a cache with the given TTL and default settings otherwise.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::new(CacheConfig { ttl })
    }

    /// Insert or overwrite. The entry expires `ttl` from now.
    pub fn set(&self, key: K, value: V) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.inner.ttl,
        };
        self.inner.entries.write().insert(key, entry);
    }

    /// Look up a live value.
    ///
    /// Expired entries read as absent; they stay in the map until the sweep
    /// reclaims them.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let entries = self.inner.entries.read();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                counter!("taskmill_cache_hits_total").increment(1);
                Some(entry.value.clone())
            }
            Some(_) | None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                counter!("taskmill_cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Remove a key. Returns whether an entry (live or expired) was present.
    pub fn delete(&self, key: &K) -> bool {
        self.inner.entries.write().remove(key).is_some()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.inner.entries.write().clear();
    }

    /// Entry count, including expired entries the sweep has not reached yet.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Whether the map holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// The configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            swept: self.inner.swept.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Stop the background sweep. Idempotent.
    ///
    /// The map itself stays usable; only periodic reclamation ends, so
    /// expired entries then linger until deleted or overwritten.
    pub fn close(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

async fn run_sweeper<K, V>(
    shared: Weak<CacheShared<K, V>>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // Err means the sender, and with it the last cache handle,
                // is gone; without the break this arm would spin hot until
                // the next tick.
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!("cache sweeper shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                // All cache handles gone; nothing left to sweep.
                let Some(shared) = shared.upgrade() else { break };
                let removed = shared.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "swept expired cache entries");
                }
            }
        }
    }
}
