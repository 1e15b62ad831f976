//! Bounded reconstruction cache with LRU eviction
//!
//! Keyed by (episode ID, requested fidelity), so the same episode replayed
//! at different fidelities caches independently. When the cache reaches
//! capacity, the least-recently-used entry is evicted. Access via `get()`
//! promotes the entry to most-recently-used. Hit and miss counters feed
//! the engine's cache hit rate statistic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use crate::fragment::Content;

/// Episode ID plus the exact bit pattern of the requested fidelity; two
/// requests share an entry only when their fidelities are bit-identical.
type CacheKey = (String, u64);

/// One cached reconstruction.
#[derive(Debug, Clone)]
pub struct CachedReplay {
    /// Reconstructed content
    pub content: Content,
    /// Fidelity actually achieved, in [0.0, 1.0]
    pub achieved_fidelity: f64,
    /// References left unresolved (placeholders in the content)
    pub unresolved_refs: usize,
}

/// A capacity-limited reconstruction cache with strict LRU eviction.
pub struct ReplayCache {
    inner: RwLock<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct CacheInner {
    map: HashMap<CacheKey, CachedReplay>,
    /// LRU order: front = oldest, back = newest
    order: VecDeque<CacheKey>,
    capacity: usize,
}

impl ReplayCache {
    /// Create a cache holding at most `capacity` reconstructions.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                map: HashMap::with_capacity(capacity.min(1024)),
                order: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn key(episode_id: &str, fidelity: f64) -> CacheKey {
        (episode_id.to_string(), fidelity.to_bits())
    }

    /// Look up a cached reconstruction, promoting it to most-recently-used.
    pub async fn get(&self, episode_id: &str, fidelity: f64) -> Option<CachedReplay> {
        let key = Self::key(episode_id, fidelity);
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.map.get(&key) {
            let entry = entry.clone();
            inner.order.retain(|k| *k != key);
            inner.order.push_back(key);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store a reconstruction, evicting the LRU entry if at capacity.
    pub async fn insert(&self, episode_id: &str, fidelity: f64, entry: CachedReplay) {
        let key = Self::key(episode_id, fidelity);
        let mut inner = self.inner.write().await;
        if inner.capacity == 0 {
            return;
        }

        if inner.map.contains_key(&key) {
            inner.order.retain(|k| *k != key);
        } else if inner.map.len() >= inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }

        inner.map.insert(key.clone(), entry);
        inner.order.push_back(key);
    }

    /// Current number of cached reconstructions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }

    /// Fraction of lookups served from cache; 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
