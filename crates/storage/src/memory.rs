//! In-process LRU artifact store for tests and single-node deployments.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::RwLock;
use tracing::debug;

use crate::artifact::ArtifactStore;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::key::CacheKey;

/// LRU store bounded by entry count.
///
/// Entries are inserted under a single write lock, so readers see either
/// the old pair or the new one.
pub struct MemoryArtifactStore {
    cache: RwLock<LruCache<CacheKey, CacheEntry>>,
    stats: MemoryStoreStats,
}

/// Hit/miss counters for the memory store.
#[derive(Debug, Default)]
pub struct MemoryStoreStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl MemoryStoreStats {
    /// Cache hit rate as a percentage (0-100).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

impl MemoryArtifactStore {
    /// Create a store holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(capacity)),
            stats: MemoryStoreStats::default(),
        }
    }

    pub fn stats(&self) -> &MemoryStoreStats {
        &self.stats
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    /// Replace an entry without any validation, for corruption tests.
    pub async fn insert_raw(&self, key: CacheKey, entry: CacheEntry) {
        self.cache.write().await.put(key, entry);
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        // LruCache::get updates recency, so it needs the write lock
        let mut cache = self.cache.write().await;
        match cache.get(key) {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.clone()))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let mut cache = self.cache.write().await;
        if let Some((evicted, _)) = cache.push(key.clone(), entry.clone()) {
            if &evicted != key {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %evicted, "Evicted least recently used artifact");
            }
        }
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> Result<()> {
        self.cache.write().await.pop(key);
        Ok(())
    }
}
