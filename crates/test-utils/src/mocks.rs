//! Instrumented stand-ins for the network and cache collaborators.
//!
//! Every mock counts its calls so tests can assert how often the pipeline
//! actually went to the network.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use mosaic::TileRaster;
use ntl_common::{NtlError, NtlResult};
use orchestrator::{DatasetFetcher, TileFetcher};
use storage::{ArtifactStore, CacheEntry, CacheKey, Dataset, MemoryArtifactStore};
use tile_index::RegionGeometry;

/// Serves tiles that already exist on local disk.
#[derive(Debug, Default)]
pub struct MockTileFetcher {
    tiles: HashMap<String, PathBuf>,
    latency: HashMap<String, Duration>,
    default_latency: Duration,
    failures: HashMap<String, NtlError>,
    fetches: AtomicUsize,
}

impl MockTileFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tile(mut self, tile_id: &str, path: impl Into<PathBuf>) -> Self {
        self.tiles.insert(tile_id.to_string(), path.into());
        self
    }

    /// Delay every fetch of `tile_id`.
    pub fn with_latency(mut self, tile_id: &str, latency: Duration) -> Self {
        self.latency.insert(tile_id.to_string(), latency);
        self
    }

    /// Delay fetches of tiles without their own latency.
    pub fn with_default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Fail every fetch of `tile_id` with `error`.
    pub fn with_failure(mut self, tile_id: &str, error: NtlError) -> Self {
        self.failures.insert(tile_id.to_string(), error);
        self
    }

    /// Number of `fetch_tile` calls so far, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TileFetcher for MockTileFetcher {
    async fn fetch_tile(&self, tile_id: &str) -> NtlResult<PathBuf> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency.get(tile_id).copied().unwrap_or(self.default_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.failures.get(tile_id) {
            return Err(error.clone());
        }
        self.tiles
            .get(tile_id)
            .cloned()
            .ok_or_else(|| NtlError::NotFound(format!("unknown tile {}", tile_id)))
    }
}

/// Returns one fixed raster for any dataset request.
#[derive(Debug)]
pub struct MockDatasetFetcher {
    raster: TileRaster<f32>,
    failure: Option<NtlError>,
    latency: Duration,
    fetches: AtomicUsize,
}

impl MockDatasetFetcher {
    pub fn new(raster: TileRaster<f32>) -> Self {
        Self {
            raster,
            failure: None,
            latency: Duration::ZERO,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_failure(mut self, error: NtlError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatasetFetcher for MockDatasetFetcher {
    async fn fetch_dataset(
        &self,
        _region: &RegionGeometry,
        date: NaiveDate,
        product: &str,
        variable: &str,
    ) -> NtlResult<Dataset> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(Dataset {
            product: product.to_string(),
            variable: variable.to_string(),
            date,
            raster: self.raster.clone(),
        })
    }
}

/// In-memory artifact store whose `n`-th `get` stalls after reading, so the
/// caller acts on an answer that is stale by the time it arrives.
pub struct StaleReadStore {
    inner: MemoryArtifactStore,
    slow_call: usize,
    delay: Duration,
    gets: AtomicUsize,
}

impl StaleReadStore {
    /// Stall the `slow_call`-th `get` (1-based) by `delay`.
    pub fn new(slow_call: usize, delay: Duration) -> Self {
        Self {
            inner: MemoryArtifactStore::new(16),
            slow_call,
            delay,
            gets: AtomicUsize::new(0),
        }
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for StaleReadStore {
    fn name(&self) -> &'static str {
        "stale-read"
    }

    async fn get(&self, key: &CacheKey) -> storage::Result<Option<CacheEntry>> {
        let call = self.gets.fetch_add(1, Ordering::SeqCst) + 1;
        let found = self.inner.get(key).await?;
        if call == self.slow_call {
            tokio::time::sleep(self.delay).await;
        }
        Ok(found)
    }

    async fn put(&self, key: &CacheKey, entry: &CacheEntry) -> storage::Result<()> {
        self.inner.put(key, entry).await
    }

    async fn evict(&self, key: &CacheKey) -> storage::Result<()> {
        self.inner.evict(key).await
    }
}
