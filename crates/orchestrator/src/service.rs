//! The cache-aware mosaic service.
//!
//! Each cache key moves through `ABSENT -> COMPUTING -> PRESENT`. A present
//! entry is served without touching tiles; a miss runs the pipeline once,
//! however many callers ask concurrently, and persists raster and
//! percentiles together. A failed computation leaves the key absent.

use std::sync::Arc;

use bytes::Bytes;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use ntl_common::{NtlError, NtlResult, Percentiles};
use storage::{ArtifactStore, CacheEntry, CacheKey, DatasetStore, FsArtifactStore, MemoryArtifactStore, RedisArtifactStore};
use tile_index::{BoundaryProvider, GeoJsonBoundaries, RegionGeometry, Resolution, TileIndex};

use crate::coalesce::{CoalescerStats, RequestCoalescer};
use crate::config::{CacheBackend, MosaicConfig, Product, PRIMARY_VARIABLE};
use crate::fetch::{DatasetFetcher, FetchConfig, HttpTileFetcher, TileFetcher};
use crate::pipeline::{DatasetPipeline, TilePipeline};
use crate::pool::WorkerPool;

/// A finished mosaic as handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MosaicArtifact {
    /// GeoTIFF bytes
    #[serde(skip)]
    pub raster_bytes: Bytes,
    pub p02: f64,
    pub p98: f64,
}

impl MosaicArtifact {
    pub fn percentiles(&self) -> Percentiles {
        Percentiles::new(self.p02, self.p98)
    }
}

impl From<CacheEntry> for MosaicArtifact {
    fn from(entry: CacheEntry) -> Self {
        Self {
            raster_bytes: entry.raster,
            p02: entry.percentiles.p02,
            p98: entry.percentiles.p98,
        }
    }
}

/// Open the artifact store selected by `config.cache_backend`.
pub async fn open_artifact_store(config: &MosaicConfig) -> NtlResult<Arc<dyn ArtifactStore>> {
    let store: Arc<dyn ArtifactStore> = match config.cache_backend {
        CacheBackend::Filesystem => Arc::new(FsArtifactStore::open(config.cache_dir()).await?),
        CacheBackend::Memory => Arc::new(MemoryArtifactStore::new(config.memory_cache_entries)),
        CacheBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| NtlError::ConfigError("REDIS_URL is not set".to_string()))?;
            Arc::new(RedisArtifactStore::connect(url).await?)
        }
    };
    info!(backend = store.name(), "Opened artifact store");
    Ok(store)
}

/// Serves mosaics from the artifact cache, computing them on a miss.
#[derive(Clone)]
pub struct MosaicService {
    inner: Arc<Inner>,
}

struct Inner {
    boundaries: Arc<dyn BoundaryProvider>,
    resolution: Resolution,
    artifacts: Arc<dyn ArtifactStore>,
    tiles: TilePipeline,
    datasets: Option<DatasetPipeline>,
    coalescer: RequestCoalescer<CacheKey, MosaicArtifact>,
}

impl MosaicService {
    /// Service over the primary tile source only.
    pub fn new(
        config: &MosaicConfig,
        boundaries: Arc<dyn BoundaryProvider>,
        index: Arc<TileIndex>,
        tile_fetcher: Arc<dyn TileFetcher>,
        artifacts: Arc<dyn ArtifactStore>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        let tiles = TilePipeline::new(index, tile_fetcher, pool, config);
        Self {
            inner: Arc::new(Inner {
                boundaries,
                resolution: config.boundary_resolution,
                artifacts,
                tiles,
                datasets: None,
                coalescer: RequestCoalescer::new(),
            }),
        }
    }

    /// Wire the primary-source service from configuration: GeoJSON
    /// boundaries, the descriptor index, HTTP tile downloads and the
    /// configured artifact store.
    pub async fn from_config(config: &MosaicConfig) -> NtlResult<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let metadata_dir = config.metadata_dir();
        let index = tokio::task::spawn_blocking(move || TileIndex::from_dir(metadata_dir))
            .await
            .map_err(|e| NtlError::InternalError(format!("index build failed: {}", e)))??;
        let stats = index.stats();
        info!(tiles = stats.tiles, dates = stats.dates, skipped = stats.skipped, "Built tile index");

        let fetcher = HttpTileFetcher::new(&config.tile_url_prefix, config.tiles_dir(), FetchConfig::default())?;
        let artifacts = open_artifact_store(config).await?;
        let pool = Arc::new(WorkerPool::new(config.worker_threads)?);

        Ok(Self::new(
            config,
            Arc::new(GeoJsonBoundaries::new(config.boundaries_dir())),
            Arc::new(index),
            Arc::new(fetcher),
            artifacts,
            pool,
        ))
    }

    /// Enable the alternate source. Must be called before the service is cloned.
    pub fn with_dataset_source(
        mut self,
        config: &MosaicConfig,
        fetcher: Arc<dyn DatasetFetcher>,
        store: Arc<DatasetStore>,
        pool: Arc<WorkerPool>,
    ) -> NtlResult<Self> {
        let inner = Arc::get_mut(&mut self.inner)
            .ok_or_else(|| NtlError::InternalError("service already shared".to_string()))?;
        inner.datasets = Some(DatasetPipeline::new(fetcher, store, pool, config));
        Ok(self)
    }

    pub fn index(&self) -> &TileIndex {
        self.inner.tiles.index()
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.inner.artifacts
    }

    pub async fn region(&self, region_id: &str) -> NtlResult<RegionGeometry> {
        self.inner
            .boundaries
            .get_region_geometry(region_id, self.inner.resolution)
            .await
    }

    /// Capture dates with at least one tile intersecting the region.
    pub async fn available_dates(&self, region_id: &str) -> NtlResult<Vec<NaiveDate>> {
        let region = self.region(region_id).await?;
        Ok(self.index().available_dates(&region))
    }

    /// Mosaic of the primary source for `region_id` on `date`.
    ///
    /// With `no_cache` the cached entry is evicted first and recomputed.
    #[instrument(skip(self))]
    pub async fn get_mosaic(
        &self,
        region_id: &str,
        date: NaiveDate,
        variable: &str,
        no_cache: bool,
    ) -> NtlResult<MosaicArtifact> {
        let variable = if variable.is_empty() { PRIMARY_VARIABLE } else { variable };
        let key = CacheKey::new(region_id, date, variable);
        self.serve(key, None, no_cache).await
    }

    /// Mosaic of an alternate-source product. An empty `variable` selects
    /// the product's default variable.
    ///
    /// With `no_cache` both the rendered artifact and the stored dataset are
    /// evicted first.
    #[instrument(skip(self))]
    pub async fn get_product_mosaic(
        &self,
        region_id: &str,
        date: NaiveDate,
        product: Product,
        variable: &str,
        no_cache: bool,
    ) -> NtlResult<MosaicArtifact> {
        if self.inner.datasets.is_none() {
            return Err(NtlError::InvalidRequest(format!(
                "product source is not configured: {}",
                product
            )));
        }
        let variable = if variable.is_empty() { product.default_variable() } else { variable };
        let key = CacheKey::new(region_id, date, variable).with_product(product.as_str());
        self.serve(key, Some(product), no_cache).await
    }

    async fn serve(&self, key: CacheKey, product: Option<Product>, no_cache: bool) -> NtlResult<MosaicArtifact> {
        // Nothing touches a store until the key is safe and the region exists
        key.validate()?;
        let region = self.region(&key.region).await?;

        if no_cache {
            self.evict(&key).await?;
        } else if let Some(artifact) = self.lookup(&key).await? {
            return Ok(artifact);
        }

        let service = self.clone();
        let computed_key = key.clone();
        self.inner
            .coalescer
            .run(key, move || async move {
                // A computation that finished after our lookup but before we
                // got here has already stored the entry.
                if !no_cache {
                    if let Some(artifact) = service.lookup(&computed_key).await? {
                        return Ok(artifact);
                    }
                }
                service.compute(computed_key, region, product).await
            })
            .await
    }

    /// Cached artifact for `key`; corrupted entries are evicted and reported as a miss.
    async fn lookup(&self, key: &CacheKey) -> NtlResult<Option<MosaicArtifact>> {
        match self.inner.artifacts.get(key).await {
            Ok(Some(entry)) => {
                debug!(key = %key, backend = self.inner.artifacts.name(), "Cache hit");
                Ok(Some(entry.into()))
            }
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                Ok(None)
            }
            Err(e) if e.is_corruption() => {
                warn!(key = %key, error = %e, "Corrupt cache entry, recomputing");
                self.inner.artifacts.evict(key).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the artifact and, for product keys, the stored dataset.
    pub async fn evict(&self, key: &CacheKey) -> NtlResult<()> {
        self.inner.artifacts.evict(key).await?;
        if key.product.is_some() {
            if let Some(datasets) = &self.inner.datasets {
                datasets.datasets().evict(key)?;
            }
        }
        info!(key = %key, "Evicted cache entry");
        Ok(())
    }

    /// Run the pipeline for `key` and persist the result.
    async fn compute(&self, key: CacheKey, region: RegionGeometry, product: Option<Product>) -> NtlResult<MosaicArtifact> {
        let entry = match (product, &self.inner.datasets) {
            (Some(product), Some(datasets)) => datasets.run(&key, &region, product.as_str()).await?,
            (Some(product), None) => {
                return Err(NtlError::InvalidRequest(format!(
                    "product source is not configured: {}",
                    product
                )))
            }
            (None, _) => self.inner.tiles.run(&region, key.date).await?,
        };

        self.inner.artifacts.put(&key, &entry).await?;
        info!(
            key = %key,
            bytes = entry.raster.len(),
            p02 = entry.percentiles.p02,
            p98 = entry.percentiles.p98,
            "Stored mosaic"
        );
        Ok(entry.into())
    }

    pub async fn coalescer_stats(&self) -> CoalescerStats {
        self.inner.coalescer.stats().await
    }
}
