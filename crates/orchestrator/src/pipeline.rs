//! Mosaic pipelines for the two imagery sources.
//!
//! Primary source, assembled from individual tiles:
//!
//! ```text
//! TileIndex::lookup ─► fetch (bounded, per-tile timeout) ─► [worker pool]
//!                                                            decode
//!                                                            prepare_tile
//!                                                            assemble
//!                                                            encode ─► CacheEntry
//! ```
//!
//! The alternate source delivers one pre-mosaicked dataset per date, which is
//! persisted as Zarr before it is clipped and encoded.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::future::join_all;
use rayon::prelude::*;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use mosaic::geotiff::read_raw_tile;
use mosaic::mask::clip_to_region;
use mosaic::{assemble, coarsen, prepare_tile, AssembleOptions, Mosaic, TileRaster};
use ntl_common::{CrsCode, MultiPolygon, NtlError, NtlResult};
use storage::{CacheEntry, CacheKey, DatasetStore};
use tile_index::{RegionGeometry, TileFootprint, TileIndex};

use crate::config::MosaicConfig;
use crate::fetch::{DatasetFetcher, TileFetcher};
use crate::pool::WorkerPool;

/// Selection, fetch and assembly of primary-source mosaics.
pub struct TilePipeline {
    index: Arc<TileIndex>,
    fetcher: Arc<dyn TileFetcher>,
    pool: Arc<WorkerPool>,
    fetch_concurrency: usize,
    tile_timeout: Duration,
    options: AssembleOptions,
}

impl TilePipeline {
    pub fn new(
        index: Arc<TileIndex>,
        fetcher: Arc<dyn TileFetcher>,
        pool: Arc<WorkerPool>,
        config: &MosaicConfig,
    ) -> Self {
        Self {
            index,
            fetcher,
            pool,
            fetch_concurrency: config.fetch_concurrency.max(1),
            tile_timeout: config.tile_timeout,
            options: assemble_options(config),
        }
    }

    pub fn index(&self) -> &TileIndex {
        &self.index
    }

    /// Build the mosaic of `region` on `date`.
    #[instrument(skip(self, region), fields(region = %region.id))]
    pub async fn run(&self, region: &RegionGeometry, date: NaiveDate) -> NtlResult<CacheEntry> {
        let tiles = self.index.lookup(region, date);
        if tiles.is_empty() {
            return Err(NtlError::NotFound(format!(
                "no tiles cover {} on {}",
                region.id, date
            )));
        }
        info!(tiles = tiles.len(), "Selected tiles");

        let fetched = self.fetch_all(tiles).await?;

        let geometry = region.geometry.clone();
        let crs = region.crs;
        let options = self.options;
        self.pool
            .run(move || build_mosaic(&fetched, &geometry, crs, options))
            .await?
    }

    /// Fetch every tile with bounded concurrency, dropping late or failed ones.
    async fn fetch_all(&self, tiles: Vec<TileFootprint>) -> NtlResult<Vec<(TileFootprint, PathBuf)>> {
        let requested = tiles.len();
        let semaphore = Semaphore::new(self.fetch_concurrency);

        let fetches = tiles.into_iter().map(|tile| {
            let semaphore = &semaphore;
            async move {
                let outcome = match semaphore.acquire().await {
                    Ok(_permit) => {
                        tokio::time::timeout(self.tile_timeout, self.fetcher.fetch_tile(&tile.tile_id)).await
                    }
                    Err(_) => Ok(Err(NtlError::InternalError("fetch semaphore closed".to_string()))),
                };
                (tile, outcome)
            }
        });

        let mut fetched = Vec::with_capacity(requested);
        let mut errors = Vec::new();
        for (tile, outcome) in join_all(fetches).await {
            match outcome {
                Ok(Ok(path)) => fetched.push((tile, path)),
                Ok(Err(e)) => {
                    warn!(tile = %tile.tile_id, error = %e, "Tile fetch failed, dropping tile");
                    errors.push(e);
                }
                Err(_) => {
                    warn!(
                        tile = %tile.tile_id,
                        timeout_secs = self.tile_timeout.as_secs_f64(),
                        "Tile fetch timed out, dropping tile"
                    );
                }
            }
        }

        debug!(requested, fetched = fetched.len(), failed = errors.len(), "Tile fetches settled");

        if fetched.is_empty() {
            return Err(no_tiles_error(errors));
        }
        Ok(fetched)
    }
}

/// Error for a request whose every tile failed or timed out.
///
/// Upstream failures are surfaced with all their messages; anything else is
/// reported as missing data.
fn no_tiles_error(errors: Vec<NtlError>) -> NtlError {
    let mut status = None;
    let mut messages = Vec::new();
    for e in errors {
        if let NtlError::UpstreamFailure { status: s, messages: m } = e {
            status.get_or_insert(s);
            messages.extend(m);
        }
    }
    match status {
        Some(status) => NtlError::UpstreamFailure { status, messages },
        None => NtlError::NotFound("no tiles could be fetched".to_string()),
    }
}

/// Decode, convert and mask each tile, then assemble and encode the mosaic.
fn build_mosaic(
    fetched: &[(TileFootprint, PathBuf)],
    region: &MultiPolygon,
    region_crs: CrsCode,
    options: AssembleOptions,
) -> NtlResult<CacheEntry> {
    let prepared: Vec<TileRaster<f32>> = fetched
        .par_iter()
        .filter_map(|(tile, path)| match read_raw_tile(path) {
            Ok(raw) => {
                let footprint = if raw.crs == TileFootprint::CRS {
                    tile.polygon()
                } else {
                    tile.polygon().transform(TileFootprint::CRS, raw.crs)
                };
                Some(prepare_tile(&raw, &footprint))
            }
            Err(e) => {
                warn!(tile = %tile.tile_id, path = %path.display(), error = %e, "Unreadable tile, skipping");
                None
            }
        })
        .collect();

    if prepared.is_empty() {
        return Err(NtlError::NotFound("no readable tiles".to_string()));
    }

    let mosaic = assemble(&prepared, region, region_crs, options)?;
    encode(&mosaic)
}

fn encode(mosaic: &Mosaic) -> NtlResult<CacheEntry> {
    let raster = mosaic.to_geotiff()?;
    Ok(CacheEntry::new(raster, mosaic.percentiles))
}

fn assemble_options(config: &MosaicConfig) -> AssembleOptions {
    AssembleOptions {
        downsample_factor: config.downsample_factor,
        downsample_method: config.downsample_method,
    }
}

/// Fetch, persistence and rendering of alternate-source mosaics.
pub struct DatasetPipeline {
    fetcher: Arc<dyn DatasetFetcher>,
    datasets: Arc<DatasetStore>,
    pool: Arc<WorkerPool>,
    options: AssembleOptions,
}

impl DatasetPipeline {
    pub fn new(
        fetcher: Arc<dyn DatasetFetcher>,
        datasets: Arc<DatasetStore>,
        pool: Arc<WorkerPool>,
        config: &MosaicConfig,
    ) -> Self {
        Self {
            fetcher,
            datasets,
            pool,
            options: assemble_options(config),
        }
    }

    pub fn datasets(&self) -> &Arc<DatasetStore> {
        &self.datasets
    }

    /// Build the mosaic for `key`, reusing a stored dataset when present.
    #[instrument(skip(self, region), fields(region = %region.id))]
    pub async fn run(&self, key: &CacheKey, region: &RegionGeometry, product: &str) -> NtlResult<CacheEntry> {
        let stored = {
            let datasets = self.datasets.clone();
            let key = key.clone();
            self.pool.run(move || datasets.read(&key)).await?
        };

        let dataset = match stored {
            Ok(Some(dataset)) => {
                debug!("Reusing stored dataset");
                dataset
            }
            Ok(None) => self.fetch_and_store(key, region, product).await?,
            Err(e) if e.is_corruption() => {
                warn!(error = %e, "Stored dataset unreadable, fetching again");
                self.fetch_and_store(key, region, product).await?
            }
            Err(e) => return Err(e.into()),
        };

        let geometry = region.geometry.clone();
        let crs = region.crs;
        let options = self.options;
        self.pool
            .run(move || {
                let raster = if options.downsample_factor > 1 {
                    coarsen(&dataset.raster, options.downsample_factor, options.downsample_method)?
                } else {
                    dataset.raster
                };
                let mosaic = Mosaic::from_raster(clip_to_region(&raster, &geometry, crs));
                info!(
                    product = %dataset.product,
                    variable = %dataset.variable,
                    p02 = mosaic.percentiles.p02,
                    p98 = mosaic.percentiles.p98,
                    "Rendered dataset mosaic"
                );
                encode(&mosaic)
            })
            .await?
    }

    async fn fetch_and_store(
        &self,
        key: &CacheKey,
        region: &RegionGeometry,
        product: &str,
    ) -> NtlResult<storage::Dataset> {
        let dataset = self
            .fetcher
            .fetch_dataset(region, key.date, product, &key.variable)
            .await?;
        info!(
            width = dataset.raster.width,
            height = dataset.raster.height,
            "Fetched dataset"
        );

        let datasets = self.datasets.clone();
        let key = key.clone();
        self.pool
            .run(move || datasets.write(&key, &dataset).map(|()| dataset))
            .await?
            .map_err(NtlError::from)
    }
}
