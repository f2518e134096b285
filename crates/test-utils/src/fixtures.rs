//! Ready-made scenarios for pipeline and service tests.

use std::sync::Arc;

use chrono::NaiveDate;
use tempfile::TempDir;

use ntl_common::BoundingBox;
use orchestrator::{MosaicConfig, MosaicService, WorkerPool};
use storage::ArtifactStore;
use tile_index::{RegionGeometry, StaticBoundaries, TileIndex};

use crate::generators::{rect_corners, rect_region, uniform_tile, write_descriptor, write_tile_geotiff};
use crate::mocks::MockTileFetcher;

/// Region id of the two-tile scenario.
pub const ABC: &str = "ABC";

/// Extent of region ABC.
pub const ABC_BBOX: BoundingBox = BoundingBox {
    min_x: 0.0,
    min_y: 0.0,
    max_x: 4.0,
    max_y: 2.0,
};

/// Pixel size of the scenario tiles, in degrees.
pub const PIXEL: f64 = 0.5;

/// Raw value of every T1 pixel.
pub const T1_VALUE: u32 = 100;

/// Raw value of every T2 pixel.
pub const T2_VALUE: u32 = 400;

pub fn abc_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid date")
}

/// Region ABC covered by two tiles captured on 2020-01-01.
///
/// Both tile rasters span the whole region, but T1's footprint is the left
/// half and T2's the right half, so only their merge covers ABC.
pub struct AbcScenario {
    pub dir: TempDir,
    pub config: MosaicConfig,
    pub region: RegionGeometry,
    pub index: Arc<TileIndex>,
    pub fetcher: Arc<MockTileFetcher>,
    pub pool: Arc<WorkerPool>,
}

impl AbcScenario {
    pub fn new() -> Self {
        Self::with_fetcher(|fetcher| fetcher)
    }

    /// Build the scenario, letting the caller add latency or failures.
    pub fn with_fetcher(customize: impl FnOnce(MockTileFetcher) -> MockTileFetcher) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = MosaicConfig {
            data_dir: dir.path().to_path_buf(),
            worker_threads: 2,
            ..Default::default()
        };
        config.ensure_dirs().expect("data dirs");

        let left = BoundingBox::new(0.0, 0.0, 2.0, 2.0);
        let right = BoundingBox::new(2.0, 0.0, 4.0, 2.0);
        write_descriptor(&config.metadata_dir(), "T1", "2020-1-1T3:15:02.5", &rect_corners(&left));
        write_descriptor(&config.metadata_dir(), "T2", "2020-1-1T3:15:40.1", &rect_corners(&right));

        let t1 = write_tile_geotiff(
            &config.tiles_dir().join("T1_gec.tif"),
            &uniform_tile(&ABC_BBOX, PIXEL, T1_VALUE),
        );
        let t2 = write_tile_geotiff(
            &config.tiles_dir().join("T2_gec.tif"),
            &uniform_tile(&ABC_BBOX, PIXEL, T2_VALUE),
        );

        let index = TileIndex::from_dir(config.metadata_dir()).expect("index");
        let fetcher = customize(MockTileFetcher::new().with_tile("T1", t1).with_tile("T2", t2));

        Self {
            dir,
            region: rect_region(ABC, &ABC_BBOX),
            index: Arc::new(index),
            fetcher: Arc::new(fetcher),
            pool: Arc::new(WorkerPool::new(config.worker_threads).expect("pool")),
            config,
        }
    }

    pub fn boundaries(&self) -> Arc<StaticBoundaries> {
        Arc::new(StaticBoundaries::new().with_region(self.region.clone()))
    }

    /// A service over this scenario backed by `artifacts`.
    pub fn service(&self, artifacts: Arc<dyn ArtifactStore>) -> MosaicService {
        MosaicService::new(
            &self.config,
            self.boundaries(),
            self.index.clone(),
            self.fetcher.clone(),
            artifacts,
            self.pool.clone(),
        )
    }
}

impl Default for AbcScenario {
    fn default() -> Self {
        Self::new()
    }
}
