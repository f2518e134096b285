//! End-to-end tests of the cache-aware mosaic service.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use mosaic::geotiff::decode_f32;
use mosaic::radiometry::radiance;
use mosaic::{GeoTransform, TileRaster};
use ntl_common::{CrsCode, NtlError};
use orchestrator::{MosaicService, Product, PRIMARY_VARIABLE};
use storage::filesystem::RASTER_FILE;
use storage::{ArtifactStore, CacheEntry, CacheKey, DatasetStore, FsArtifactStore, MemoryArtifactStore};
use ntl_common::Percentiles;
use test_utils::{
    abc_date, assert_approx_eq, AbcScenario, MockDatasetFetcher, StaleReadStore, ABC, T1_VALUE, T2_VALUE,
};

fn memory_store() -> Arc<dyn ArtifactStore> {
    Arc::new(MemoryArtifactStore::new(16))
}

fn abc_key() -> CacheKey {
    CacheKey::new(ABC, abc_date(), PRIMARY_VARIABLE)
}

#[tokio::test]
async fn test_abc_mosaic_combines_both_halves() {
    let scenario = AbcScenario::new();
    let service = scenario.service(memory_store());

    let artifact = service
        .get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false)
        .await
        .unwrap();
    let raster = decode_f32(&artifact.raster_bytes).unwrap();

    assert_eq!((raster.width, raster.height), (8, 4));
    assert_eq!(raster.valid_count(), 32);

    let left = radiance(T1_VALUE as f64);
    let right = radiance(T2_VALUE as f64);
    for row in 0..4 {
        for col in 0..8 {
            let expected = if col < 4 { left } else { right };
            assert_eq!(raster.get(col, row), Some(expected), "pixel ({col}, {row})");
        }
    }

    // Neither tile alone covers the region
    assert!(raster.data.iter().any(|&v| v == left));
    assert!(raster.data.iter().any(|&v| v == right));

    assert_approx_eq!(artifact.p02, left, 1e-12);
    assert_approx_eq!(artifact.p98, right, 1e-12);
    assert_eq!(scenario.fetcher.fetch_count(), 2);
}

#[tokio::test]
async fn test_cached_mosaic_is_served_without_fetching() {
    let scenario = AbcScenario::new();
    let service = scenario.service(memory_store());

    let first = service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false).await.unwrap();
    let second = service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(scenario.fetcher.fetch_count(), 2);
    assert!(service.artifacts().contains(&abc_key()).await.unwrap());
}

#[tokio::test]
async fn test_no_cache_recomputes_and_repopulates() {
    let scenario = AbcScenario::new();
    let service = scenario.service(memory_store());

    let first = service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false).await.unwrap();
    let forced = service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, true).await.unwrap();
    assert_eq!(scenario.fetcher.fetch_count(), 4);
    assert_eq!(first.raster_bytes, forced.raster_bytes);
    assert_eq!(first.percentiles(), forced.percentiles());

    // Repopulated: the next plain request is a hit
    service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false).await.unwrap();
    assert_eq!(scenario.fetcher.fetch_count(), 4);
}

#[tokio::test]
async fn test_concurrent_requests_compute_once() {
    let scenario = AbcScenario::with_fetcher(|f| f.with_default_latency(Duration::from_millis(100)));
    let service = scenario.service(memory_store());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service: MosaicService = service.clone();
        handles.push(tokio::spawn(async move {
            service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(scenario.fetcher.fetch_count(), 2);
    assert_eq!(service.coalescer_stats().await.in_flight, 0);
}

#[tokio::test]
async fn test_stale_miss_after_computation_is_served_from_cache() {
    let scenario = AbcScenario::new();
    // The first lookup reads "absent" and only answers 300 ms later
    let store = Arc::new(StaleReadStore::new(1, Duration::from_millis(300)));
    let service = scenario.service(store.clone());

    let slow = {
        let service = service.clone();
        tokio::spawn(async move { service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Computes and stores while the slow lookup is still pending
    let fast = service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false).await.unwrap();
    assert_eq!(scenario.fetcher.fetch_count(), 2);

    let late = slow.await.unwrap().unwrap();
    assert_eq!(late, fast);
    assert_eq!(scenario.fetcher.fetch_count(), 2);
    assert!(store.get_count() >= 4);
}

#[tokio::test]
async fn test_no_cache_for_unknown_region_keeps_cache_intact() {
    let scenario = AbcScenario::new();
    let store = memory_store();
    let service = scenario.service(store.clone());

    let key = CacheKey::new("XYZ", abc_date(), PRIMARY_VARIABLE);
    let entry = CacheEntry::new(vec![1u8, 2, 3], Percentiles::new(0.1, 0.2));
    store.put(&key, &entry).await.unwrap();

    let err = service.get_mosaic("XYZ", abc_date(), PRIMARY_VARIABLE, true).await.unwrap_err();
    assert!(matches!(err, NtlError::NotFound(_)));
    assert_eq!(store.get(&key).await.unwrap(), Some(entry));
}

#[tokio::test]
async fn test_path_like_region_is_rejected_before_touching_the_cache() {
    let scenario = AbcScenario::new();
    let root = scenario.config.cache_dir();
    let store = Arc::new(FsArtifactStore::open(&root).await.unwrap());
    let service = scenario.service(store);

    // Sibling of the cache root that "../x" would resolve to
    let outside = root.parent().unwrap().join("keep");
    std::fs::create_dir_all(&outside).unwrap();

    for region in ["../keep", "..", "A/B", "", "A@B"] {
        let err = service.get_mosaic(region, abc_date(), PRIMARY_VARIABLE, true).await.unwrap_err();
        assert!(matches!(err, NtlError::InvalidRequest(_)), "{region:?}: {err:?}");
        assert_eq!(err.http_status_code(), 400);
    }
    assert!(outside.exists());
    assert_eq!(scenario.fetcher.fetch_count(), 0);
}

#[tokio::test]
async fn test_late_tile_is_dropped() {
    let mut scenario = AbcScenario::with_fetcher(|f| f.with_latency("T2", Duration::from_secs(10)));
    scenario.config.tile_timeout = Duration::from_millis(200);
    let service = scenario.service(memory_store());

    let artifact = service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false).await.unwrap();
    let raster = decode_f32(&artifact.raster_bytes).unwrap();

    assert_eq!(raster.valid_count(), 16);
    assert_eq!(raster.get(0, 0), Some(radiance(T1_VALUE as f64)));
    assert!(raster.get(7, 0).unwrap().is_nan());
}

#[tokio::test]
async fn test_all_tiles_late_is_not_found() {
    let mut scenario = AbcScenario::with_fetcher(|f| f.with_default_latency(Duration::from_secs(10)));
    scenario.config.tile_timeout = Duration::from_millis(100);
    let service = scenario.service(memory_store());

    let err = service
        .get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false)
        .await
        .unwrap_err();
    assert!(matches!(err, NtlError::NotFound(_)));
    assert!(!service.artifacts().contains(&abc_key()).await.unwrap());
}

#[tokio::test]
async fn test_date_without_tiles_is_not_found() {
    let scenario = AbcScenario::new();
    let service = scenario.service(memory_store());
    let date = NaiveDate::from_ymd_opt(2021, 6, 1).unwrap();

    let err = service.get_mosaic(ABC, date, PRIMARY_VARIABLE, false).await.unwrap_err();
    assert!(matches!(err, NtlError::NotFound(_)));
    assert_eq!(err.http_status_code(), 404);
    assert_eq!(scenario.fetcher.fetch_count(), 0);
    assert!(!service
        .artifacts()
        .contains(&CacheKey::new(ABC, date, PRIMARY_VARIABLE))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_unknown_region_is_not_found() {
    let scenario = AbcScenario::new();
    let service = scenario.service(memory_store());

    let err = service.get_mosaic("XYZ", abc_date(), PRIMARY_VARIABLE, false).await.unwrap_err();
    assert!(matches!(err, NtlError::NotFound(_)));
}

#[tokio::test]
async fn test_upstream_failure_is_surfaced_and_not_cached() {
    let scenario = AbcScenario::with_fetcher(|f| {
        f.with_failure("T1", NtlError::upstream(503, "tile server unavailable"))
            .with_failure("T2", NtlError::upstream(503, "tile server unavailable"))
    });
    let service = scenario.service(memory_store());

    let err = service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false).await.unwrap_err();
    match &err {
        NtlError::UpstreamFailure { status, messages } => {
            assert_eq!(*status, 503);
            assert_eq!(messages.len(), 2);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.http_status_code(), 502);
    assert!(!service.artifacts().contains(&abc_key()).await.unwrap());
}

#[tokio::test]
async fn test_available_dates() {
    let scenario = AbcScenario::new();
    let service = scenario.service(memory_store());
    assert_eq!(service.available_dates(ABC).await.unwrap(), vec![abc_date()]);
}

#[tokio::test]
async fn test_corrupt_filesystem_entry_self_heals() {
    let scenario = AbcScenario::new();
    let store = Arc::new(FsArtifactStore::open(scenario.config.cache_dir()).await.unwrap());
    let service = scenario.service(store.clone());

    let first = service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false).await.unwrap();

    // Truncate the raster behind the sidecar's back
    let raster_path = store.entry_dir(&abc_key()).unwrap().join(RASTER_FILE);
    let bytes = std::fs::read(&raster_path).unwrap();
    std::fs::write(&raster_path, &bytes[..bytes.len() / 2]).unwrap();

    let healed = service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, false).await.unwrap();
    assert_eq!(healed, first);
    assert_eq!(scenario.fetcher.fetch_count(), 4);
    assert_eq!(std::fs::read(&raster_path).unwrap(), bytes);
}

fn product_raster() -> TileRaster<f32> {
    // 8x4 grid over ABC with increasing radiance
    let data = (0..32).map(|v| v as f32 * 1e-9).collect();
    TileRaster::new(8, 4, data, GeoTransform::new(0.0, 2.0, 0.5, -0.5), CrsCode::Epsg4326).unwrap()
}

#[tokio::test]
async fn test_product_mosaic_persists_dataset() {
    let scenario = AbcScenario::new();
    let fetcher = Arc::new(MockDatasetFetcher::new(product_raster()));
    let datasets = Arc::new(DatasetStore::open(scenario.config.dataset_dir()).unwrap());
    let service = scenario
        .service(memory_store())
        .with_dataset_source(&scenario.config, fetcher.clone(), datasets.clone(), scenario.pool.clone())
        .unwrap();

    let variable = "Gap_Filled_DNB_BRDF-Corrected_NTL";
    let key = CacheKey::new(ABC, abc_date(), variable).with_product("VNP46A2");

    let first = service
        .get_product_mosaic(ABC, abc_date(), Product::Vnp46a2, variable, false)
        .await
        .unwrap();
    assert_eq!(fetcher.fetch_count(), 1);
    assert!(datasets.read(&key).unwrap().is_some());
    assert_eq!(decode_f32(&first.raster_bytes).unwrap().valid_count(), 32);

    // Cache hit
    service.get_product_mosaic(ABC, abc_date(), Product::Vnp46a2, variable, false).await.unwrap();
    assert_eq!(fetcher.fetch_count(), 1);

    // Artifact gone but dataset kept: re-rendered from Zarr without fetching
    service.artifacts().evict(&key).await.unwrap();
    let rerendered = service
        .get_product_mosaic(ABC, abc_date(), Product::Vnp46a2, variable, false)
        .await
        .unwrap();
    assert_eq!(fetcher.fetch_count(), 1);
    assert_eq!(rerendered, first);

    // Forced refresh drops both and fetches again
    service.get_product_mosaic(ABC, abc_date(), Product::Vnp46a2, variable, true).await.unwrap();
    assert_eq!(fetcher.fetch_count(), 2);
    assert_eq!(scenario.fetcher.fetch_count(), 0);
}

#[tokio::test]
async fn test_product_default_variable() {
    let scenario = AbcScenario::new();
    let fetcher = Arc::new(MockDatasetFetcher::new(product_raster()));
    let datasets = Arc::new(DatasetStore::open(scenario.config.dataset_dir()).unwrap());
    let service = scenario
        .service(memory_store())
        .with_dataset_source(&scenario.config, fetcher.clone(), datasets, scenario.pool.clone())
        .unwrap();

    service.get_product_mosaic(ABC, abc_date(), Product::Vnp46a1, "", false).await.unwrap();

    let key = CacheKey::new(ABC, abc_date(), "DNB_At_Sensor_Radiance_500m").with_product("VNP46A1");
    assert!(service.artifacts().contains(&key).await.unwrap());
}

#[tokio::test]
async fn test_primary_refresh_keeps_product_entry() {
    let scenario = AbcScenario::new();
    let store = Arc::new(FsArtifactStore::open(scenario.config.cache_dir()).await.unwrap());
    let fetcher = Arc::new(MockDatasetFetcher::new(product_raster()));
    let datasets = Arc::new(DatasetStore::open(scenario.config.dataset_dir()).unwrap());
    let service = scenario
        .service(store)
        .with_dataset_source(&scenario.config, fetcher.clone(), datasets, scenario.pool.clone())
        .unwrap();

    // Product variable equal to the primary one: same region/date/variable prefix
    service
        .get_product_mosaic(ABC, abc_date(), Product::Vnp46a2, PRIMARY_VARIABLE, false)
        .await
        .unwrap();
    service.get_mosaic(ABC, abc_date(), PRIMARY_VARIABLE, true).await.unwrap();

    let product_key = abc_key().with_product("VNP46A2");
    assert!(service.artifacts().contains(&product_key).await.unwrap());
    service
        .get_product_mosaic(ABC, abc_date(), Product::Vnp46a2, PRIMARY_VARIABLE, false)
        .await
        .unwrap();
    assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test]
async fn test_product_source_not_configured() {
    let scenario = AbcScenario::new();
    let service = scenario.service(memory_store());

    let err = service
        .get_product_mosaic(ABC, abc_date(), Product::Vnp46a2, "x", false)
        .await
        .unwrap_err();
    assert!(matches!(err, NtlError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_dataset_upstream_error_propagates() {
    let scenario = AbcScenario::new();
    let fetcher = Arc::new(
        MockDatasetFetcher::new(product_raster())
            .with_failure(NtlError::UpstreamFailure {
                status: 401,
                messages: vec!["invalid token".to_string()],
            }),
    );
    let datasets = Arc::new(DatasetStore::open(scenario.config.dataset_dir()).unwrap());
    let service = scenario
        .service(memory_store())
        .with_dataset_source(&scenario.config, fetcher, datasets, scenario.pool.clone())
        .unwrap();

    let err = service
        .get_product_mosaic(ABC, abc_date(), Product::Vnp46a1, "DNB_At_Sensor_Radiance_500m", false)
        .await
        .unwrap_err();
    assert!(matches!(err, NtlError::UpstreamFailure { status: 401, .. }));
}
