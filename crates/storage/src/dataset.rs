//! Zarr persistence of full alternate-source datasets.
//!
//! The alternate source delivers a whole pre-mosaicked grid per date. The
//! unclipped grid is kept as a Zarr V3 array next to the rendered artifact
//! so a later clip of a different region or a re-render does not have to
//! fetch it again:
//!
//! ```text
//! {root}/{region}/{date}/{variable}/{product}/dataset.zarr
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs_filesystem::FilesystemStore;

use mosaic::{GeoTransform, TileRaster};
use ntl_common::CrsCode;

use crate::error::{Result, StorageError};
use crate::key::CacheKey;

const ARRAY_DIR: &str = "dataset.zarr";
const STAGING_DIR: &str = ".staging";
/// Chunk edge length of stored arrays.
pub const CHUNK_SIZE: u64 = 512;

/// One variable of an alternate-source product for one date.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub product: String,
    pub variable: String,
    pub date: NaiveDate,
    pub raster: TileRaster<f32>,
}

/// Filesystem-backed Zarr store of [`Dataset`]s.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    /// Open a store rooted at `root`, removing unfinished writes.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        remove_if_present(&root.join(STAGING_DIR))?;
        Ok(Self { root })
    }

    pub fn dataset_dir(&self, key: &CacheKey) -> Result<PathBuf> {
        Ok(self.root.join(key.relative_path()?).join(ARRAY_DIR))
    }

    /// Persist a dataset, replacing any previous one for `key`.
    pub fn write(&self, key: &CacheKey, dataset: &Dataset) -> Result<()> {
        let target = self.dataset_dir(key)?;
        let staging = self.root.join(STAGING_DIR).join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&staging)?;

        if let Err(e) = write_array(&staging, dataset) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        remove_if_present(&target)?;
        std::fs::rename(&staging, &target)?;

        info!(
            key = %key,
            width = dataset.raster.width,
            height = dataset.raster.height,
            "Stored dataset as Zarr"
        );
        Ok(())
    }

    /// Load a dataset, `None` if it was never stored.
    pub fn read(&self, key: &CacheKey) -> Result<Option<Dataset>> {
        let dir = self.dataset_dir(key)?;
        if !dir.exists() {
            return Ok(None);
        }
        read_array(&dir).map(Some).map_err(|e| match e {
            StorageError::Zarr(reason) => StorageError::corrupt(key, reason),
            other => other,
        })
    }

    pub fn evict(&self, key: &CacheKey) -> Result<()> {
        remove_if_present(&self.dataset_dir(key)?)?;
        debug!(key = %key, "Evicted dataset");
        Ok(())
    }
}

fn remove_if_present(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn zarr_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Zarr(e.to_string())
}

fn write_array(dir: &Path, dataset: &Dataset) -> Result<()> {
    let raster = &dataset.raster;
    let t = &raster.transform;
    let store = Arc::new(FilesystemStore::new(dir).map_err(zarr_err)?);

    let mut attrs = Map::new();
    attrs.insert("product".to_string(), json!(dataset.product));
    attrs.insert("variable".to_string(), json!(dataset.variable));
    attrs.insert("date".to_string(), json!(dataset.date.format("%Y-%m-%d").to_string()));
    attrs.insert("crs".to_string(), json!(raster.crs.to_string()));
    attrs.insert(
        "geotransform".to_string(),
        json!([t.origin_x, t.pixel_width, t.origin_y, t.pixel_height]),
    );

    let chunk_grid: zarrs::array::ChunkGrid = vec![CHUNK_SIZE, CHUNK_SIZE]
        .try_into()
        .map_err(|e| StorageError::Zarr(format!("{:?}", e)))?;

    let array = ArrayBuilder::new(
        vec![raster.height as u64, raster.width as u64],
        DataType::Float32,
        chunk_grid,
        FillValue::from(f32::NAN),
    )
    .attributes(attrs)
    .build(store, "/")
    .map_err(zarr_err)?;

    array.store_metadata().map_err(zarr_err)?;

    let subset = ArraySubset::new_with_start_shape(
        vec![0, 0],
        vec![raster.height as u64, raster.width as u64],
    )
    .map_err(zarr_err)?;
    array
        .store_array_subset_elements(&subset, &raster.data)
        .map_err(zarr_err)?;

    Ok(())
}

fn read_array(dir: &Path) -> Result<Dataset> {
    let store = Arc::new(FilesystemStore::new(dir).map_err(zarr_err)?);
    let array = Array::open(store, "/").map_err(zarr_err)?;

    let shape = array.shape().to_vec();
    if shape.len() != 2 {
        return Err(StorageError::Zarr(format!("expected 2D array, got shape {:?}", shape)));
    }
    let (height, width) = (shape[0] as usize, shape[1] as usize);

    let attrs = array.attributes();
    let text = |name: &str| -> Result<String> {
        attrs
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StorageError::Zarr(format!("missing attribute {}", name)))
    };

    let gt: Vec<f64> = attrs
        .get("geotransform")
        .and_then(Value::as_array)
        .map(|v| v.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default();
    if gt.len() != 4 {
        return Err(StorageError::Zarr("missing or malformed geotransform".to_string()));
    }
    let transform = GeoTransform::new(gt[0], gt[2], gt[1], gt[3]);

    let crs = CrsCode::parse(&text("crs")?).map_err(zarr_err)?;
    let date = NaiveDate::parse_from_str(&text("date")?, "%Y-%m-%d").map_err(zarr_err)?;

    let subset = ArraySubset::new_with_start_shape(vec![0, 0], shape.clone()).map_err(zarr_err)?;
    let data: Vec<f32> = array
        .retrieve_array_subset_elements(&subset)
        .map_err(zarr_err)?;

    let raster = TileRaster::new(width, height, data, transform, crs).map_err(zarr_err)?;
    if raster.is_all_nodata() {
        warn!(path = %dir.display(), "Stored dataset has no valid pixels");
    }

    Ok(Dataset {
        product: text("product")?,
        variable: text("variable")?,
        date,
        raster,
    })
}
