//! Administrative region boundaries.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use ntl_common::{BoundingBox, CrsCode, MultiPolygon, NtlError, NtlResult};

/// Feature property holding the region identifier.
pub const ADMIN_KEY: &str = "adm0_a3";

/// A region's boundary geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionGeometry {
    pub id: String,
    pub geometry: MultiPolygon,
    pub crs: CrsCode,
}

impl RegionGeometry {
    pub fn new(id: impl Into<String>, geometry: MultiPolygon, crs: CrsCode) -> Self {
        Self {
            id: id.into(),
            geometry,
            crs,
        }
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        self.geometry.bbox()
    }

    /// The same region expressed in another CRS.
    pub fn to_crs(&self, crs: CrsCode) -> RegionGeometry {
        if crs == self.crs {
            return self.clone();
        }
        RegionGeometry::new(self.id.clone(), self.geometry.transform(self.crs, crs), crs)
    }
}

/// Boundary detail tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "10m")]
    Fine,
    #[default]
    #[serde(rename = "50m")]
    Medium,
    #[serde(rename = "110m")]
    Coarse,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Fine => "10m",
            Resolution::Medium => "50m",
            Resolution::Coarse => "110m",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = NtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "10m" => Ok(Resolution::Fine),
            "50m" => Ok(Resolution::Medium),
            "110m" => Ok(Resolution::Coarse),
            other => Err(NtlError::ConfigError(format!(
                "unknown boundary resolution '{}', expected 10m, 50m or 110m",
                other
            ))),
        }
    }
}

/// Source of region geometries.
#[async_trait]
pub trait BoundaryProvider: Send + Sync {
    /// Resolve a region id. Unknown ids are `NotFound`.
    async fn get_region_geometry(&self, region_id: &str, resolution: Resolution) -> NtlResult<RegionGeometry>;
}

/// Boundaries read from `admin-areas_{res}.geojson.gz` feature collections.
pub struct GeoJsonBoundaries {
    dir: PathBuf,
    cache: RwLock<HashMap<(String, Resolution), Arc<RegionGeometry>>>,
}

impl GeoJsonBoundaries {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn file_for(&self, resolution: Resolution) -> PathBuf {
        self.dir
            .join(format!("admin-areas_{}.geojson.gz", resolution.as_str()))
    }

    fn load(path: &Path, region_id: &str) -> NtlResult<MultiPolygon> {
        let file = File::open(path).map_err(|e| {
            NtlError::NotFound(format!("boundary file {}: {}", path.display(), e))
        })?;
        let collection: Value = serde_json::from_reader(BufReader::new(GzDecoder::new(file)))
            .map_err(|e| NtlError::MalformedInput(format!("{}: {}", path.display(), e)))?;

        let features = collection
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                NtlError::MalformedInput(format!("{} is not a feature collection", path.display()))
            })?;

        let matches: Vec<&Value> = features
            .iter()
            .filter(|f| {
                f.get("properties")
                    .and_then(|p| p.get(ADMIN_KEY))
                    .and_then(Value::as_str)
                    == Some(region_id)
            })
            .collect();

        match matches.as_slice() {
            [] => Err(NtlError::NotFound(format!("no region with id {}", region_id))),
            [feature] => MultiPolygon::from_geojson(feature),
            many => Err(NtlError::InvalidRequest(format!(
                "region id {} is ambiguous ({} features)",
                region_id,
                many.len()
            ))),
        }
    }
}

#[async_trait]
impl BoundaryProvider for GeoJsonBoundaries {
    #[instrument(skip(self))]
    async fn get_region_geometry(&self, region_id: &str, resolution: Resolution) -> NtlResult<RegionGeometry> {
        let key = (region_id.to_string(), resolution);
        if let Some(hit) = self.cache.read().await.get(&key) {
            debug!("Boundary cache hit");
            return Ok(hit.as_ref().clone());
        }

        let path = self.file_for(resolution);
        let id = region_id.to_string();
        let geometry = tokio::task::spawn_blocking(move || Self::load(&path, &id))
            .await
            .map_err(|e| NtlError::InternalError(format!("boundary load task failed: {}", e)))??;

        let region = Arc::new(RegionGeometry::new(region_id, geometry, CrsCode::Epsg4326));
        info!(
            polygons = region.geometry.polygons.len(),
            "Loaded region boundary"
        );
        self.cache.write().await.insert(key, region.clone());

        Ok(region.as_ref().clone())
    }
}

/// Fixed in-memory boundaries, keyed by region id.
#[derive(Debug, Clone, Default)]
pub struct StaticBoundaries {
    regions: HashMap<String, RegionGeometry>,
}

impl StaticBoundaries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, region: RegionGeometry) -> Self {
        self.regions.insert(region.id.clone(), region);
        self
    }
}

#[async_trait]
impl BoundaryProvider for StaticBoundaries {
    async fn get_region_geometry(&self, region_id: &str, _resolution: Resolution) -> NtlResult<RegionGeometry> {
        self.regions
            .get(region_id)
            .cloned()
            .ok_or_else(|| NtlError::NotFound(format!("no region with id {}", region_id)))
    }
}
