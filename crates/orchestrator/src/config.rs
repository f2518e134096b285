//! Configuration for the mosaic service.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mosaic::DownsampleMethod;
use ntl_common::{NtlError, NtlResult};
use tile_index::Resolution;

/// Default tile download location.
pub const DEFAULT_TILE_URL_PREFIX: &str =
    "https://polybox.ethz.ch/index.php/s/dnP82nHZkjR4gr7/download/file?path=%2F";

/// Default location of the descriptor archive.
pub const DEFAULT_METADATA_URL: &str =
    "https://polybox.ethz.ch/index.php/s/dnP82nHZkjR4gr7/download/file?path=%2Fmetadata%2FMETA.tar.gz";

/// Variable name used for primary-source mosaics.
pub const PRIMARY_VARIABLE: &str = "radiance";

/// Which [`ArtifactStore`](storage::ArtifactStore) backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Filesystem,
    Memory,
    Redis,
}

impl CacheBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Memory => "memory",
            Self::Redis => "redis",
        }
    }
}

impl FromStr for CacheBackend {
    type Err = NtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "filesystem" | "fs" => Ok(Self::Filesystem),
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(NtlError::ConfigError(format!("unknown cache backend: {}", other))),
        }
    }
}

impl std::fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Products of the pre-mosaicked alternate source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Product {
    /// Daily at-sensor radiance
    #[serde(rename = "VNP46A1")]
    Vnp46a1,
    /// Daily BRDF-corrected radiance
    #[default]
    #[serde(rename = "VNP46A2")]
    Vnp46a2,
    /// Monthly composite
    #[serde(rename = "VNP46A3")]
    Vnp46a3,
    /// Yearly composite
    #[serde(rename = "VNP46A4")]
    Vnp46a4,
}

impl Product {
    pub const ALL: [Product; 4] = [Self::Vnp46a1, Self::Vnp46a2, Self::Vnp46a3, Self::Vnp46a4];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vnp46a1 => "VNP46A1",
            Self::Vnp46a2 => "VNP46A2",
            Self::Vnp46a3 => "VNP46A3",
            Self::Vnp46a4 => "VNP46A4",
        }
    }

    /// Variable used when the caller does not name one.
    pub fn default_variable(&self) -> &'static str {
        match self {
            Self::Vnp46a1 => "DNB_At_Sensor_Radiance_500m",
            Self::Vnp46a2 => "Gap_Filled_DNB_BRDF-Corrected_NTL",
            Self::Vnp46a3 | Self::Vnp46a4 => "NearNadir_Composite_Snow_Free",
        }
    }
}

impl FromStr for Product {
    type Err = NtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == upper)
            .ok_or_else(|| NtlError::ConfigError(format!("unknown product: {}", s)))
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for [`MosaicService`](crate::MosaicService) and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosaicConfig {
    /// Root of all local data: tiles, metadata, cache and datasets.
    pub data_dir: PathBuf,

    /// Prefix prepended to `{tile_id}.tar.gz` when downloading tiles.
    pub tile_url_prefix: String,

    /// URL of the `META.tar.gz` descriptor archive.
    pub metadata_url: String,

    /// Maximum number of concurrent tile fetches per request.
    pub fetch_concurrency: usize,

    /// Per-tile fetch deadline. Late tiles are dropped from the mosaic.
    pub tile_timeout: Duration,

    /// Threads in the raster worker pool. 0 uses one per core.
    pub worker_threads: usize,

    /// Boundary precision used for region lookups.
    pub boundary_resolution: Resolution,

    pub cache_backend: CacheBackend,

    /// Required when `cache_backend` is Redis.
    pub redis_url: Option<String>,

    /// Capacity of the in-process LRU backend.
    pub memory_cache_entries: usize,

    /// Coarsening factor applied after merge; 1 disables it.
    pub downsample_factor: usize,

    pub downsample_method: DownsampleMethod,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            tile_url_prefix: DEFAULT_TILE_URL_PREFIX.to_string(),
            metadata_url: DEFAULT_METADATA_URL.to_string(),
            fetch_concurrency: 8,
            tile_timeout: Duration::from_secs(120),
            worker_threads: 0,
            boundary_resolution: Resolution::default(),
            cache_backend: CacheBackend::default(),
            redis_url: None,
            memory_cache_entries: 256,
            downsample_factor: 1,
            downsample_method: DownsampleMethod::default(),
        }
    }
}

impl MosaicConfig {
    /// Load configuration from environment variables, then validate it.
    ///
    /// Unset variables keep their defaults. A variable that is set but does
    /// not parse is a [`NtlError::ConfigError`].
    pub fn from_env() -> NtlResult<Self> {
        let mut config = Self::default();

        if let Some(dir) = env_var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = env_var("NTL_TILE_URL_PREFIX") {
            config.tile_url_prefix = prefix;
        }
        if let Some(url) = env_var("NTL_METADATA_URL") {
            config.metadata_url = url;
        }
        if let Some(n) = env_parse::<usize>("NTL_FETCH_CONCURRENCY")? {
            config.fetch_concurrency = n;
        }
        if let Some(secs) = env_parse::<u64>("NTL_TILE_TIMEOUT_SECS")? {
            config.tile_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("NTL_WORKER_THREADS")? {
            config.worker_threads = n;
        }
        if let Some(res) = env_parse::<Resolution>("NTL_BOUNDARY_RESOLUTION")? {
            config.boundary_resolution = res;
        }
        if let Some(backend) = env_parse::<CacheBackend>("NTL_CACHE_BACKEND")? {
            config.cache_backend = backend;
        }
        config.redis_url = env_var("REDIS_URL");
        if let Some(n) = env_parse::<usize>("NTL_MEMORY_CACHE_ENTRIES")? {
            config.memory_cache_entries = n;
        }
        if let Some(n) = env_parse::<usize>("NTL_DOWNSAMPLE_FACTOR")? {
            config.downsample_factor = n;
        }
        if let Some(method) = env_var("NTL_DOWNSAMPLE_METHOD") {
            config.downsample_method = method.parse().map_err(NtlError::ConfigError)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> NtlResult<()> {
        if self.fetch_concurrency == 0 {
            return Err(NtlError::ConfigError("fetch_concurrency must be > 0".to_string()));
        }
        if self.tile_timeout.is_zero() {
            return Err(NtlError::ConfigError("tile_timeout must be > 0".to_string()));
        }
        if self.downsample_factor == 0 {
            return Err(NtlError::ConfigError("downsample_factor must be >= 1".to_string()));
        }
        if self.cache_backend == CacheBackend::Memory && self.memory_cache_entries == 0 {
            return Err(NtlError::ConfigError("memory_cache_entries must be > 0".to_string()));
        }
        if self.cache_backend == CacheBackend::Redis && self.redis_url.is_none() {
            return Err(NtlError::ConfigError(
                "REDIS_URL is required for the redis cache backend".to_string(),
            ));
        }
        for (name, url) in [("tile_url_prefix", &self.tile_url_prefix), ("metadata_url", &self.metadata_url)] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(NtlError::ConfigError(format!("{} must be an http(s) URL: {}", name, url)));
            }
        }
        Ok(())
    }

    pub fn luojia_dir(&self) -> PathBuf {
        self.data_dir.join("luojia")
    }

    /// Directory of `*_meta.xml` tile descriptors.
    pub fn metadata_dir(&self) -> PathBuf {
        self.luojia_dir().join("metadata")
    }

    /// Directory of downloaded tile rasters.
    pub fn tiles_dir(&self) -> PathBuf {
        self.luojia_dir().join("tiles")
    }

    /// Root of the filesystem artifact store.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Root of the alternate-source Zarr datasets.
    pub fn dataset_dir(&self) -> PathBuf {
        self.data_dir.join("blackmarble").join("preprocessed")
    }

    /// Directory of `admin-areas_{res}.geojson.gz` boundary files.
    pub fn boundaries_dir(&self) -> PathBuf {
        self.data_dir.join("admin_areas")
    }

    /// Create every derived directory.
    pub fn ensure_dirs(&self) -> NtlResult<()> {
        for dir in [self.metadata_dir(), self.tiles_dir(), self.cache_dir(), self.dataset_dir()] {
            create_dir(&dir)?;
        }
        Ok(())
    }
}

fn create_dir(dir: &Path) -> NtlResult<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| NtlError::ConfigError(format!("cannot create {}: {}", dir.display(), e)))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> NtlResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| NtlError::ConfigError(format!("{}={:?}: {}", name, val, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MosaicConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fetch_concurrency, 8);
        assert!(config.metadata_url.ends_with("META.tar.gz"));
    }

    #[test]
    fn test_derived_dirs() {
        let config = MosaicConfig {
            data_dir: PathBuf::from("/srv/ntl"),
            ..Default::default()
        };
        assert_eq!(config.metadata_dir(), PathBuf::from("/srv/ntl/luojia/metadata"));
        assert_eq!(config.tiles_dir(), PathBuf::from("/srv/ntl/luojia/tiles"));
        assert_eq!(config.cache_dir(), PathBuf::from("/srv/ntl/cache"));
        assert_eq!(config.dataset_dir(), PathBuf::from("/srv/ntl/blackmarble/preprocessed"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = MosaicConfig {
            fetch_concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(NtlError::ConfigError(_))));

        let redis = MosaicConfig {
            cache_backend: CacheBackend::Redis,
            ..Default::default()
        };
        assert!(matches!(redis.validate(), Err(NtlError::ConfigError(_))));

        let factor = MosaicConfig {
            downsample_factor: 0,
            ..Default::default()
        };
        assert!(factor.validate().is_err());

        let metadata = MosaicConfig {
            metadata_url: "ftp://host/META.tar.gz".to_string(),
            ..Default::default()
        };
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn test_product_table() {
        assert_eq!("vnp46a1".parse::<Product>().unwrap(), Product::Vnp46a1);
        assert_eq!(Product::Vnp46a4.default_variable(), "NearNadir_Composite_Snow_Free");
        assert!("VNP99".parse::<Product>().is_err());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("REDIS".parse::<CacheBackend>().unwrap(), CacheBackend::Redis);
        assert_eq!(" fs ".parse::<CacheBackend>().unwrap(), CacheBackend::Filesystem);
        assert!("s3".parse::<CacheBackend>().is_err());
    }
}
