//! Storage for mosaic artifacts.
//!
//! Provides unified interfaces for:
//! - The [`ArtifactStore`] contract and its backends: in-process LRU,
//!   Redis, and a filesystem layout of `mosaic.tif` + `mosaic.json`
//! - Zarr persistence of full alternate-source datasets ([`DatasetStore`])
//!
//! Every backend writes raster and percentiles all-or-nothing and reports
//! inconsistent entries as [`StorageError::Corrupt`].

pub mod artifact;
pub mod dataset;
pub mod entry;
pub mod error;
pub mod filesystem;
pub mod key;
pub mod memory;
pub mod redis_store;

pub use artifact::ArtifactStore;
pub use dataset::{Dataset, DatasetStore};
pub use entry::{CacheEntry, Sidecar};
pub use error::{Result, StorageError};
pub use filesystem::FsArtifactStore;
pub use key::CacheKey;
pub use memory::MemoryArtifactStore;
pub use redis_store::RedisArtifactStore;
