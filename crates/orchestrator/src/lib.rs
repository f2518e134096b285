//! Cache-aware orchestration of night-light mosaics.
//!
//! [`MosaicService`] answers `get_mosaic(region, date, variable, no_cache)`
//! from an [`ArtifactStore`](storage::ArtifactStore) and, on a miss, runs the
//! selection, fetch and assembly pipeline on a shared [`WorkerPool`].
//! Concurrent misses for one key are coalesced into a single computation.

pub mod coalesce;
pub mod config;
pub mod fetch;
pub mod pipeline;
pub mod pool;
pub mod service;

pub use coalesce::{CoalescerStats, RequestCoalescer};
pub use config::{CacheBackend, MosaicConfig, Product, PRIMARY_VARIABLE};
pub use fetch::{DatasetFetcher, FetchConfig, HttpTileFetcher, TileFetcher};
pub use pipeline::{DatasetPipeline, TilePipeline};
pub use pool::WorkerPool;
pub use service::{open_artifact_store, MosaicArtifact, MosaicService};
