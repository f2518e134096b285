//! Night-light mosaic assembly.
//!
//! Raw tiles go through radiometric conversion, footprint masking, a
//! nodata-aware merge, region clipping and percentile computation before
//! being encoded as a GeoTIFF:
//!
//! ```text
//! TileRaster<f64> ─► radiometry::convert ─► mask::apply_footprint ─┐
//!                                                                  ▼
//!        geotiff::encode ◄── stats ◄── mask::clip_to_region ◄── merge
//! ```
//!
//! NaN is the only nodata sentinel. All CPU-heavy steps run on the current
//! rayon pool.

pub mod builder;
pub mod downsample;
pub mod error;
pub mod geotiff;
pub mod mask;
pub mod merge;
pub mod radiometry;
pub mod raster;
pub mod stats;

pub use builder::{assemble, prepare_tile, AssembleOptions, Mosaic};
pub use downsample::{coarsen, DownsampleMethod};
pub use error::{MosaicError, Result};
pub use raster::{GeoTransform, TileRaster};
pub use stats::{percentile_stretch, Percentiles};
