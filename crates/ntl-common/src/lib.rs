//! Common types shared across the night-light mosaic crates.
//!
//! - [`BoundingBox`] axis-aligned extents
//! - [`CrsCode`] the coordinate systems the pipeline understands
//! - [`Polygon`] / [`MultiPolygon`] region and footprint geometry
//! - [`Percentiles`] display stretch bounds stored with each mosaic
//! - [`NtlError`] the error type surfaced to callers

pub mod bbox;
pub mod crs;
pub mod error;
pub mod geometry;
pub mod percentiles;

pub use bbox::BoundingBox;
pub use crs::CrsCode;
pub use error::{NtlError, NtlResult};
pub use geometry::{MultiPolygon, Point, Polygon};
pub use percentiles::Percentiles;
