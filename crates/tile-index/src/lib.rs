//! Tile footprint index and region boundaries.
//!
//! Night-light tiles are granules whose true footprint is a rotated
//! quadrilateral. Each tile ships with an XML descriptor (`<tile>_meta.xml`)
//! carrying the capture time and the four corner coordinates. This crate
//! turns those descriptors into a queryable [`TileIndex`] and answers
//! "which tiles cover region R on date D".
//!
//! ```text
//! *_meta.xml ──► parse_descriptor ──► TileFootprint ──► TileIndex
//!                     │                                    │
//!                     └─ malformed: warn + skip            ├─► lookup(region, dates)
//!                                                          └─► available_dates(region)
//! ```

pub mod boundary;
pub mod footprint;
pub mod index;

pub use boundary::{BoundaryProvider, GeoJsonBoundaries, RegionGeometry, Resolution, StaticBoundaries};
pub use footprint::{parse_descriptor, parse_imaging_time, Corners, DescriptorError, TileFootprint};
pub use index::{DateSelection, IndexStats, TileIndex};
