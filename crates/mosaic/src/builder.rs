//! Per-tile preparation and final mosaic assembly.

use tracing::{debug, info};

use ntl_common::{CrsCode, MultiPolygon, Percentiles, Polygon};

use crate::downsample::{coarsen, DownsampleMethod};
use crate::error::Result;
use crate::geotiff;
use crate::mask::{apply_footprint, clip_to_region};
use crate::merge::merge;
use crate::radiometry;
use crate::raster::TileRaster;
use crate::stats::percentile_stretch;

/// A merged, region-clipped raster with its display stretch.
#[derive(Debug, Clone)]
pub struct Mosaic {
    pub raster: TileRaster<f32>,
    pub percentiles: Percentiles,
}

impl Mosaic {
    /// Wrap a finished raster, computing its percentiles.
    pub fn from_raster(raster: TileRaster<f32>) -> Self {
        let percentiles = percentile_stretch(&raster.data);
        Self { raster, percentiles }
    }

    pub fn to_geotiff(&self) -> Result<Vec<u8>> {
        geotiff::encode(&self.raster)
    }
}

/// Convert a raw tile to radiance and blank everything outside its footprint.
///
/// `footprint` must be in the tile CRS.
pub fn prepare_tile<T>(raw: &TileRaster<T>, footprint: &Polygon) -> TileRaster<f32>
where
    T: Copy + Send + Sync + Into<f64>,
{
    let mut tile = radiometry::convert(raw);
    apply_footprint(&mut tile, footprint);
    tile
}

/// Options for [`assemble`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AssembleOptions {
    /// Coarsening factor applied after merge; 1 or 0 disables it.
    pub downsample_factor: usize,
    pub downsample_method: DownsampleMethod,
}

/// Merge prepared tiles, optionally coarsen, clip to the region and compute
/// percentiles on the clipped image.
pub fn assemble(
    tiles: &[TileRaster<f32>],
    region: &MultiPolygon,
    region_crs: CrsCode,
    options: AssembleOptions,
) -> Result<Mosaic> {
    let merged = merge(tiles)?;
    let merged = if options.downsample_factor > 1 {
        coarsen(&merged, options.downsample_factor, options.downsample_method)?
    } else {
        merged
    };

    let clipped = if tiles.is_empty() {
        merged
    } else {
        clip_to_region(&merged, region, region_crs)
    };
    debug!(width = clipped.width, height = clipped.height, "Clipped mosaic");

    let mosaic = Mosaic::from_raster(clipped);
    info!(
        tiles = tiles.len(),
        valid_pixels = mosaic.raster.valid_count(),
        p02 = mosaic.percentiles.p02,
        p98 = mosaic.percentiles.p98,
        "Assembled mosaic"
    );
    Ok(mosaic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::GeoTransform;
    use ntl_common::BoundingBox;

    #[test]
    fn test_assemble_without_tiles() {
        let region = MultiPolygon::from(Polygon::rectangle(&BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
        let mosaic = assemble(&[], &region, CrsCode::Epsg4326, AssembleOptions::default()).unwrap();
        assert_eq!((mosaic.raster.width, mosaic.raster.height), (1, 1));
        assert_eq!(mosaic.percentiles, Percentiles::new(0.0, 0.0));
    }

    #[test]
    fn test_prepare_tile_masks_after_conversion() {
        let raw = TileRaster::filled(4, 4, 100u32, GeoTransform::new(0.0, 4.0, 1.0, -1.0), CrsCode::Epsg4326);
        let footprint = Polygon::rectangle(&BoundingBox::new(0.0, 0.0, 2.0, 4.0));
        let tile = prepare_tile(&raw, &footprint);
        assert!((tile.get(0, 0).unwrap() - 1e-7).abs() < 1e-12);
        assert!(tile.get(3, 0).unwrap().is_nan());
        assert_eq!(tile.valid_count(), 8);
    }
}
