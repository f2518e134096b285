//! Nodata-aware union of masked tiles.

use rayon::prelude::*;
use tracing::debug;

use ntl_common::{BoundingBox, CrsCode};

use crate::error::{MosaicError, Result};
use crate::raster::{GeoTransform, TileRaster};

/// Merge masked tiles onto one grid covering their union.
///
/// A NaN never overwrites a valid value. Where several tiles have valid
/// values for the same pixel the largest wins, so the result does not depend
/// on input order. All tiles must share CRS and pixel size.
///
/// An empty input produces the 1x1 nodata placeholder.
pub fn merge(tiles: &[TileRaster<f32>]) -> Result<TileRaster<f32>> {
    let Some(first) = tiles.first() else {
        debug!("No tiles to merge, returning placeholder");
        return Ok(TileRaster::placeholder(CrsCode::default()));
    };

    check_compatible(tiles)?;

    let (pixel_width, pixel_height) = first.transform.pixel_size();
    let extent = tiles
        .iter()
        .map(TileRaster::bbox)
        .reduce(|a, b| a.union(&b))
        .unwrap_or_else(|| first.bbox());

    let transform = output_transform(&extent, pixel_width, pixel_height);
    let width = (extent.width() / pixel_width.abs()).round().max(1.0) as usize;
    let height = (extent.height() / pixel_height.abs()).round().max(1.0) as usize;

    // Pixel offset of each tile inside the output grid
    let placements: Vec<(isize, isize, &TileRaster<f32>)> = tiles
        .iter()
        .map(|t| {
            let (col, row) = transform.to_pixel(t.transform.origin_x, t.transform.origin_y);
            (col.round() as isize, row.round() as isize, t)
        })
        .collect();

    let mut data = vec![f32::NAN; width * height];
    data.par_chunks_mut(width)
        .enumerate()
        .for_each(|(row, out)| {
            let row = row as isize;
            for &(col0, row0, tile) in &placements {
                let local_row = row - row0;
                if local_row < 0 || local_row >= tile.height as isize {
                    continue;
                }
                let src = &tile.data[local_row as usize * tile.width..][..tile.width];
                for (i, &v) in src.iter().enumerate() {
                    let col = col0 + i as isize;
                    if v.is_nan() || col < 0 || col >= width as isize {
                        continue;
                    }
                    let cell = &mut out[col as usize];
                    if cell.is_nan() || v > *cell {
                        *cell = v;
                    }
                }
            }
        });

    debug!(tiles = tiles.len(), width, height, "Merged tiles");

    TileRaster::new(width, height, data, transform, first.crs)
}

fn check_compatible(tiles: &[TileRaster<f32>]) -> Result<()> {
    let first = &tiles[0];
    for (index, tile) in tiles.iter().enumerate().skip(1) {
        if tile.crs != first.crs {
            return Err(MosaicError::CrsMismatch {
                index,
                expected: first.crs,
                found: tile.crs,
            });
        }
        if !tile.transform.same_resolution(&first.transform) {
            return Err(MosaicError::ResolutionMismatch {
                index,
                expected: first.transform.pixel_size(),
                found: tile.transform.pixel_size(),
            });
        }
    }
    Ok(())
}

/// Top-left anchored transform keeping the tiles' pixel orientation.
fn output_transform(extent: &BoundingBox, pixel_width: f64, pixel_height: f64) -> GeoTransform {
    let origin_x = if pixel_width > 0.0 { extent.min_x } else { extent.max_x };
    let origin_y = if pixel_height < 0.0 { extent.max_y } else { extent.min_y };
    GeoTransform::new(origin_x, origin_y, pixel_width, pixel_height)
}
