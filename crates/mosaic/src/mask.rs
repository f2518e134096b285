//! Polygon masks over raster grids.
//!
//! A pixel is inside a polygon when its center is, using the even-odd rule
//! over all rings so holes are excluded. Rows are scan-converted
//! independently on the rayon pool.

use rayon::prelude::*;
use tracing::debug;

use ntl_common::{CrsCode, MultiPolygon, Point, Polygon};

use crate::raster::{GeoTransform, TileRaster};

/// Inside/outside flags for every pixel of a `width` x `height` grid.
pub fn rasterize(
    polygons: &[Polygon],
    transform: &GeoTransform,
    width: usize,
    height: usize,
) -> Vec<bool> {
    let mut mask = vec![false; width * height];
    if width == 0 || height == 0 {
        return mask;
    }

    mask.par_chunks_mut(width)
        .enumerate()
        .for_each(|(row, out)| {
            let (_, y) = transform.pixel_center(0, row);
            for polygon in polygons {
                fill_row(polygon, y, transform, out);
            }
        });

    mask
}

/// Mark the pixels of one row whose centers fall inside `polygon`.
fn fill_row(polygon: &Polygon, y: f64, transform: &GeoTransform, out: &mut [bool]) {
    let mut crossings: Vec<f64> = Vec::new();
    for ring in polygon.rings() {
        ring_crossings(ring, y, &mut crossings);
    }
    if crossings.len() < 2 {
        return;
    }
    crossings.sort_by(|a, b| a.total_cmp(b));

    let width = out.len();
    for span in crossings.chunks_exact(2) {
        let (c0, c1) = column_span(span[0], span[1], transform, width);
        for cell in &mut out[c0..c1] {
            *cell = true;
        }
    }
}

/// X coordinates where the horizontal line at `y` crosses the ring edges.
fn ring_crossings(ring: &[Point], y: f64, out: &mut Vec<f64>) {
    let n = ring.len();
    if n < 3 {
        return;
    }
    for i in 0..n {
        let (x1, y1) = ring[i];
        let (x2, y2) = ring[(i + 1) % n];
        // Half-open rule so shared vertices are counted once
        if (y1 > y) != (y2 > y) {
            out.push(x1 + (y - y1) * (x2 - x1) / (y2 - y1));
        }
    }
}

/// Columns whose centers lie in `[xa, xb)`, clamped to the grid.
fn column_span(xa: f64, xb: f64, transform: &GeoTransform, width: usize) -> (usize, usize) {
    let (pa, _) = transform.to_pixel(xa, transform.origin_y);
    let (pb, _) = transform.to_pixel(xb, transform.origin_y);
    let (lo, hi) = if pa <= pb { (pa, pb) } else { (pb, pa) };
    let clamp = |v: f64| v.max(0.0).min(width as f64) as usize;
    (clamp((lo - 0.5).ceil()), clamp((hi - 0.5).ceil()))
}

/// Set every pixel outside the tile's own footprint to NaN.
///
/// The footprint is given in the tile CRS. Applying the mask twice is the
/// same as applying it once.
pub fn apply_footprint(tile: &mut TileRaster<f32>, footprint: &Polygon) {
    let mask = rasterize(std::slice::from_ref(footprint), &tile.transform, tile.width, tile.height);
    tile.data
        .par_iter_mut()
        .zip(mask.par_iter())
        .for_each(|(v, &inside)| {
            if !inside {
                *v = f32::NAN;
            }
        });
}

/// Crop a raster to the region's extent and blank pixels outside the region.
///
/// A region in another CRS is reprojected into the raster CRS first. A
/// raster that does not overlap the region yields the 1x1 nodata placeholder.
pub fn clip_to_region(raster: &TileRaster<f32>, region: &MultiPolygon, region_crs: CrsCode) -> TileRaster<f32> {
    let region = if region_crs == raster.crs {
        region.clone()
    } else {
        region.transform(region_crs, raster.crs)
    };

    let Some(window) = region_window(raster, &region) else {
        debug!("Region does not overlap raster");
        return TileRaster::placeholder(raster.crs);
    };
    let (col, row, width, height) = window;

    let mut out = raster.window(col, row, width, height);
    let mask = rasterize(&region.polygons, &out.transform, out.width, out.height);
    out.data
        .par_iter_mut()
        .zip(mask.par_iter())
        .for_each(|(v, &inside)| {
            if !inside {
                *v = f32::NAN;
            }
        });

    debug!(
        width = out.width,
        height = out.height,
        valid = out.valid_count(),
        "Clipped raster to region"
    );
    out
}

/// Pixel window `(col, row, width, height)` covering the region's bbox.
fn region_window(raster: &TileRaster<f32>, region: &MultiPolygon) -> Option<(usize, usize, usize, usize)> {
    let extent = region.bbox()?.intersection(&raster.bbox())?;
    let t = &raster.transform;

    let (px0, py0) = t.to_pixel(extent.min_x, extent.max_y);
    let (px1, py1) = t.to_pixel(extent.max_x, extent.min_y);
    let (cx0, cx1) = (px0.min(px1), px0.max(px1));
    let (ry0, ry1) = (py0.min(py1), py0.max(py1));

    let col0 = (cx0.floor().max(0.0) as usize).min(raster.width);
    let col1 = (cx1.ceil().max(0.0) as usize).min(raster.width);
    let row0 = (ry0.floor().max(0.0) as usize).min(raster.height);
    let row1 = (ry1.ceil().max(0.0) as usize).min(raster.height);

    if col1 <= col0 || row1 <= row0 {
        return None;
    }
    Some((col0, row0, col1 - col0, row1 - row0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntl_common::BoundingBox;

    fn grid(width: usize, height: usize) -> TileRaster<f32> {
        TileRaster::filled(
            width,
            height,
            1.0,
            GeoTransform::new(0.0, height as f64, 1.0, -1.0),
            CrsCode::Epsg4326,
        )
    }

    #[test]
    fn test_rasterize_rectangle() {
        let rect = Polygon::rectangle(&BoundingBox::new(1.0, 1.0, 3.0, 3.0));
        let t = GeoTransform::new(0.0, 4.0, 1.0, -1.0);
        let mask = rasterize(&[rect], &t, 4, 4);
        let inside: Vec<usize> = mask.iter().enumerate().filter(|(_, &m)| m).map(|(i, _)| i).collect();
        assert_eq!(inside, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_rasterize_excludes_hole() {
        let outer = vec![(0.0, 0.0), (5.0, 0.0), (5.0, 5.0), (0.0, 5.0)];
        let hole = vec![(2.0, 2.0), (3.0, 2.0), (3.0, 3.0), (2.0, 3.0)];
        let polygon = Polygon::new(outer, vec![hole]);
        let t = GeoTransform::new(0.0, 5.0, 1.0, -1.0);
        let mask = rasterize(&[polygon], &t, 5, 5);
        assert_eq!(mask.iter().filter(|&&m| m).count(), 24);
        // Pixel (2, 2) has center (2.5, 2.5)
        assert!(!mask[2 * 5 + 2]);
    }

    #[test]
    fn test_footprint_mask_blanks_diamond_corners() {
        let mut tile = grid(10, 10);
        let diamond = Polygon::from_exterior(vec![(5.0, 10.0), (10.0, 5.0), (5.0, 0.0), (0.0, 5.0)]);
        apply_footprint(&mut tile, &diamond);

        assert!(tile.get(0, 0).unwrap().is_nan());
        assert!(tile.get(9, 9).unwrap().is_nan());
        assert_eq!(tile.get(5, 5), Some(1.0));
        assert_eq!(tile.get(4, 4), Some(1.0));
    }

    #[test]
    fn test_footprint_mask_idempotent() {
        let footprint = Polygon::from_exterior(vec![(1.3, 7.9), (8.2, 9.1), (9.0, 1.2), (0.4, 0.6)]);
        let mut once = grid(10, 10);
        apply_footprint(&mut once, &footprint);
        let mut twice = once.clone();
        apply_footprint(&mut twice, &footprint);

        let bits = |r: &TileRaster<f32>| r.data.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&once), bits(&twice));
    }

    #[test]
    fn test_clip_crops_to_region_extent() {
        let raster = grid(10, 10);
        let region = MultiPolygon::from(Polygon::rectangle(&BoundingBox::new(2.0, 3.0, 6.0, 5.0)));
        let clipped = clip_to_region(&raster, &region, CrsCode::Epsg4326);

        assert_eq!((clipped.width, clipped.height), (4, 2));
        assert_eq!(clipped.transform.origin_x, 2.0);
        assert_eq!(clipped.transform.origin_y, 5.0);
        assert_eq!(clipped.valid_count(), 8);
    }

    #[test]
    fn test_clip_without_overlap_is_placeholder() {
        let raster = grid(4, 4);
        let region = MultiPolygon::from(Polygon::rectangle(&BoundingBox::new(50.0, 50.0, 51.0, 51.0)));
        let clipped = clip_to_region(&raster, &region, CrsCode::Epsg4326);
        assert_eq!((clipped.width, clipped.height), (1, 1));
        assert!(clipped.is_all_nodata());
    }
}
