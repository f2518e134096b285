//! Single-band georeferenced rasters.

use std::borrow::Cow;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use ntl_common::{BoundingBox, CrsCode};

use crate::error::{MosaicError, Result};

/// Relative tolerance when comparing pixel sizes of different tiles.
const PIXEL_SIZE_TOLERANCE: f64 = 1e-9;

/// Affine mapping from pixel space to CRS coordinates (no rotation).
///
/// `origin_x`/`origin_y` is the outer corner of the top-left pixel.
/// `pixel_height` is negative for north-up rasters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        }
    }

    /// CRS coordinates of the center of pixel `(col, row)`.
    #[inline]
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y + (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Fractional pixel coordinates of a CRS point.
    #[inline]
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }

    /// Extent covered by a `width` x `height` grid.
    pub fn bounds(&self, width: usize, height: usize) -> BoundingBox {
        let x1 = self.origin_x + width as f64 * self.pixel_width;
        let y1 = self.origin_y + height as f64 * self.pixel_height;
        BoundingBox::new(
            self.origin_x.min(x1),
            self.origin_y.min(y1),
            self.origin_x.max(x1),
            self.origin_y.max(y1),
        )
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (self.pixel_width, self.pixel_height)
    }

    pub fn same_resolution(&self, other: &GeoTransform) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= PIXEL_SIZE_TOLERANCE * a.abs().max(b.abs());
        close(self.pixel_width, other.pixel_width) && close(self.pixel_height, other.pixel_height)
    }

    /// Transform of the sub-grid starting at `(col, row)`.
    pub fn shifted(&self, col: usize, row: usize) -> GeoTransform {
        GeoTransform {
            origin_x: self.origin_x + col as f64 * self.pixel_width,
            origin_y: self.origin_y + row as f64 * self.pixel_height,
            ..*self
        }
    }

    /// Transform with pixels `factor` times larger.
    pub fn scaled(&self, factor: usize) -> GeoTransform {
        GeoTransform {
            pixel_width: self.pixel_width * factor as f64,
            pixel_height: self.pixel_height * factor as f64,
            ..*self
        }
    }
}

/// A row-major, top-to-bottom single-band grid.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRaster<T> {
    pub width: usize,
    pub height: usize,
    pub data: Vec<T>,
    pub transform: GeoTransform,
    pub crs: CrsCode,
}

impl<T: Copy + Send + Sync> TileRaster<T> {
    pub fn new(width: usize, height: usize, data: Vec<T>, transform: GeoTransform, crs: CrsCode) -> Result<Self> {
        if data.len() != width * height {
            return Err(MosaicError::ShapeMismatch {
                expected: width * height,
                found: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
            transform,
            crs,
        })
    }

    pub fn filled(width: usize, height: usize, value: T, transform: GeoTransform, crs: CrsCode) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
            transform,
            crs,
        }
    }

    #[inline]
    pub fn get(&self, col: usize, row: usize) -> Option<T> {
        if col < self.width && row < self.height {
            Some(self.data[row * self.width + col])
        } else {
            None
        }
    }

    pub fn bbox(&self) -> BoundingBox {
        self.transform.bounds(self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element-wise conversion keeping the georeferencing.
    pub fn map<U, F>(&self, f: F) -> TileRaster<U>
    where
        U: Copy + Send,
        F: Fn(T) -> U + Sync + Send,
    {
        TileRaster {
            width: self.width,
            height: self.height,
            data: self.data.par_iter().map(|&v| f(v)).collect(),
            transform: self.transform,
            crs: self.crs,
        }
    }

    /// The same grid with rows running north to south and columns west to
    /// east. Already north-up rasters are borrowed.
    pub fn north_up(&self) -> Cow<'_, TileRaster<T>> {
        let t = self.transform;
        let flip_rows = t.pixel_height > 0.0;
        let flip_cols = t.pixel_width < 0.0;
        if !flip_rows && !flip_cols {
            return Cow::Borrowed(self);
        }

        let mut data = Vec::with_capacity(self.data.len());
        for r in 0..self.height {
            let src = if flip_rows { self.height - 1 - r } else { r };
            let row = &self.data[src * self.width..(src + 1) * self.width];
            if flip_cols {
                data.extend(row.iter().rev().copied());
            } else {
                data.extend_from_slice(row);
            }
        }

        let bounds = self.bbox();
        Cow::Owned(TileRaster {
            width: self.width,
            height: self.height,
            data,
            transform: GeoTransform::new(bounds.min_x, bounds.max_y, t.pixel_width.abs(), -t.pixel_height.abs()),
            crs: self.crs,
        })
    }

    /// Copy of the `width` x `height` window starting at `(col, row)`.
    ///
    /// The window must lie inside the raster.
    pub fn window(&self, col: usize, row: usize, width: usize, height: usize) -> TileRaster<T> {
        let mut data = Vec::with_capacity(width * height);
        for r in row..row + height {
            let start = r * self.width + col;
            data.extend_from_slice(&self.data[start..start + width]);
        }
        TileRaster {
            width,
            height,
            data,
            transform: self.transform.shifted(col, row),
            crs: self.crs,
        }
    }
}

impl TileRaster<f32> {
    /// The 1x1 all-nodata raster returned when there is nothing to merge.
    pub fn placeholder(crs: CrsCode) -> Self {
        Self::filled(1, 1, f32::NAN, GeoTransform::new(0.0, 0.0, 1.0, -1.0), crs)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    pub fn is_all_nodata(&self) -> bool {
        self.data.iter().all(|v| v.is_nan())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_center_north_up() {
        let t = GeoTransform::new(10.0, 20.0, 0.5, -0.5);
        assert_eq!(t.pixel_center(0, 0), (10.25, 19.75));
        assert_eq!(t.pixel_center(3, 1), (11.75, 19.25));
        assert_eq!(t.bounds(4, 2), BoundingBox::new(10.0, 19.0, 12.0, 20.0));
    }

    #[test]
    fn test_new_rejects_bad_shape() {
        let t = GeoTransform::new(0.0, 0.0, 1.0, -1.0);
        let err = TileRaster::new(2, 2, vec![0u32; 3], t, CrsCode::Epsg4326).unwrap_err();
        assert!(matches!(err, MosaicError::ShapeMismatch { expected: 4, found: 3 }));
    }

    #[test]
    fn test_window_shifts_transform() {
        let t = GeoTransform::new(0.0, 4.0, 1.0, -1.0);
        let raster = TileRaster::new(4, 4, (0..16u32).collect(), t, CrsCode::Epsg4326).unwrap();
        let w = raster.window(1, 2, 2, 2);
        assert_eq!(w.data, vec![9, 10, 13, 14]);
        assert_eq!(w.transform.origin_x, 1.0);
        assert_eq!(w.transform.origin_y, 2.0);
    }

    #[test]
    fn test_resolution_tolerance() {
        let a = GeoTransform::new(0.0, 0.0, 0.001, -0.001);
        let b = GeoTransform::new(5.0, 5.0, 0.001 + 1e-15, -0.001);
        let c = GeoTransform::new(0.0, 0.0, 0.002, -0.002);
        assert!(a.same_resolution(&b));
        assert!(!a.same_resolution(&c));
    }

    #[test]
    fn test_north_up_flips_south_up_rows() {
        // Origin at the bottom-left corner, rows running north
        let t = GeoTransform::new(0.0, 0.0, 1.0, 1.0);
        let raster = TileRaster::new(2, 2, vec![1u32, 2, 3, 4], t, CrsCode::Epsg4326).unwrap();
        let flipped = raster.north_up();

        assert_eq!(flipped.data, vec![3, 4, 1, 2]);
        assert_eq!(flipped.transform, GeoTransform::new(0.0, 2.0, 1.0, -1.0));
        assert_eq!(flipped.bbox(), raster.bbox());

        let already = TileRaster::new(2, 1, vec![1u32, 2], GeoTransform::new(0.0, 1.0, 1.0, -1.0), CrsCode::Epsg4326)
            .unwrap();
        assert!(matches!(already.north_up(), Cow::Borrowed(_)));
    }
}
