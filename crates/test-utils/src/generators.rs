//! Generators for synthetic tiles, descriptors and regions.
//!
//! Values are predictable so tests can check exactly which tile contributed
//! each pixel.

use std::path::{Path, PathBuf};

use mosaic::{GeoTransform, TileRaster};
use ntl_common::{BoundingBox, CrsCode, MultiPolygon, Polygon};
use tile_index::{Corners, RegionGeometry};

/// Creates a test grid with predictable values.
///
/// Each cell value is `col * 1000 + row`, row-major.
///
/// ```
/// use test_utils::create_test_grid;
///
/// let grid = create_test_grid(10, 5);
/// assert_eq!(grid.len(), 50);
/// assert_eq!(grid[1], 1000);  // col=1, row=0
/// assert_eq!(grid[10], 1);    // col=0, row=1
/// ```
pub fn create_test_grid(width: usize, height: usize) -> Vec<u32> {
    let mut data = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            data.push((col * 1000 + row) as u32);
        }
    }
    data
}

/// Grid origin and shape covering `bbox` at `pixel` degrees.
pub fn grid_for(bbox: &BoundingBox, pixel: f64) -> (GeoTransform, usize, usize) {
    let width = (bbox.width() / pixel).round() as usize;
    let height = (bbox.height() / pixel).round() as usize;
    (GeoTransform::new(bbox.min_x, bbox.max_y, pixel, -pixel), width, height)
}

/// A raw tile over `bbox` with every pixel set to `value`.
pub fn uniform_tile(bbox: &BoundingBox, pixel: f64, value: u32) -> TileRaster<u32> {
    let (transform, width, height) = grid_for(bbox, pixel);
    TileRaster::filled(width, height, value, transform, CrsCode::Epsg4326)
}

/// A raw tile over `bbox` filled with [`create_test_grid`] values.
pub fn gradient_tile(bbox: &BoundingBox, pixel: f64) -> TileRaster<u32> {
    let (transform, width, height) = grid_for(bbox, pixel);
    TileRaster {
        width,
        height,
        data: create_test_grid(width, height),
        transform,
        crs: CrsCode::Epsg4326,
    }
}

/// Encode `tile` as a GeoTIFF at `path`.
pub fn write_tile_geotiff(path: &Path, tile: &TileRaster<u32>) -> PathBuf {
    let bytes = mosaic::geotiff::encode(tile).expect("encode tile");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create tile dir");
    }
    std::fs::write(path, bytes).expect("write tile");
    path.to_path_buf()
}

/// Corners of an axis-aligned footprint.
pub fn rect_corners(bbox: &BoundingBox) -> Corners {
    Corners {
        lt: (bbox.min_x, bbox.max_y),
        rt: (bbox.max_x, bbox.max_y),
        rb: (bbox.max_x, bbox.min_y),
        lb: (bbox.min_x, bbox.min_y),
    }
}

/// A descriptor document in the layout the index parses.
pub fn descriptor_xml(imaging_time: &str, corners: &Corners) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ProductMetaData>
  <ProductInfo>
    <imagingTime>{time}</imagingTime>
  </ProductInfo>
  <ImageGeoInfo>
    <LTLongitude>{}</LTLongitude>
    <LTLatitude>{}</LTLatitude>
    <RTLongitude>{}</RTLongitude>
    <RTLatitude>{}</RTLatitude>
    <RBLongitude>{}</RBLongitude>
    <RBLatitude>{}</RBLatitude>
    <LBLongitude>{}</LBLongitude>
    <LBLatitude>{}</LBLatitude>
  </ImageGeoInfo>
</ProductMetaData>
"#,
        corners.lt.0,
        corners.lt.1,
        corners.rt.0,
        corners.rt.1,
        corners.rb.0,
        corners.rb.1,
        corners.lb.0,
        corners.lb.1,
        time = imaging_time,
    )
}

/// Write `<dir>/<tile_id>_meta.xml`.
pub fn write_descriptor(dir: &Path, tile_id: &str, imaging_time: &str, corners: &Corners) -> PathBuf {
    std::fs::create_dir_all(dir).expect("create metadata dir");
    let path = dir.join(format!("{}_meta.xml", tile_id));
    std::fs::write(&path, descriptor_xml(imaging_time, corners)).expect("write descriptor");
    path
}

/// A geographic region made of one rectangle.
pub fn rect_region(id: &str, bbox: &BoundingBox) -> RegionGeometry {
    RegionGeometry::new(
        id,
        MultiPolygon::from(Polygon::rectangle(bbox)),
        CrsCode::Epsg4326,
    )
}
