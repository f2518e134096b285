//! Index and boundary loading against files on disk.

use std::io::Write;
use std::path::Path;

use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

use ntl_common::{BoundingBox, CrsCode, MultiPolygon, NtlError, Polygon};
use tile_index::{BoundaryProvider, GeoJsonBoundaries, RegionGeometry, Resolution, TileIndex};

fn descriptor(time: &str, bbox: &BoundingBox) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ProductMetaData>
  <ProductInfo><imagingTime>{time}</imagingTime></ProductInfo>
  <ImageGeoInfo>
    <LTLongitude>{min_x}</LTLongitude><LTLatitude>{max_y}</LTLatitude>
    <RTLongitude>{max_x}</RTLongitude><RTLatitude>{max_y}</RTLatitude>
    <RBLongitude>{max_x}</RBLongitude><RBLatitude>{min_y}</RBLatitude>
    <LBLongitude>{min_x}</LBLongitude><LBLatitude>{min_y}</LBLatitude>
  </ImageGeoInfo>
</ProductMetaData>
"#,
        time = time,
        min_x = bbox.min_x,
        min_y = bbox.min_y,
        max_x = bbox.max_x,
        max_y = bbox.max_y,
    )
}

fn region(bbox: &BoundingBox) -> RegionGeometry {
    RegionGeometry::new(
        "R",
        MultiPolygon::new(vec![Polygon::rectangle(bbox)]),
        CrsCode::Epsg4326,
    )
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn test_from_dir_indexes_nested_descriptors_and_skips_bad_ones() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("2020").join("01");
    std::fs::create_dir_all(&nested).unwrap();

    let west = BoundingBox::new(0.0, 0.0, 2.0, 2.0);
    let east = BoundingBox::new(10.0, 0.0, 12.0, 2.0);
    std::fs::write(nested.join("W1_meta.xml"), descriptor("2020-1-1T3:15:02.5", &west)).unwrap();
    std::fs::write(nested.join("E1_meta.xml"), descriptor("2020-01-02T03:16:10", &east)).unwrap();
    std::fs::write(dir.path().join("BAD_meta.xml"), "<ProductMetaData/>").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not a descriptor").unwrap();

    let index = TileIndex::from_dir(dir.path()).unwrap();
    let stats = index.stats();
    assert_eq!(stats.tiles, 2);
    assert_eq!(stats.dates, 2);
    assert_eq!(stats.skipped, 1);

    let west_region = region(&BoundingBox::new(1.0, 1.0, 3.0, 3.0));
    let hits = index.lookup(&west_region, date(2020, 1, 1));
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].tile_id, "W1");

    assert!(index.lookup(&west_region, date(2020, 1, 2)).is_empty());
    assert_eq!(index.available_dates(&west_region), vec![date(2020, 1, 1)]);

    let both = region(&BoundingBox::new(-5.0, -5.0, 20.0, 5.0));
    assert_eq!(
        index.available_dates(&both),
        vec![date(2020, 1, 1), date(2020, 1, 2)]
    );
}

#[test]
fn test_from_dir_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let err = TileIndex::from_dir(dir.path().join("absent")).unwrap_err();
    assert!(matches!(err, NtlError::NotFound(_)));
}

fn square(x: f64) -> serde_json::Value {
    json!([[[x, 0.0], [x + 1.0, 0.0], [x + 1.0, 1.0], [x, 1.0], [x, 0.0]]])
}

fn write_boundaries(dir: &Path, resolution: Resolution) {
    let collection = json!({
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": { "adm0_a3": "ABC" },
                "geometry": { "type": "Polygon", "coordinates": square(0.0) }
            },
            {
                "type": "Feature",
                "properties": { "adm0_a3": "ISL" },
                "geometry": { "type": "MultiPolygon", "coordinates": [square(5.0), square(8.0)] }
            },
            {
                "type": "Feature",
                "properties": { "adm0_a3": "DUP" },
                "geometry": { "type": "Polygon", "coordinates": square(20.0) }
            },
            {
                "type": "Feature",
                "properties": { "adm0_a3": "DUP" },
                "geometry": { "type": "Polygon", "coordinates": square(30.0) }
            }
        ]
    });

    let path = dir.join(format!("admin-areas_{}.geojson.gz", resolution.as_str()));
    let mut encoder = GzEncoder::new(std::fs::File::create(path).unwrap(), Compression::default());
    encoder
        .write_all(serde_json::to_vec(&collection).unwrap().as_slice())
        .unwrap();
    encoder.finish().unwrap();
}

#[tokio::test]
async fn test_geojson_boundaries_resolve_regions() {
    let dir = tempfile::tempdir().unwrap();
    write_boundaries(dir.path(), Resolution::Medium);
    let boundaries = GeoJsonBoundaries::new(dir.path());

    let abc = boundaries
        .get_region_geometry("ABC", Resolution::Medium)
        .await
        .unwrap();
    assert_eq!(abc.id, "ABC");
    assert_eq!(abc.crs, CrsCode::Epsg4326);
    assert_eq!(abc.geometry.polygons.len(), 1);
    assert!(abc.geometry.contains_point(0.5, 0.5));

    let islands = boundaries
        .get_region_geometry("ISL", Resolution::Medium)
        .await
        .unwrap();
    assert_eq!(islands.geometry.polygons.len(), 2);

    // Served from the in-memory cache the second time
    let again = boundaries
        .get_region_geometry("ABC", Resolution::Medium)
        .await
        .unwrap();
    assert_eq!(again, abc);
}

#[tokio::test]
async fn test_geojson_boundaries_errors() {
    let dir = tempfile::tempdir().unwrap();
    write_boundaries(dir.path(), Resolution::Medium);
    let boundaries = GeoJsonBoundaries::new(dir.path());

    let unknown = boundaries
        .get_region_geometry("XYZ", Resolution::Medium)
        .await
        .unwrap_err();
    assert!(matches!(unknown, NtlError::NotFound(_)));

    let ambiguous = boundaries
        .get_region_geometry("DUP", Resolution::Medium)
        .await
        .unwrap_err();
    assert!(matches!(ambiguous, NtlError::InvalidRequest(_)));

    // No file for the fine tier
    let missing = boundaries
        .get_region_geometry("ABC", Resolution::Fine)
        .await
        .unwrap_err();
    assert!(matches!(missing, NtlError::NotFound(_)));
}
