//! Coordinate Reference System types and utilities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Web Mercator half-circumference in meters.
const MERCATOR_EXTENT: f64 = 20037508.342789244;

/// Well-known CRS codes used by tiles and region boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CrsCode {
    /// WGS84 Geographic (lon/lat in degrees). Tile footprints are always in this CRS.
    #[default]
    Epsg4326,
    /// Web Mercator (meters)
    Epsg3857,
}

impl CrsCode {
    /// Parse a CRS identifier.
    ///
    /// Accepts formats like:
    /// - "EPSG:4326"
    /// - "epsg:3857"
    /// - "CRS:84" and the GeoJSON URN form "urn:ogc:def:crs:OGC:1.3:CRS84"
    pub fn parse(s: &str) -> Result<Self, CrsParseError> {
        let normalized = s.trim().to_uppercase();

        match normalized.as_str() {
            "EPSG:4326" | "CRS:84" | "URN:OGC:DEF:CRS:OGC:1.3:CRS84" | "URN:OGC:DEF:CRS:EPSG::4326" => {
                Ok(CrsCode::Epsg4326)
            }
            "EPSG:3857" | "EPSG:900913" | "URN:OGC:DEF:CRS:EPSG::3857" => Ok(CrsCode::Epsg3857),
            _ => Err(CrsParseError::UnsupportedCrs(s.to_string())),
        }
    }

    /// Check if this is a geographic (lat/lon) CRS.
    pub fn is_geographic(&self) -> bool {
        matches!(self, CrsCode::Epsg4326)
    }

    /// Transform a single point from `self` into `target`.
    pub fn transform_point(&self, target: CrsCode, x: f64, y: f64) -> (f64, f64) {
        match (self, target) {
            (CrsCode::Epsg4326, CrsCode::Epsg3857) => wgs84_to_mercator(x, y),
            (CrsCode::Epsg3857, CrsCode::Epsg4326) => mercator_to_wgs84(x, y),
            _ => (x, y),
        }
    }
}

impl fmt::Display for CrsCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            CrsCode::Epsg4326 => "EPSG:4326",
            CrsCode::Epsg3857 => "EPSG:3857",
        };
        write!(f, "{}", code)
    }
}

/// Convert WGS84 (EPSG:4326) lon/lat to Web Mercator (EPSG:3857) meters.
pub fn wgs84_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    // Mercator is undefined at the poles
    let lat = lat.clamp(-85.051_128_78, 85.051_128_78);
    let x = lon * MERCATOR_EXTENT / 180.0;
    let y = lat.to_radians().tan().asinh() * MERCATOR_EXTENT / std::f64::consts::PI;
    (x, y)
}

/// Convert Web Mercator (EPSG:3857) meters to WGS84 (EPSG:4326) lon/lat.
pub fn mercator_to_wgs84(x: f64, y: f64) -> (f64, f64) {
    let lon = x / MERCATOR_EXTENT * 180.0;
    let lat = (y / MERCATOR_EXTENT * std::f64::consts::PI).sinh().atan().to_degrees();
    (lon, lat)
}

#[derive(Debug, thiserror::Error)]
pub enum CrsParseError {
    #[error("Unsupported CRS: {0}")]
    UnsupportedCrs(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_crs() {
        assert_eq!(CrsCode::parse("EPSG:4326").unwrap(), CrsCode::Epsg4326);
        assert_eq!(CrsCode::parse("epsg:3857").unwrap(), CrsCode::Epsg3857);
        assert_eq!(
            CrsCode::parse("urn:ogc:def:crs:OGC:1.3:CRS84").unwrap(),
            CrsCode::Epsg4326
        );
        assert!(CrsCode::parse("EPSG:99999").is_err());
    }

    #[test]
    fn test_mercator_roundtrip() {
        let (x, y) = wgs84_to_mercator(96.1, 19.7);
        let (lon, lat) = mercator_to_wgs84(x, y);
        assert!((lon - 96.1).abs() < 1e-9);
        assert!((lat - 19.7).abs() < 1e-9);
    }

    #[test]
    fn test_mercator_origin_and_edge() {
        let (x, y) = wgs84_to_mercator(0.0, 0.0);
        assert!(x.abs() < 1e-9 && y.abs() < 1e-9);

        let (x, _) = wgs84_to_mercator(180.0, 0.0);
        assert!((x - MERCATOR_EXTENT).abs() < 1e-6);
    }

    #[test]
    fn test_identity_transform() {
        let p = CrsCode::Epsg4326.transform_point(CrsCode::Epsg4326, 10.0, 20.0);
        assert_eq!(p, (10.0, 20.0));
    }
}
