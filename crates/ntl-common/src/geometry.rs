//! Planar polygon geometry for tile footprints and region boundaries.
//!
//! Rings are stored open (the closing vertex is not repeated). All predicates
//! are evaluated in whatever CRS the coordinates are expressed in; callers are
//! responsible for bringing both operands into the same CRS first.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bbox::BoundingBox;
use crate::crs::CrsCode;
use crate::error::{NtlError, NtlResult};

/// A 2D point as `(x, y)`, i.e. `(lon, lat)` for geographic coordinates.
pub type Point = (f64, f64);

/// A polygon with one exterior ring and optional holes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Vec<Point>,
    #[serde(default)]
    pub interiors: Vec<Vec<Point>>,
}

impl Polygon {
    /// Create a polygon, dropping a repeated closing vertex on each ring.
    pub fn new(exterior: Vec<Point>, interiors: Vec<Vec<Point>>) -> Self {
        Self {
            exterior: open_ring(exterior),
            interiors: interiors.into_iter().map(open_ring).collect(),
        }
    }

    /// Polygon without holes.
    pub fn from_exterior(exterior: Vec<Point>) -> Self {
        Self::new(exterior, Vec::new())
    }

    /// Axis-aligned rectangle, vertices in clockwise order starting top-left.
    pub fn rectangle(bbox: &BoundingBox) -> Self {
        Self::from_exterior(vec![
            (bbox.min_x, bbox.max_y),
            (bbox.max_x, bbox.max_y),
            (bbox.max_x, bbox.min_y),
            (bbox.min_x, bbox.min_y),
        ])
    }

    /// All rings, exterior first.
    pub fn rings(&self) -> impl Iterator<Item = &[Point]> {
        std::iter::once(self.exterior.as_slice()).chain(self.interiors.iter().map(|r| r.as_slice()))
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.exterior.iter().copied())
    }

    /// Unsigned area of the exterior ring minus holes (shoelace formula).
    pub fn area(&self) -> f64 {
        let holes: f64 = self.interiors.iter().map(|r| ring_signed_area(r).abs()).sum();
        ring_signed_area(&self.exterior).abs() - holes
    }

    /// Even-odd point containment; points inside a hole are outside.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        if !point_in_ring(&self.exterior, x, y) {
            return false;
        }
        !self.interiors.iter().any(|hole| point_in_ring(hole, x, y))
    }

    /// True when the exterior ring has at least three vertices, non-zero area
    /// and no two non-adjacent edges touch.
    pub fn is_simple(&self) -> bool {
        let ring = &self.exterior;
        let n = ring.len();
        if n < 3 || ring_signed_area(ring).abs() <= f64::EPSILON {
            return false;
        }
        for i in 0..n {
            let (a1, a2) = (ring[i], ring[(i + 1) % n]);
            for j in (i + 1)..n {
                let adjacent = j == i + 1 || (i == 0 && j == n - 1);
                if adjacent {
                    continue;
                }
                let (b1, b2) = (ring[j], ring[(j + 1) % n]);
                if segments_intersect(a1, a2, b1, b2) {
                    return false;
                }
            }
        }
        true
    }

    /// Non-empty intersection test (partial overlap and touching both count).
    pub fn intersects(&self, other: &Polygon) -> bool {
        match (self.bbox(), other.bbox()) {
            (Some(a), Some(b)) if a.intersects(&b) => {}
            _ => return false,
        }

        for ring_a in self.rings() {
            for (a1, a2) in edges(ring_a) {
                for ring_b in other.rings() {
                    if edges(ring_b).any(|(b1, b2)| segments_intersect(a1, a2, b1, b2)) {
                        return true;
                    }
                }
            }
        }

        // No boundary crossings: either disjoint or one fully inside the other.
        let (ax, ay) = self.exterior[0];
        let (bx, by) = other.exterior[0];
        other.contains_point(ax, ay) || self.contains_point(bx, by)
    }

    /// Reproject every vertex from `from` into `to`.
    pub fn transform(&self, from: CrsCode, to: CrsCode) -> Polygon {
        if from == to {
            return self.clone();
        }
        let project = |ring: &Vec<Point>| -> Vec<Point> {
            ring.iter().map(|&(x, y)| from.transform_point(to, x, y)).collect()
        };
        Polygon {
            exterior: project(&self.exterior),
            interiors: self.interiors.iter().map(project).collect(),
        }
    }

    fn from_geojson_rings(coords: &Value) -> NtlResult<Self> {
        let rings = coords
            .as_array()
            .ok_or_else(|| NtlError::MalformedInput("polygon coordinates must be an array".into()))?;
        let mut parsed = rings.iter().map(parse_ring).collect::<NtlResult<Vec<_>>>()?;
        if parsed.is_empty() {
            return Err(NtlError::MalformedInput("polygon has no rings".into()));
        }
        let exterior = parsed.remove(0);
        Ok(Polygon::new(exterior, parsed))
    }
}

/// A collection of polygons, e.g. a country with islands.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MultiPolygon {
    pub polygons: Vec<Polygon>,
}

impl MultiPolygon {
    pub fn new(polygons: Vec<Polygon>) -> Self {
        Self { polygons }
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        self.polygons
            .iter()
            .filter_map(Polygon::bbox)
            .reduce(|a, b| a.union(&b))
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        self.polygons.iter().any(|p| p.contains_point(x, y))
    }

    pub fn intersects_polygon(&self, polygon: &Polygon) -> bool {
        self.polygons.iter().any(|p| p.intersects(polygon))
    }

    pub fn transform(&self, from: CrsCode, to: CrsCode) -> MultiPolygon {
        MultiPolygon {
            polygons: self.polygons.iter().map(|p| p.transform(from, to)).collect(),
        }
    }

    /// Parse a GeoJSON geometry object (`Polygon` or `MultiPolygon`).
    ///
    /// A GeoJSON `Feature` is accepted too; its `geometry` member is used.
    pub fn from_geojson(value: &Value) -> NtlResult<Self> {
        let geometry = match value.get("type").and_then(Value::as_str) {
            Some("Feature") => value
                .get("geometry")
                .ok_or_else(|| NtlError::MalformedInput("feature has no geometry".into()))?,
            _ => value,
        };

        let kind = geometry
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| NtlError::MalformedInput("geometry has no type".into()))?;
        let coords = geometry
            .get("coordinates")
            .ok_or_else(|| NtlError::MalformedInput("geometry has no coordinates".into()))?;

        match kind {
            "Polygon" => Ok(MultiPolygon::new(vec![Polygon::from_geojson_rings(coords)?])),
            "MultiPolygon" => {
                let polygons = coords
                    .as_array()
                    .ok_or_else(|| {
                        NtlError::MalformedInput("multipolygon coordinates must be an array".into())
                    })?
                    .iter()
                    .map(Polygon::from_geojson_rings)
                    .collect::<NtlResult<Vec<_>>>()?;
                Ok(MultiPolygon::new(polygons))
            }
            other => Err(NtlError::MalformedInput(format!(
                "unsupported geometry type: {}",
                other
            ))),
        }
    }
}

impl From<Polygon> for MultiPolygon {
    fn from(polygon: Polygon) -> Self {
        MultiPolygon::new(vec![polygon])
    }
}

fn parse_ring(ring: &Value) -> NtlResult<Vec<Point>> {
    ring.as_array()
        .ok_or_else(|| NtlError::MalformedInput("ring must be an array".into()))?
        .iter()
        .map(|pos| {
            let x = pos.get(0).and_then(Value::as_f64);
            let y = pos.get(1).and_then(Value::as_f64);
            match (x, y) {
                (Some(x), Some(y)) => Ok((x, y)),
                _ => Err(NtlError::MalformedInput(format!("invalid position: {}", pos))),
            }
        })
        .collect()
}

fn open_ring(mut ring: Vec<Point>) -> Vec<Point> {
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    ring
}

/// Iterate the closed edges of an open ring.
pub fn edges(ring: &[Point]) -> impl Iterator<Item = (Point, Point)> + '_ {
    let n = ring.len();
    (0..n).map(move |i| (ring[i], ring[(i + 1) % n]))
}

fn ring_signed_area(ring: &[Point]) -> f64 {
    edges(ring).map(|(a, b)| a.0 * b.1 - b.0 * a.1).sum::<f64>() / 2.0
}

/// Even-odd ray casting.
pub fn point_in_ring(ring: &[Point], x: f64, y: f64) -> bool {
    let mut inside = false;
    for ((xi, yi), (xj, yj)) in edges(ring) {
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
    }
    inside
}

#[inline]
fn orientation(a: Point, b: Point, c: Point) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

#[inline]
fn on_segment(a: Point, b: Point, p: Point) -> bool {
    p.0 >= a.0.min(b.0) && p.0 <= a.0.max(b.0) && p.1 >= a.1.min(b.1) && p.1 <= a.1.max(b.1)
}

/// Closed-segment intersection, collinear overlap included.
pub fn segments_intersect(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}
