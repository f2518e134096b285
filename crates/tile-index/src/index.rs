//! Queryable tile footprint index.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use ntl_common::{NtlError, NtlResult, Polygon};

use crate::boundary::RegionGeometry;
use crate::footprint::{parse_descriptor, TileFootprint};

/// Descriptor file suffix; the tile id is the file name without it.
pub const DESCRIPTOR_SUFFIX: &str = "_meta.xml";

/// Which capture dates a lookup accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateSelection {
    Single(NaiveDate),
    List(Vec<NaiveDate>),
}

impl DateSelection {
    fn dates(&self) -> BTreeSet<NaiveDate> {
        match self {
            DateSelection::Single(d) => BTreeSet::from([*d]),
            DateSelection::List(list) => list.iter().copied().collect(),
        }
    }
}

impl From<NaiveDate> for DateSelection {
    fn from(date: NaiveDate) -> Self {
        DateSelection::Single(date)
    }
}

impl From<Vec<NaiveDate>> for DateSelection {
    fn from(dates: Vec<NaiveDate>) -> Self {
        DateSelection::List(dates)
    }
}

impl From<&[NaiveDate]> for DateSelection {
    fn from(dates: &[NaiveDate]) -> Self {
        DateSelection::List(dates.to_vec())
    }
}

/// Build statistics for an index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub tiles: usize,
    pub dates: usize,
    /// Descriptors that were malformed and skipped.
    pub skipped: usize,
}

/// In-memory footprint table grouped by capture date.
#[derive(Debug, Clone, Default)]
pub struct TileIndex {
    by_date: BTreeMap<NaiveDate, Vec<(TileFootprint, Polygon)>>,
    skipped: usize,
}

impl TileIndex {
    /// Build an index from already parsed footprints.
    pub fn from_footprints<I>(footprints: I) -> Self
    where
        I: IntoIterator<Item = TileFootprint>,
    {
        let mut index = Self::default();
        for fp in footprints {
            index.insert(fp);
        }
        index
    }

    /// Build an index from a directory of `<tile>_meta.xml` descriptors.
    ///
    /// Malformed descriptors are logged and skipped; only an unreadable
    /// directory fails the build.
    pub fn from_dir(dir: impl AsRef<Path>) -> NtlResult<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(NtlError::NotFound(format!(
                "metadata directory {} does not exist",
                dir.display()
            )));
        }

        let mut index = Self::default();

        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable metadata entry");
                    index.skipped += 1;
                    continue;
                }
            };
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Some(tile_id) = name.strip_suffix(DESCRIPTOR_SUFFIX) else {
                continue;
            };

            let parsed = std::fs::read_to_string(entry.path())
                .map_err(|e| NtlError::MalformedInput(e.to_string()))
                .and_then(|xml| parse_descriptor(tile_id, &xml).map_err(NtlError::from));

            match parsed {
                Ok(fp) => index.insert(fp),
                Err(e) => {
                    warn!(tile_id = %tile_id, error = %e, "Skipping malformed tile descriptor");
                    index.skipped += 1;
                }
            }
        }

        let stats = index.stats();
        info!(
            dir = %dir.display(),
            tiles = stats.tiles,
            dates = stats.dates,
            skipped = stats.skipped,
            "Built tile index"
        );

        Ok(index)
    }

    /// Add one footprint.
    pub fn insert(&mut self, footprint: TileFootprint) {
        let polygon = footprint.polygon();
        if !polygon.is_simple() {
            debug!(tile_id = %footprint.tile_id, "Footprint polygon is not simple");
        }
        self.by_date
            .entry(footprint.date())
            .or_default()
            .push((footprint, polygon));
    }

    /// Tiles captured on the selected date(s) whose footprint intersects the region.
    ///
    /// The date filter is an exact calendar-date match. When the region is not
    /// in the footprint CRS the tile polygon is reprojected into the region CRS.
    /// Results are sorted by tile id.
    pub fn lookup(&self, region: &RegionGeometry, dates: impl Into<DateSelection>) -> Vec<TileFootprint> {
        let selection = dates.into();
        let mut hits: Vec<TileFootprint> = selection
            .dates()
            .iter()
            .filter_map(|d| self.by_date.get(d))
            .flatten()
            .filter(|(fp, polygon)| Self::intersects(region, fp, polygon))
            .map(|(fp, _)| fp.clone())
            .collect();

        hits.sort_by(|a, b| a.tile_id.cmp(&b.tile_id));

        debug!(
            region = %region.id,
            selection = ?selection,
            tiles = hits.len(),
            "Tile lookup"
        );

        hits
    }

    /// Sorted distinct capture dates with at least one tile covering the region.
    pub fn available_dates(&self, region: &RegionGeometry) -> Vec<NaiveDate> {
        self.by_date
            .iter()
            .filter(|(_, tiles)| {
                tiles
                    .iter()
                    .any(|(fp, polygon)| Self::intersects(region, fp, polygon))
            })
            .map(|(date, _)| *date)
            .collect()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            tiles: self.len(),
            dates: self.by_date.len(),
            skipped: self.skipped,
        }
    }

    pub fn len(&self) -> usize {
        self.by_date.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }

    fn intersects(region: &RegionGeometry, footprint: &TileFootprint, polygon: &Polygon) -> bool {
        if region.crs == TileFootprint::CRS {
            region.geometry.intersects_polygon(polygon)
        } else {
            let projected = polygon.transform(TileFootprint::CRS, region.crs);
            let hit = region.geometry.intersects_polygon(&projected);
            debug!(tile_id = %footprint.tile_id, crs = %region.crs, hit, "Reprojected footprint test");
            hit
        }
    }
}
