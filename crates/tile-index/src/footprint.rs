//! Per-tile footprint descriptors.
//!
//! A descriptor is a flat XML document; only nine leaf elements matter and
//! they may appear at any depth:
//!
//! ```xml
//! <ProductMetaData>
//!   <imagingTime>2018-6-3T5:50:57.157223</imagingTime>
//!   <LTLongitude>95.52</LTLongitude> <LTLatitude>21.76</LTLatitude>
//!   <RTLongitude>...</RTLongitude>   <RTLatitude>...</RTLatitude>
//!   <RBLongitude>...</RBLongitude>   <RBLatitude>...</RBLatitude>
//!   <LBLongitude>...</LBLongitude>   <LBLatitude>...</LBLatitude>
//! </ProductMetaData>
//! ```

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ntl_common::{CrsCode, NtlError, Point, Polygon};

const IMAGING_TIME: &str = "imagingTime";
const CORNER_FIELDS: [&str; 8] = [
    "LTLongitude",
    "LTLatitude",
    "RTLongitude",
    "RTLatitude",
    "RBLongitude",
    "RBLatitude",
    "LBLongitude",
    "LBLatitude",
];

/// Why a descriptor could not be turned into a footprint.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("field {field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("invalid imaging time: {0:?}")]
    InvalidTimestamp(String),

    #[error("XML error: {0}")]
    Xml(String),
}

impl From<DescriptorError> for NtlError {
    fn from(err: DescriptorError) -> Self {
        NtlError::MalformedInput(err.to_string())
    }
}

/// Corner coordinates of a footprint as `(lon, lat)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Corners {
    pub lt: Point,
    pub rt: Point,
    pub rb: Point,
    pub lb: Point,
}

/// The true (non-rectangular) ground footprint of one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileFootprint {
    pub tile_id: String,
    /// Capture time in source-local time.
    pub captured_at: NaiveDateTime,
    pub corners: Corners,
}

impl TileFootprint {
    /// Footprint coordinates are always geographic.
    pub const CRS: CrsCode = CrsCode::Epsg4326;

    pub fn new(tile_id: impl Into<String>, captured_at: NaiveDateTime, corners: Corners) -> Self {
        Self {
            tile_id: tile_id.into(),
            captured_at,
            corners,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.captured_at.date()
    }

    /// The footprint polygon in LT, RT, RB, LB order.
    ///
    /// Any other cyclic order of the same corners may produce a
    /// self-intersecting ring.
    pub fn polygon(&self) -> Polygon {
        let c = &self.corners;
        Polygon::from_exterior(vec![c.lt, c.rt, c.rb, c.lb])
    }
}

/// Parse one descriptor document into a footprint.
pub fn parse_descriptor(tile_id: &str, xml: &str) -> Result<TileFootprint, DescriptorError> {
    let fields = collect_fields(xml)?;

    let time_text = fields
        .get(IMAGING_TIME)
        .ok_or(DescriptorError::MissingField(IMAGING_TIME))?;
    let captured_at = parse_imaging_time(time_text)?;

    let mut values = [0.0f64; 8];
    for (slot, field) in values.iter_mut().zip(CORNER_FIELDS) {
        let raw = fields.get(field).ok_or(DescriptorError::MissingField(field))?;
        *slot = raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| DescriptorError::InvalidNumber {
                field,
                value: raw.clone(),
            })?;
    }

    let corners = Corners {
        lt: (values[0], values[1]),
        rt: (values[2], values[3]),
        rb: (values[4], values[5]),
        lb: (values[6], values[7]),
    };

    Ok(TileFootprint::new(tile_id, captured_at, corners))
}

/// Parse `YYYY-M-DTH:M:S[.ffffff]`; components need not be zero-padded.
pub fn parse_imaging_time(text: &str) -> Result<NaiveDateTime, DescriptorError> {
    let invalid = || DescriptorError::InvalidTimestamp(text.to_string());
    let text = text.trim();

    let (date_part, time_part) = text.split_once('T').ok_or_else(invalid)?;

    let mut date_fields = date_part.split('-');
    let (year, month, day) = match (date_fields.next(), date_fields.next(), date_fields.next(), date_fields.next()) {
        (Some(y), Some(m), Some(d), None) => (y, m, d),
        _ => return Err(invalid()),
    };
    let date = NaiveDate::from_ymd_opt(
        year.parse().map_err(|_| invalid())?,
        month.parse().map_err(|_| invalid())?,
        day.parse().map_err(|_| invalid())?,
    )
    .ok_or_else(invalid)?;

    let mut time_fields = time_part.split(':');
    let (hour, minute, second) = match (time_fields.next(), time_fields.next(), time_fields.next(), time_fields.next()) {
        (Some(h), Some(m), Some(s), None) => (h, m, s),
        _ => return Err(invalid()),
    };
    let (whole, frac) = second.split_once('.').unwrap_or((second, ""));
    let micros = if frac.is_empty() {
        0
    } else {
        if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        // Right-pad to nanoseconds, then truncate to microseconds
        let nanos: u32 = format!("{:0<9}", frac).parse().map_err(|_| invalid())?;
        nanos / 1_000
    };
    let time = NaiveTime::from_hms_micro_opt(
        hour.parse().map_err(|_| invalid())?,
        minute.parse().map_err(|_| invalid())?,
        whole.parse().map_err(|_| invalid())?,
        micros,
    )
    .ok_or_else(invalid)?;

    Ok(NaiveDateTime::new(date, time))
}

/// Collect the text of the first occurrence of each wanted element.
fn collect_fields(xml: &str) -> Result<HashMap<&'static str, String>, DescriptorError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut fields: HashMap<&'static str, String> = HashMap::new();
    let mut current: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                current = wanted_field(name.as_ref()).filter(|f| !fields.contains_key(f));
            }
            Ok(Event::Text(t)) => {
                if let Some(field) = current {
                    let text = t
                        .unescape()
                        .map_err(|e| DescriptorError::Xml(e.to_string()))?;
                    fields.insert(field, text.into_owned());
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(DescriptorError::Xml(format!(
                    "at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(fields)
}

fn wanted_field(name: &[u8]) -> Option<&'static str> {
    std::iter::once(IMAGING_TIME)
        .chain(CORNER_FIELDS)
        .find(|f| f.as_bytes() == name)
}
