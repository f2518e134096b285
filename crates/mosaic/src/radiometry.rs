//! Raw digital number to radiance conversion.
//!
//! `radiance = raw^1.5 * 1e-10`, applied to every pixel of a tile before
//! footprint masking.

use crate::raster::TileRaster;

/// Exponent of the calibration curve.
pub const EXPONENT: f64 = 1.5;

/// Scale applied after the power law.
pub const SCALE: f64 = 1e-10;

/// Convert one raw value. NaN and negative inputs yield NaN.
#[inline]
pub fn radiance(raw: f64) -> f32 {
    if raw.is_nan() || raw < 0.0 {
        return f32::NAN;
    }
    (raw.powf(EXPONENT) * SCALE) as f32
}

/// Convert a raw tile into radiance.
///
/// Accepts any sample type that widens losslessly to `f64`, so negative or
/// NaN raw values reach [`radiance`] unchanged and come out as nodata.
pub fn convert<T>(tile: &TileRaster<T>) -> TileRaster<f32>
where
    T: Copy + Send + Sync + Into<f64>,
{
    tile.map(|raw| radiance(raw.into()))
}
