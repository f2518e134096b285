//! Post-merge coarsening of a mosaic to a lower resolution.
//!
//! Each output pixel aggregates a `factor` x `factor` block of input pixels.
//! Partial blocks at the right and bottom edges are dropped, and NaN inputs
//! are ignored.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MosaicError, Result};
use crate::raster::TileRaster;

/// How a block of pixels is reduced to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownsampleMethod {
    /// Average of the valid pixels
    #[default]
    Mean,
    /// Brightest valid pixel, keeps point sources visible
    Max,
    /// Top-left pixel of the block
    Nearest,
}

impl std::str::FromStr for DownsampleMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mean" => Ok(DownsampleMethod::Mean),
            "max" => Ok(DownsampleMethod::Max),
            "nearest" => Ok(DownsampleMethod::Nearest),
            other => Err(format!("unknown downsample method: {}", other)),
        }
    }
}

/// Coarsen a raster by an integer factor.
///
/// A factor of 1 returns an identical copy. The result keeps the origin and
/// multiplies the pixel size by `factor`. A raster smaller than one block
/// collapses to the 1x1 placeholder.
pub fn coarsen(raster: &TileRaster<f32>, factor: usize, method: DownsampleMethod) -> Result<TileRaster<f32>> {
    if factor == 0 {
        return Err(MosaicError::InvalidFactor(factor));
    }
    if factor == 1 {
        return Ok(raster.clone());
    }

    let new_width = raster.width / factor;
    let new_height = raster.height / factor;
    if new_width == 0 || new_height == 0 {
        return Ok(TileRaster::placeholder(raster.crs));
    }

    let mut output = vec![f32::NAN; new_width * new_height];
    output
        .par_chunks_mut(new_width)
        .enumerate()
        .for_each(|(out_y, out_row)| {
            let mut block = Vec::with_capacity(factor * factor);
            for (out_x, cell) in out_row.iter_mut().enumerate() {
                block.clear();
                for dy in 0..factor {
                    let row = &raster.data[(out_y * factor + dy) * raster.width..];
                    block.extend_from_slice(&row[out_x * factor..out_x * factor + factor]);
                }
                *cell = match method {
                    DownsampleMethod::Mean => mean_of_block(&block),
                    DownsampleMethod::Max => max_of_block(&block),
                    DownsampleMethod::Nearest => block[0],
                };
            }
        });

    debug!(
        factor,
        from_width = raster.width,
        from_height = raster.height,
        to_width = new_width,
        to_height = new_height,
        "Coarsened raster"
    );

    TileRaster::new(
        new_width,
        new_height,
        output,
        raster.transform.scaled(factor),
        raster.crs,
    )
}

/// Mean of the non-NaN values, NaN if there are none.
#[inline]
fn mean_of_block(values: &[f32]) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0usize;

    for &v in values {
        if !v.is_nan() {
            sum += v as f64;
            count += 1;
        }
    }

    if count == 0 {
        f32::NAN
    } else {
        (sum / count as f64) as f32
    }
}

/// Maximum of the non-NaN values, NaN if there are none.
#[inline]
fn max_of_block(values: &[f32]) -> f32 {
    values
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(None, |acc: Option<f32>, v| Some(acc.map_or(v, |m| m.max(v))))
        .unwrap_or(f32::NAN)
}
