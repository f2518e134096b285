//! Error types for mosaic assembly.

use ntl_common::{CrsCode, NtlError};
use thiserror::Error;

/// Errors that can occur while building or encoding a mosaic.
#[derive(Error, Debug)]
pub enum MosaicError {
    /// Tiles with different pixel sizes were handed to the merge.
    #[error("tile {index} has pixel size {found:?}, expected {expected:?}")]
    ResolutionMismatch {
        index: usize,
        expected: (f64, f64),
        found: (f64, f64),
    },

    /// Tiles in different coordinate systems were handed to the merge.
    #[error("tile {index} is in {found}, expected {expected}")]
    CrsMismatch {
        index: usize,
        expected: CrsCode,
        found: CrsCode,
    },

    /// Raster data length does not match its dimensions.
    #[error("raster data has {found} values, expected {expected}")]
    ShapeMismatch { expected: usize, found: usize },

    /// Downsampling factor must be at least 1.
    #[error("invalid downsample factor: {0}")]
    InvalidFactor(usize),

    /// GeoTIFF serialization failed.
    #[error("GeoTIFF encode error: {0}")]
    Encode(String),

    /// GeoTIFF input could not be read.
    #[error("GeoTIFF decode error: {0}")]
    Decode(String),

    /// Storage/IO error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl MosaicError {
    /// Create an Encode error.
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a Decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}

impl From<std::io::Error> for MosaicError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<tiff::TiffError> for MosaicError {
    fn from(err: tiff::TiffError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<MosaicError> for NtlError {
    fn from(err: MosaicError) -> Self {
        match err {
            MosaicError::Decode(msg) => NtlError::MalformedInput(msg),
            MosaicError::Io(msg) => NtlError::StorageError(msg),
            other => NtlError::ProcessingError(other.to_string()),
        }
    }
}

/// Result type for mosaic operations.
pub type Result<T> = std::result::Result<T, MosaicError>;
