//! Cached mosaic artifacts and their on-store encodings.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ntl_common::Percentiles;

use crate::error::{Result, StorageError};
use crate::key::CacheKey;

/// Magic prefix of a single-blob entry.
const BLOB_MAGIC: &[u8; 4] = b"NTLM";
const BLOB_VERSION: u8 = 1;
/// magic + version + header length
const BLOB_PREFIX_LEN: usize = 4 + 1 + 4;

/// The two halves of a cache entry. Stored and loaded as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// GeoTIFF-encoded mosaic.
    pub raster: Bytes,
    pub percentiles: Percentiles,
}

impl CacheEntry {
    pub fn new(raster: impl Into<Bytes>, percentiles: Percentiles) -> Self {
        Self {
            raster: raster.into(),
            percentiles,
        }
    }

    pub fn sidecar(&self, key: &CacheKey) -> Sidecar {
        Sidecar {
            key: key.to_string(),
            p02: self.percentiles.p02,
            p98: self.percentiles.p98,
            raster_len: self.raster.len() as u64,
            raster_crc32: crc32fast::hash(&self.raster),
            created_at: Utc::now(),
        }
    }

    /// Pack raster and metadata into one value for key-value stores.
    pub fn to_blob(&self, key: &CacheKey) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.sidecar(key))?;
        let mut blob = Vec::with_capacity(BLOB_PREFIX_LEN + header.len() + self.raster.len());
        blob.extend_from_slice(BLOB_MAGIC);
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&(header.len() as u32).to_le_bytes());
        blob.extend_from_slice(&header);
        blob.extend_from_slice(&self.raster);
        Ok(blob)
    }

    /// Unpack a blob written by [`CacheEntry::to_blob`], verifying it.
    pub fn from_blob(key: &CacheKey, blob: &[u8]) -> Result<Self> {
        if blob.len() < BLOB_PREFIX_LEN || &blob[..4] != BLOB_MAGIC {
            return Err(StorageError::corrupt(key, "not an artifact blob"));
        }
        if blob[4] != BLOB_VERSION {
            return Err(StorageError::corrupt(key, format!("unknown blob version {}", blob[4])));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&blob[5..9]);
        let header_len = u32::from_le_bytes(len_bytes) as usize;

        let body = &blob[BLOB_PREFIX_LEN..];
        if body.len() < header_len {
            return Err(StorageError::corrupt(key, "truncated header"));
        }
        let sidecar: Sidecar = serde_json::from_slice(&body[..header_len])
            .map_err(|e| StorageError::corrupt(key, format!("bad header: {}", e)))?;

        sidecar.verify(key, Bytes::copy_from_slice(&body[header_len..]))
    }
}

/// Metadata half of an entry (`mosaic.json` on disk).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    pub key: String,
    pub p02: f64,
    pub p98: f64,
    pub raster_len: u64,
    pub raster_crc32: u32,
    pub created_at: DateTime<Utc>,
}

impl Sidecar {
    pub fn percentiles(&self) -> Percentiles {
        Percentiles::new(self.p02, self.p98)
    }

    /// Pair the sidecar with raster bytes, failing if they do not belong together.
    pub fn verify(&self, key: &CacheKey, raster: Bytes) -> Result<CacheEntry> {
        if self.key != key.to_string() {
            return Err(StorageError::corrupt(key, format!("entry belongs to {}", self.key)));
        }
        if raster.len() as u64 != self.raster_len {
            return Err(StorageError::corrupt(
                key,
                format!("raster is {} bytes, sidecar says {}", raster.len(), self.raster_len),
            ));
        }
        if crc32fast::hash(&raster) != self.raster_crc32 {
            return Err(StorageError::corrupt(key, "raster checksum mismatch"));
        }
        Ok(CacheEntry {
            raster,
            percentiles: self.percentiles(),
        })
    }
}
