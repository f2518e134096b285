//! Storage error types.

use ntl_common::NtlError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Zarr error: {0}")]
    Zarr(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Key component unusable as a path segment or key-string part.
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    /// Half-written or tampered entry. Callers treat the key as absent.
    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StorageError {
    pub fn corrupt(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corrupt { .. })
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err.to_string())
    }
}

impl From<StorageError> for NtlError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Corrupt { .. } => NtlError::CacheCorruption(err.to_string()),
            StorageError::Redis(msg) => NtlError::CacheError(msg),
            StorageError::InvalidKey(msg) => NtlError::InvalidRequest(msg),
            other => NtlError::StorageError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
