//! Error types for the night-light mosaic services.

use thiserror::Error;

/// Result type alias using NtlError.
pub type NtlResult<T> = Result<T, NtlError>;

/// Primary error type surfaced to callers of the mosaic service.
#[derive(Debug, Clone, Error)]
pub enum NtlError {
    // === Caller-facing errors ===
    /// No boundary, no tiles or no data for the requested key.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A tile or dataset fetch failed after retries.
    #[error("Upstream failure (status {status}): {}", messages.join("; "))]
    UpstreamFailure { status: u16, messages: Vec<String> },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Recovered locally ===
    /// An unparseable metadata record. Logged and skipped by the index.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Raster/sidecar pair inconsistent on read. Treated as a cache miss.
    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    // === Infrastructure errors ===
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Processing failed: {0}")]
    ProcessingError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Request timeout")]
    Timeout,
}

impl NtlError {
    /// Build an upstream failure with a single message.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        NtlError::UpstreamFailure {
            status,
            messages: vec![message.into()],
        }
    }

    /// Whether a retry might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            NtlError::UpstreamFailure { status, .. } => *status >= 500 || *status == 429,
            NtlError::Timeout => true,
            _ => false,
        }
    }

    /// Get the HTTP status code for this error.
    pub fn http_status_code(&self) -> u16 {
        match self {
            NtlError::NotFound(_) => 404,
            NtlError::InvalidRequest(_) | NtlError::MalformedInput(_) => 400,
            NtlError::UpstreamFailure { .. } => 502,
            NtlError::CacheError(_) => 503,
            NtlError::Timeout => 504,
            _ => 500,
        }
    }
}

impl From<std::io::Error> for NtlError {
    fn from(err: std::io::Error) -> Self {
        NtlError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for NtlError {
    fn from(err: serde_json::Error) -> Self {
        NtlError::InternalError(format!("JSON error: {}", err))
    }
}
