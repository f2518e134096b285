//! The artifact store contract shared by every cache backend.

use async_trait::async_trait;

use crate::entry::CacheEntry;
use crate::error::Result;
use crate::key::CacheKey;

/// A store of `(raster, percentiles)` pairs keyed by [`CacheKey`].
///
/// Implementations write both halves of an entry all-or-nothing. `get`
/// never returns one half without the other; an inconsistent entry is
/// reported as [`StorageError::Corrupt`](crate::StorageError::Corrupt).
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    async fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()>;

    /// Remove raster and metadata together. Removing a missing key is not an error.
    async fn evict(&self, key: &CacheKey) -> Result<()>;

    async fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
