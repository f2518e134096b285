//! Redis-backed artifact store.
//!
//! Each entry is one value (see [`CacheEntry::to_blob`]), so a single `SET`
//! or `DEL` covers raster and percentiles together. Entries never expire.

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use tracing::{debug, info};

use crate::artifact::ArtifactStore;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::key::CacheKey;

/// Redis artifact store client.
pub struct RedisArtifactStore {
    conn: MultiplexedConnection,
}

impl RedisArtifactStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = %redis_url, "Connected to Redis artifact store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl ArtifactStore for RedisArtifactStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        key.validate()?;
        let mut conn = self.conn.clone();
        let blob: Option<Vec<u8>> = conn.get(key.to_string()).await?;
        blob.map(|b| CacheEntry::from_blob(key, &b)).transpose()
    }

    async fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        key.validate()?;
        let mut conn = self.conn.clone();
        let blob = entry.to_blob(key)?;
        let _: () = conn.set(key.to_string(), blob).await?;
        debug!(key = %key, bytes = entry.raster.len(), "Stored artifact");
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> Result<()> {
        key.validate()?;
        let mut conn = self.conn.clone();
        let _: () = conn.del(key.to_string()).await?;
        debug!(key = %key, "Evicted artifact");
        Ok(())
    }
}
