//! Filesystem artifact store.
//!
//! Layout under the cache root:
//!
//! ```text
//! {root}/{region}/{date}/{variable}/mosaic.tif
//! {root}/{region}/{date}/{variable}/mosaic.json
//! {root}/{region}/{date}/{variable}@{product}/...   product entries
//! {root}/.staging/{uuid}/   entries being written
//! {root}/.trash/{uuid}/     entries being removed
//! ```
//!
//! An entry is written into a fresh staging directory and moved into place
//! with one `rename`, so readers see either no entry or a complete one.
//! Staging and trash leftovers from a crash are removed on open.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::ArtifactStore;
use crate::entry::{CacheEntry, Sidecar};
use crate::error::{Result, StorageError};
use crate::key::CacheKey;

pub const RASTER_FILE: &str = "mosaic.tif";
pub const SIDECAR_FILE: &str = "mosaic.json";

const STAGING_DIR: &str = ".staging";
const TRASH_DIR: &str = ".trash";

pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open (creating if needed) a cache rooted at `root`, sweeping crash leftovers.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut swept = 0usize;
        for leftover in [STAGING_DIR, TRASH_DIR] {
            let dir = root.join(leftover);
            match fs::remove_dir_all(&dir).await {
                Ok(()) => swept += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::create_dir_all(&dir).await?;
        }

        info!(root = %root.display(), swept, "Opened filesystem artifact store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the entry for `key`.
    pub fn entry_dir(&self, key: &CacheKey) -> Result<PathBuf> {
        Ok(self.root.join(key.relative_path()?))
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move an existing entry directory out of the way and delete it.
    async fn discard(&self, dir: &Path) -> Result<()> {
        let trash = self.root.join(TRASH_DIR).join(Uuid::new_v4().to_string());
        match fs::rename(dir, &trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = fs::remove_dir_all(&trash).await {
            warn!(path = %trash.display(), error = %e, "Failed to delete discarded entry");
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let dir = self.entry_dir(key)?;
        let sidecar = Self::read_optional(&dir.join(SIDECAR_FILE)).await?;
        let raster = Self::read_optional(&dir.join(RASTER_FILE)).await?;

        match (sidecar, raster) {
            (None, None) => Ok(None),
            (Some(_), None) => Err(StorageError::corrupt(key, "raster missing")),
            (None, Some(_)) => Err(StorageError::corrupt(key, "sidecar missing")),
            (Some(sidecar), Some(raster)) => {
                let sidecar: Sidecar = serde_json::from_slice(&sidecar)
                    .map_err(|e| StorageError::corrupt(key, format!("bad sidecar: {}", e)))?;
                sidecar.verify(key, Bytes::from(raster)).map(Some)
            }
        }
    }

    async fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let target = self.entry_dir(key)?;
        let staging = self.root.join(STAGING_DIR).join(Uuid::new_v4().to_string());
        fs::create_dir_all(&staging).await?;

        let sidecar = serde_json::to_vec_pretty(&entry.sidecar(key))?;
        let written = async {
            fs::write(staging.join(RASTER_FILE), &entry.raster).await?;
            fs::write(staging.join(SIDECAR_FILE), &sidecar).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(e.into());
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.discard(&target).await?;

        if let Err(e) = fs::rename(&staging, &target).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(e.into());
        }

        debug!(key = %key, path = %target.display(), bytes = entry.raster.len(), "Stored artifact");
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> Result<()> {
        let dir = self.entry_dir(key)?;
        self.discard(&dir).await?;
        debug!(key = %key, "Evicted artifact");
        Ok(())
    }
}
