//! Acquisition of tile rasters and alternate-source datasets.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use ntl_common::{NtlError, NtlResult};
use storage::Dataset;
use tile_index::RegionGeometry;

/// Makes one tile raster available on local disk.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    /// Local path of the tile's GeoTIFF.
    ///
    /// Fails with `NotFound` for unknown tiles and `UpstreamFailure` for
    /// network errors that survived retries.
    async fn fetch_tile(&self, tile_id: &str) -> NtlResult<PathBuf>;
}

/// Fetches an already-mosaicked dataset from the alternate source.
#[async_trait]
pub trait DatasetFetcher: Send + Sync {
    async fn fetch_dataset(
        &self,
        region: &RegionGeometry,
        date: NaiveDate,
        product: &str,
        variable: &str,
    ) -> NtlResult<Dataset>;
}

/// Retry settings for [`HttpTileFetcher`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial retry delay (doubles each retry)
    pub initial_retry_delay: Duration,
    /// Maximum retry delay
    pub max_retry_delay: Duration,
    /// HTTP request timeout
    pub request_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Downloads `{prefix}{tile_id}.tar.gz` archives and unpacks the tile's
/// `{tile_id}_gec.tif` into a local tiles directory.
///
/// Every attempt works in its own staging directory under
/// `{tiles_dir}/.staging`, so concurrent fetches of one tile never share a
/// partial file; the finished GeoTIFF is moved into place with one `rename`.
pub struct HttpTileFetcher {
    client: Client,
    url_prefix: String,
    tiles_dir: PathBuf,
    config: FetchConfig,
}

impl HttpTileFetcher {
    pub fn new(url_prefix: impl Into<String>, tiles_dir: impl Into<PathBuf>, config: FetchConfig) -> NtlResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| NtlError::ConfigError(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url_prefix: url_prefix.into(),
            tiles_dir: tiles_dir.into(),
            config,
        })
    }

    /// Name of the georeferenced raster inside a tile archive.
    pub fn file_name(tile_id: &str) -> String {
        format!("{}_gec.tif", tile_id)
    }

    pub fn url_for(&self, tile_id: &str) -> String {
        format!("{}{}.tar.gz", self.url_prefix, tile_id)
    }

    pub fn local_path(&self, tile_id: &str) -> PathBuf {
        self.tiles_dir.join(Self::file_name(tile_id))
    }

    /// Download the descriptor archive (`META.tar.gz`) into `metadata_dir`
    /// and unpack it there. The archive is kept and only re-downloaded when
    /// missing or when `force` is set.
    ///
    /// Returns the number of `*_meta.xml` descriptors unpacked.
    #[instrument(skip(self, metadata_dir), fields(dir = %metadata_dir.display()))]
    pub async fn fetch_metadata(&self, url: &str, metadata_dir: &Path, force: bool) -> NtlResult<usize> {
        fs::create_dir_all(metadata_dir).await.map_err(io_error)?;
        let archive = metadata_dir.join(METADATA_ARCHIVE);

        if force || !fs::try_exists(&archive).await.unwrap_or(false) {
            let staging = StagingDir::create(metadata_dir).await?;
            let partial = staging.path().join(METADATA_ARCHIVE);
            let target = partial.as_path();
            let bytes = self
                .with_retries(move || async move { self.download_once(url, target).await })
                .await?;
            fs::rename(&partial, &archive).await.map_err(io_error)?;
            info!(bytes, "Metadata archive downloaded");
        } else {
            debug!("Metadata archive already present, skipping download");
        }

        let dest = metadata_dir.to_path_buf();
        let unpacked = tokio::task::spawn_blocking(move || unpack_tar_gz(&archive, &dest))
            .await
            .map_err(|e| NtlError::InternalError(format!("metadata unpack task failed: {}", e)))??;

        let descriptors = unpacked
            .iter()
            .filter(|p| p.to_string_lossy().ends_with(tile_index::index::DESCRIPTOR_SUFFIX))
            .count();
        info!(files = unpacked.len(), descriptors, "Metadata archive unpacked");
        Ok(descriptors)
    }

    /// One download + unpack attempt inside `staging`, returning the path of
    /// the tile raster it contained.
    async fn fetch_archive_once(&self, tile_id: &str, staging: &Path) -> NtlResult<PathBuf> {
        let url = self.url_for(tile_id);
        let archive = staging.join(format!("{}.tar.gz", tile_id));
        let bytes = self.download_once(&url, &archive).await?;
        debug!(bytes, "Tile archive downloaded");

        let dest = staging.to_path_buf();
        let unpack_from = archive.clone();
        let unpacked = tokio::task::spawn_blocking(move || unpack_tar_gz(&unpack_from, &dest))
            .await
            .map_err(|e| NtlError::InternalError(format!("tile unpack task failed: {}", e)))?
            // A truncated or garbled archive is worth another download
            .map_err(|e| NtlError::upstream(502, format!("{}: {}", url, e)))?;

        let wanted = Self::file_name(tile_id);
        unpacked
            .into_iter()
            .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(wanted.as_str()))
            .ok_or_else(|| NtlError::MalformedInput(format!("{} does not contain {}", url, wanted)))
    }

    /// Run `attempt` until it succeeds, fails permanently or runs out of retries.
    async fn with_retries<T, F, Fut>(&self, mut attempt: F) -> NtlResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = NtlResult<T>>,
    {
        let mut retry_count = 0;
        let mut delay = self.config.initial_retry_delay;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        warn!(error = %e, retries = retry_count - 1, "Download failed");
                        return Err(e);
                    }

                    warn!(
                        error = %e,
                        retry = retry_count,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Download failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.config.max_retry_delay);
                }
            }
        }
    }

    /// One download attempt into `dest`.
    async fn download_once(&self, url: &str, dest: &Path) -> NtlResult<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| NtlError::upstream(e.status().map_or(503, |s| s.as_u16()), e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(NtlError::NotFound(format!("not available upstream: {}", url)));
            }
            status if !status.is_success() => {
                return Err(NtlError::upstream(status.as_u16(), format!("GET {} returned {}", url, status)));
            }
            _ => {}
        }

        let mut file = fs::File::create(dest).await.map_err(io_error)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| NtlError::upstream(503, format!("error reading {}: {}", url, e)))?;
            file.write_all(&chunk).await.map_err(io_error)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_error)?;
        file.sync_all().await.map_err(io_error)?;
        Ok(written)
    }
}

#[async_trait]
impl TileFetcher for HttpTileFetcher {
    #[instrument(skip(self))]
    async fn fetch_tile(&self, tile_id: &str) -> NtlResult<PathBuf> {
        let final_path = self.local_path(tile_id);
        if fs::try_exists(&final_path).await.unwrap_or(false) {
            debug!(path = %final_path.display(), "Tile already present, skipping download");
            return Ok(final_path);
        }

        let staging = &StagingDir::create(&self.tiles_dir).await?;
        let raster = self
            .with_retries(move || async move {
                staging.reset().await?;
                self.fetch_archive_once(tile_id, staging.path()).await
            })
            .await?;

        fs::rename(&raster, &final_path).await.map_err(io_error)?;
        info!(path = %final_path.display(), "Tile downloaded");
        Ok(final_path)
    }
}

/// Name of the descriptor archive.
pub const METADATA_ARCHIVE: &str = "META.tar.gz";

const STAGING_DIR: &str = ".staging";

/// A uniquely named scratch directory, removed on drop.
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    async fn create(parent: &Path) -> NtlResult<Self> {
        let path = parent.join(STAGING_DIR).join(Uuid::new_v4().to_string());
        fs::create_dir_all(&path).await.map_err(io_error)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Empty the directory before another attempt.
    async fn reset(&self) -> NtlResult<()> {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(e)),
        }
        fs::create_dir_all(&self.path).await.map_err(io_error)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}

/// Unpack the regular files of a `.tar.gz` archive into `dest`.
///
/// Entries whose path would escape `dest` are skipped. Returns the paths of
/// the files written.
pub fn unpack_tar_gz(archive: &Path, dest: &Path) -> NtlResult<Vec<PathBuf>> {
    let bad = |e: std::io::Error| NtlError::MalformedInput(format!("{}: {}", archive.display(), e));

    let file = std::fs::File::open(archive).map_err(io_error)?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut unpacked = Vec::new();
    for entry in tar.entries().map_err(bad)? {
        let mut entry = entry.map_err(bad)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let relative = entry.path().map_err(bad)?.into_owned();
        if entry.unpack_in(dest).map_err(bad)? {
            unpacked.push(dest.join(relative));
        } else {
            warn!(entry = %relative.display(), "Skipping archive entry outside the target directory");
        }
    }
    Ok(unpacked)
}

fn io_error(e: std::io::Error) -> NtlError {
    NtlError::StorageError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// A gzipped tarball holding `files` as `(path, contents)`.
    fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// Minimal HTTP server answering every GET with `body`, or 404 when the
    /// request path contains "missing". Returns the URL prefix and a hit counter.
    async fn serve(body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let body = Arc::new(body);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let body = body.clone();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&request);
                    let response = if head.lines().next().unwrap_or("").contains("missing") {
                        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
                    } else {
                        let mut r = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        )
                        .into_bytes();
                        r.extend_from_slice(&body);
                        r
                    };
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{}/dl?path=%2F", addr), hits)
    }

    fn quick_config() -> FetchConfig {
        FetchConfig {
            max_retries: 1,
            initial_retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(2),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_tile_urls() {
        let fetcher = HttpTileFetcher::new("https://host/dl?path=%2F", "/data/tiles", FetchConfig::default()).unwrap();
        assert_eq!(
            fetcher.url_for("LJ01_2018_T1"),
            "https://host/dl?path=%2FLJ01_2018_T1.tar.gz"
        );
        assert_eq!(
            fetcher.local_path("LJ01_2018_T1"),
            PathBuf::from("/data/tiles/LJ01_2018_T1_gec.tif")
        );
    }

    #[test]
    fn test_unpack_lists_regular_files_and_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.tar.gz");
        std::fs::write(&archive, tar_gz(&[("T1/T1_gec.tif", b"tiff"), ("T1/readme.txt", b"hi")])).unwrap();

        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        let mut files = unpack_tar_gz(&archive, &dest).unwrap();
        files.sort();
        assert_eq!(files, vec![dest.join("T1/T1_gec.tif"), dest.join("T1/readme.txt")]);
        assert_eq!(std::fs::read(dest.join("T1/T1_gec.tif")).unwrap(), b"tiff");

        let garbage = dir.path().join("bad.tar.gz");
        std::fs::write(&garbage, b"not gzip").unwrap();
        assert!(matches!(unpack_tar_gz(&garbage, &dest), Err(NtlError::MalformedInput(_))));
    }

    #[tokio::test]
    async fn test_existing_tile_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        // Unroutable prefix: any network access would fail
        let fetcher = HttpTileFetcher::new("http://127.0.0.1:9/", dir.path(), FetchConfig::default()).unwrap();
        let path = fetcher.local_path("T1");
        std::fs::write(&path, b"tiff").unwrap();

        assert_eq!(fetcher.fetch_tile("T1").await.unwrap(), path);
    }

    #[tokio::test]
    async fn test_tile_archive_is_unpacked_into_place() {
        let archive = tar_gz(&[("T1_gec.tif", b"raster bytes"), ("T1_meta.xml", b"<x/>")]);
        let (prefix, hits) = serve(archive).await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpTileFetcher::new(prefix, dir.path(), quick_config()).unwrap();

        let path = fetcher.fetch_tile("T1").await.unwrap();
        assert_eq!(path, dir.path().join("T1_gec.tif"));
        assert_eq!(std::fs::read(&path).unwrap(), b"raster bytes");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Staging is cleaned up
        let staging = dir.path().join(STAGING_DIR);
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_of_one_tile_do_not_collide() {
        let payload = vec![7u8; 256 * 1024];
        let (prefix, _) = serve(tar_gz(&[("T1_gec.tif", payload.as_slice())])).await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(HttpTileFetcher::new(prefix, dir.path(), quick_config()).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let fetcher = fetcher.clone();
                tokio::spawn(async move { fetcher.fetch_tile("T1").await })
            })
            .collect();
        for handle in handles {
            let path = handle.await.unwrap().unwrap();
            assert_eq!(std::fs::read(&path).unwrap(), payload);
        }
    }

    #[tokio::test]
    async fn test_archive_without_raster_is_malformed() {
        let (prefix, _) = serve(tar_gz(&[("other.tif", b"x")])).await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpTileFetcher::new(prefix, dir.path(), quick_config()).unwrap();

        let err = fetcher.fetch_tile("T1").await.unwrap_err();
        assert!(matches!(err, NtlError::MalformedInput(_)));
        assert!(!fetcher.local_path("T1").exists());
    }

    #[tokio::test]
    async fn test_missing_tile_is_not_found() {
        let (prefix, hits) = serve(Vec::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpTileFetcher::new(prefix, dir.path(), quick_config()).unwrap();

        let err = fetcher.fetch_tile("missing_T9").await.unwrap_err();
        assert!(matches!(err, NtlError::NotFound(_)));
        // Not retried
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_metadata_archive_fills_descriptor_dir() {
        let archive = tar_gz(&[("T1_meta.xml", b"<a/>"), ("T2_meta.xml", b"<b/>"), ("README", b"r")]);
        let (prefix, hits) = serve(archive).await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpTileFetcher::new("http://unused/", dir.path().join("tiles"), quick_config()).unwrap();
        let metadata_dir = dir.path().join("metadata");
        let url = format!("{}metadata%2FMETA.tar.gz", prefix);

        assert_eq!(fetcher.fetch_metadata(&url, &metadata_dir, false).await.unwrap(), 2);
        assert!(metadata_dir.join("T1_meta.xml").exists());
        assert!(metadata_dir.join(METADATA_ARCHIVE).exists());

        // Archive kept: a second sync only unpacks
        assert_eq!(fetcher.fetch_metadata(&url, &metadata_dir, false).await.unwrap(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        fetcher.fetch_metadata(&url, &metadata_dir, true).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_upstream_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = FetchConfig {
            request_timeout: Duration::from_secs(2),
            ..quick_config()
        };
        let fetcher = HttpTileFetcher::new("http://127.0.0.1:9/", dir.path(), config).unwrap();

        let err = fetcher.fetch_tile("T1").await.unwrap_err();
        assert!(matches!(err, NtlError::UpstreamFailure { .. }));
        assert!(!fetcher.local_path("T1").exists());
        assert_eq!(std::fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }
}
