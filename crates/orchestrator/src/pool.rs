//! Process-wide pool for CPU-heavy raster work.
//!
//! Decoding, masking, merging and encoding run here instead of on the tokio
//! runtime. Rayon iterators used inside a job run on this pool's threads.

use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::sync::oneshot;
use tracing::{debug, error};

use ntl_common::{NtlError, NtlResult};

/// A bounded rayon pool whose jobs are awaited from async code.
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// Build a pool with `threads` workers; 0 means one per core.
    pub fn new(threads: usize) -> NtlResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ntl-raster-{}", i))
            .panic_handler(|_| error!("Raster worker panicked"))
            .build()
            .map_err(|e| NtlError::ConfigError(format!("worker pool init failed: {}", e)))?;

        debug!(threads = pool.current_num_threads(), "Started raster worker pool");
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `job` on the pool and await its result.
    ///
    /// Dropping the returned future does not stop a job that already started;
    /// its result is discarded.
    pub async fn run<F, T>(&self, job: F) -> NtlResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = tx.send(job());
        });
        rx.await
            .map_err(|_| NtlError::InternalError("raster job aborted".to_string()))
    }
}
