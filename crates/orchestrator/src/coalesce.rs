//! Request coalescing for mosaic computations.
//!
//! Concurrent cache misses for the same key share one computation:
//!
//! ```text
//! get_mosaic(K) ─┐
//!                │                                pipeline
//! get_mosaic(K) ─┼──► RequestCoalescer ──────────► (once)
//!                │         │                         │
//! get_mosaic(K) ─┘         ▼                         ▼
//!                   [all callers await the same shared future]
//! ```
//!
//! The registry only holds weak handles. The computation is driven by the
//! callers awaiting it and is dropped once the last of them goes away, so an
//! abandoned request never keeps work alive.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use tokio::sync::Mutex;
use tracing::debug;

use ntl_common::NtlResult;

type SharedComputation<T> = Shared<BoxFuture<'static, NtlResult<T>>>;

/// Tracks in-flight computations by key.
pub struct RequestCoalescer<K, T>
where
    T: Clone,
{
    in_flight: Mutex<HashMap<K, WeakShared<BoxFuture<'static, NtlResult<T>>>>>,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
}

/// Statistics for monitoring coalescing effectiveness.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoalescerStats {
    pub total_requests: u64,
    /// Requests that joined an existing computation
    pub coalesced_requests: u64,
    pub in_flight: usize,
}

impl<K, T> RequestCoalescer<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Display,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            coalesced_requests: AtomicU64::new(0),
        }
    }

    /// Await the computation for `key`, starting it with `start` if none is live.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> NtlResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = NtlResult<T>> + Send + 'static,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let computation: SharedComputation<T> = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key).and_then(WeakShared::upgrade) {
                Some(existing) => {
                    self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Joining in-flight computation");
                    existing
                }
                None => {
                    let shared = start().boxed().shared();
                    if let Some(weak) = shared.downgrade() {
                        in_flight.insert(key.clone(), weak);
                    }
                    debug!(key = %key, in_flight = in_flight.len(), "Starting computation");
                    shared
                }
            }
        };

        let handle = computation.clone();
        let result = computation.await;
        self.finish(&key, &handle).await;
        result
    }

    /// Drop the registry entry for `key` if it still refers to `handle` or to
    /// nothing live.
    async fn finish(&self, key: &K, handle: &SharedComputation<T>) {
        let mut in_flight = self.in_flight.lock().await;
        let stale = match in_flight.get(key).map(WeakShared::upgrade) {
            Some(Some(current)) => current.ptr_eq(handle),
            Some(None) => true,
            None => false,
        };
        if stale {
            in_flight.remove(key);
        }
    }

    pub async fn stats(&self) -> CoalescerStats {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|_, weak| weak.upgrade().is_some());
        CoalescerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            in_flight: in_flight.len(),
        }
    }
}

impl<K, T> Default for RequestCoalescer<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Display,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use ntl_common::NtlError;

    #[tokio::test]
    async fn test_concurrent_requests_share_one_computation() {
        let coalescer = Arc::new(RequestCoalescer::<String, u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coalescer = coalescer.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("k".to_string(), move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let stats = coalescer.stats().await;
        assert_eq!(stats.total_requests, 8);
        assert_eq!(stats.coalesced_requests, 7);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_not_cached() {
        let coalescer = RequestCoalescer::<String, u32>::new();

        let err = coalescer
            .run("k".to_string(), || async { Err(NtlError::NotFound("x".to_string())) })
            .await;
        assert!(matches!(err, Err(NtlError::NotFound(_))));

        // A later request starts fresh
        let ok = coalescer.run("k".to_string(), || async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_computation_is_dropped() {
        let coalescer = Arc::new(RequestCoalescer::<String, u32>::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let slow = {
            let coalescer = coalescer.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                coalescer
                    .run("k".to_string(), move || async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        slow.abort();
        let _ = slow.await;

        assert_eq!(coalescer.stats().await.in_flight, 0);
        // A new caller does not join the abandoned computation
        let fresh = coalescer.run("k".to_string(), || async { Ok(2) }).await;
        assert_eq!(fresh.unwrap(), 2);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
