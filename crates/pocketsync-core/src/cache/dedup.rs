//! Request deduplication for entity fetches.
//!
//! When several views ask for the same key while a fetch is already in
//! flight, only one fetch runs and every caller receives the same result.
//!
//! ```text
//! Dashboard read ──┐
//!                  │                              Fetcher
//! Detail read    ──┼──► RequestDeduplicator ─────► (one call)
//!                  │          │                        │
//! Revalidation   ──┘          ▼                        ▼
//!                     [all receive the same ◄──────────┘
//!                      Result]
//! ```
//!
//! Pending fetches are `futures::future::Shared` handles. New fetches are
//! spawned onto the runtime, so they settle even if the caller that started
//! them goes away.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info};

use super::error::CacheError;
use super::keys::CacheKey;

pub type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

/// Handle returned by [`RequestDeduplicator::fetch_once`].
pub struct PendingFetch<V> {
    pub fetch: SharedFetch<V>,
    /// True when the caller joined a fetch someone else started.
    pub joined: bool,
}

/// Statistics for monitoring coalescing effectiveness.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupStats {
    /// Total fetch requests received
    pub total_requests: u64,
    /// Requests that joined an in-flight fetch
    pub coalesced_requests: u64,
    /// Requests that started a new fetch
    pub new_requests: u64,
}

impl DedupStats {
    /// Returns the coalescing ratio (0.0 to 1.0)
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}

pub struct RequestDeduplicator<V> {
    /// key -> (fetch id, shared handle)
    in_flight: Mutex<HashMap<CacheKey, (u64, SharedFetch<V>)>>,
    next_id: AtomicU64,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    new_requests: AtomicU64,
}

impl<V> RequestDeduplicator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            total_requests: AtomicU64::new(0),
            coalesced_requests: AtomicU64::new(0),
            new_requests: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, (u64, SharedFetch<V>)>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the pending fetch for `key`, or start one with `fetcher`.
    ///
    /// `fetcher` is only invoked when no fetch is pending. When the fetch
    /// settles, the pending handle is removed first and `on_settled` runs
    /// afterwards, so anything `on_settled` writes is never observed by a
    /// caller that could still join this fetch.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn fetch_once<F, Fut, S>(self: &Arc<Self>, key: &CacheKey, fetcher: F, on_settled: S) -> PendingFetch<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CacheError>> + Send + 'static,
        S: FnOnce(&Result<V, CacheError>) + Send + 'static,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let mut in_flight = self.lock();
        if let Some((_, existing)) = in_flight.get(key) {
            self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Joining in-flight fetch");
            return PendingFetch {
                fetch: existing.clone(),
                joined: true,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let owner = Arc::downgrade(self);
        let settled_key = key.clone();
        let work = fetcher();
        let shared = async move {
            let result = work.await;
            if let Some(dedup) = owner.upgrade() {
                dedup.settle(&settled_key, id);
            }
            on_settled(&result);
            result
        }
        .boxed()
        .shared();

        in_flight.insert(key.clone(), (id, shared.clone()));
        self.new_requests.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, in_flight_count = in_flight.len(), "Starting new fetch");
        drop(in_flight);

        tokio::spawn(shared.clone());
        PendingFetch {
            fetch: shared,
            joined: false,
        }
    }

    /// Remove the bookkeeping for fetch `id`. A newer fetch for the same key
    /// (started after a `clear`) is left in place.
    fn settle(&self, key: &CacheKey, id: u64) {
        let mut in_flight = self.lock();
        if matches!(in_flight.get(key), Some((current, _)) if *current == id) {
            in_flight.remove(key);
        }
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Forget every pending fetch. Callers already holding a handle still
    /// receive its result.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Returns a snapshot of the current statistics.
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
        }
    }

    /// Returns the number of currently in-flight fetches.
    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            total_requests = stats.total_requests,
            coalesced = stats.coalesced_requests,
            new_requests = stats.new_requests,
            in_flight = self.in_flight_count(),
            coalescing_ratio = format!("{:.1}%", stats.coalescing_ratio() * 100.0),
            "Fetch deduplication statistics"
        );
    }
}

impl<V> Default for RequestDeduplicator<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::cache::keys::EntityType;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    fn key() -> CacheKey {
        CacheKey::collection(EntityType::Transactions, "user1")
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = oneshot::channel::<()>();

        let c = Arc::clone(&calls);
        let first = dedup.fetch_once(
            &key(),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async move {
                    let _ = gate.await;
                    Ok(7)
                }
            },
            |_| {},
        );
        let c = Arc::clone(&calls);
        let second = dedup.fetch_once(
            &key(),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok(8) }
            },
            |_| {},
        );

        assert!(!first.joined);
        assert!(second.joined);
        assert!(dedup.is_pending(&key()));

        release.send(()).unwrap();
        assert_eq!(first.fetch.await.unwrap(), 7);
        assert_eq!(second.fetch.await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = dedup.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.coalesced_requests, 1);
        assert_eq!(stats.new_requests, 1);
        assert!((stats.coalescing_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_failure_is_shared_with_joiners() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let (release, gate) = oneshot::channel::<()>();
        let k = key();
        let failing_key = k.clone();

        let first = dedup.fetch_once(
            &k,
            move || async move {
                let _ = gate.await;
                Err(CacheError::FetchFailure {
                    key: failing_key,
                    source: Arc::new(ApiError::ServerError("down".into())),
                })
            },
            |_| {},
        );
        let second = dedup.fetch_once(&k, || async { Ok(1) }, |_| {});
        release.send(()).unwrap();

        assert!(matches!(first.fetch.await, Err(CacheError::FetchFailure { .. })));
        assert!(matches!(second.fetch.await, Err(CacheError::FetchFailure { .. })));
    }

    #[tokio::test]
    async fn test_pending_handle_cleared_before_on_settled() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let observed = Arc::new(Mutex::new(None));

        let d = Arc::clone(&dedup);
        let o = Arc::clone(&observed);
        let pending = dedup.fetch_once(
            &key(),
            || async { Ok(1) },
            move |_| {
                *o.lock().unwrap() = Some(d.is_pending(&key()));
            },
        );
        pending.fetch.await.unwrap();

        assert_eq!(*observed.lock().unwrap(), Some(false));
        assert_eq!(dedup.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_after_settlement_starts_fresh() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in 1..=2 {
            let c = Arc::clone(&calls);
            let pending = dedup.fetch_once(
                &key(),
                move || {
                    let n = c.fetch_add(1, Ordering::SeqCst) as u32 + 1;
                    async move { Ok(n) }
                },
                |_| {},
            );
            assert!(!pending.joined);
            assert_eq!(pending.fetch.await.unwrap(), expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_settle_does_not_remove_newer_fetch() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let (release_old, gate_old) = oneshot::channel::<()>();
        let (release_new, gate_new) = oneshot::channel::<()>();

        let old = dedup.fetch_once(
            &key(),
            move || async move {
                let _ = gate_old.await;
                Ok(1)
            },
            |_| {},
        );
        dedup.clear();
        let new = dedup.fetch_once(
            &key(),
            move || async move {
                let _ = gate_new.await;
                Ok(2)
            },
            |_| {},
        );
        assert!(!new.joined);

        release_old.send(()).unwrap();
        assert_eq!(old.fetch.await.unwrap(), 1);
        assert!(dedup.is_pending(&key()));

        release_new.send(()).unwrap();
        assert_eq!(new.fetch.await.unwrap(), 2);
        assert!(!dedup.is_pending(&key()));
    }
}
