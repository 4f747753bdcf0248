use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::collaborators::{Fetcher, Reconciler, RemoteWriter};
use super::dedup::{DedupStats, PendingFetch, RequestDeduplicator};
use super::error::CacheError;
use super::freshness::FreshnessPolicy;
use super::invalidation::InvalidationGraph;
use super::keys::{CacheKey, EntityType, OwnerId};
use super::mutation::{MutationCoordinator, MutationOutcome};
use super::reconcile::ReconcileResult;
use super::store::{EntrySnapshot, EntryStatus, EntryStore, Lookup, Subscriber, SubscriptionId};

/// Tunables for a [`CacheManager`]. `Default` gives the standard tables and
/// the wall clock.
pub struct CacheOptions {
    pub policy: FreshnessPolicy,
    pub graph: InvalidationGraph,
    pub clock: Arc<dyn Clock>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            policy: FreshnessPolicy::default(),
            graph: InvalidationGraph::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// The cache instance for one signed-in user.
///
/// Owned by the application root and dropped (or [`dispose`](Self::dispose)d)
/// on logout. Cheap operations (`get`, `write`, `mark_stale`, subscriptions)
/// are synchronous; `read`, `refetch`, `mutate` and `sync` await collaborators.
pub struct CacheManager<V> {
    owner: OwnerId,
    store: Arc<EntryStore<V>>,
    dedup: Arc<RequestDeduplicator<V>>,
    mutations: MutationCoordinator<V>,
    policy: FreshnessPolicy,
    fetcher: Arc<dyn Fetcher<V>>,
    clock: Arc<dyn Clock>,
}

impl<V> CacheManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(owner: impl Into<OwnerId>, fetcher: Arc<dyn Fetcher<V>>) -> Self {
        Self::with_options(owner, fetcher, CacheOptions::default())
    }

    pub fn with_options(owner: impl Into<OwnerId>, fetcher: Arc<dyn Fetcher<V>>, options: CacheOptions) -> Self {
        let store = Arc::new(EntryStore::new());
        let dedup = Arc::new(RequestDeduplicator::new());
        let mutations = MutationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&dedup),
            options.graph,
            Arc::clone(&options.clock),
        );
        Self {
            owner: owner.into(),
            store,
            dedup,
            mutations,
            policy: options.policy,
            fetcher,
            clock: options.clock,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    /// Collection key for this owner.
    pub fn key(&self, entity: EntityType) -> CacheKey {
        CacheKey::collection(entity, self.owner.clone())
    }

    /// Single-record (or parameterized) key for this owner.
    pub fn item_key(&self, entity: EntityType, params: impl Into<String>) -> CacheKey {
        CacheKey::with_params(entity, self.owner.clone(), params)
    }

    // ===== Entry Store =====

    pub fn get(&self, key: &CacheKey) -> EntrySnapshot<V> {
        self.store.get(key)
    }

    pub fn write(&self, key: &CacheKey, value: V, fetched_at: DateTime<Utc>) {
        self.store.write(key, value, fetched_at);
    }

    pub fn mark_stale(&self, key: &CacheKey) -> bool {
        self.store.mark_stale(key)
    }

    /// Mark every cached key of `entity` for this owner stale.
    pub fn invalidate_entity(&self, entity: EntityType) -> usize {
        self.store
            .keys()
            .iter()
            .filter(|key| key.matches(entity, &self.owner))
            .filter(|key| self.store.mark_stale(key))
            .count()
    }

    pub fn subscribe(&self, key: &CacheKey, subscriber: &Arc<dyn Subscriber>) -> SubscriptionId {
        self.store.subscribe(key, subscriber)
    }

    pub fn unsubscribe(&self, key: &CacheKey, id: SubscriptionId) -> bool {
        self.store.unsubscribe(key, id)
    }

    // ===== Reads =====

    /// Read `key`, fetching only when the cached value cannot be served.
    ///
    /// - fresh and within its max age: cached value, no fetch
    /// - stale or expired: cached value now, refetch in the background
    /// - fetch pending with a previous value: that value
    /// - nothing cached yet: waits for the (possibly shared) fetch
    /// - last fetch failed: last good value if any, otherwise the error;
    ///   use [`refetch`](Self::refetch) to retry
    pub async fn read(&self, key: &CacheKey) -> Result<V, CacheError> {
        let now = self.clock.now();
        match self.store.lookup(key, &self.policy, now) {
            Lookup::Hit(value) => {
                debug!(key = %key, "Cache hit");
                Ok(value)
            }
            Lookup::Revalidate(value) => {
                debug!(key = %key, "Serving stale value while revalidating");
                self.start_fetch(key);
                Ok(value)
            }
            Lookup::InFlight(value) => {
                debug!(key = %key, "Serving previous value, fetch in flight");
                Ok(value)
            }
            Lookup::Failed { value: Some(value), .. } => Ok(value),
            Lookup::Failed { value: None, error: Some(error) } => Err(error),
            Lookup::Failed { value: None, error: None } | Lookup::Miss => self.await_fetch(key).await,
        }
    }

    /// Fetch `key` now regardless of freshness, joining a pending fetch if
    /// there is one. This is the explicit retry that leaves `Error`.
    pub async fn refetch(&self, key: &CacheKey) -> Result<V, CacheError> {
        self.await_fetch(key).await
    }

    async fn await_fetch(&self, key: &CacheKey) -> Result<V, CacheError> {
        let generation = self.store.generation();
        let result = self.start_fetch(key).fetch.await;
        if self.store.generation() != generation {
            return Err(CacheError::Disposed(key.clone()));
        }
        result
    }

    fn start_fetch(&self, key: &CacheKey) -> PendingFetch<V> {
        let generation = self.store.generation();

        let store = Arc::clone(&self.store);
        let fetcher = Arc::clone(&self.fetcher);
        let fetch_key = key.clone();
        let begin = move || {
            store.begin_fetch(&fetch_key, generation);
            async move {
                fetcher
                    .fetch(&fetch_key)
                    .await
                    .map_err(|e| CacheError::FetchFailure {
                        key: fetch_key,
                        source: Arc::new(e),
                    })
            }
        };

        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let settle_key = key.clone();
        let on_settled = move |result: &Result<V, CacheError>| {
            if let Err(ref e) = result {
                warn!(key = %settle_key, error = %e, "Fetch failed");
            }
            store.settle_fetch(&settle_key, result, clock.now(), generation);
        };

        self.dedup.fetch_once(key, begin, on_settled)
    }

    /// Start background fetches for subscribed keys that are stale or past
    /// their max age. Returns how many keys were scheduled.
    pub fn revalidate_expired(&self) -> usize {
        let now = self.clock.now();
        let mut scheduled = 0;
        for key in self.store.subscribed_keys() {
            let Some(snapshot) = self.store.peek(&key) else {
                continue;
            };
            let expired = match (snapshot.status, snapshot.fetched_at) {
                (EntryStatus::Stale, _) => true,
                (EntryStatus::Fresh, Some(fetched_at)) => !self.policy.is_fresh(key.entity(), fetched_at, now),
                _ => false,
            };
            if expired {
                self.start_fetch(&key);
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            debug!(scheduled, "Scheduled background revalidation");
        }
        scheduled
    }

    // ===== Mutations =====

    /// See [`MutationCoordinator::mutate`].
    pub async fn mutate<F>(
        &self,
        key: &CacheKey,
        operation: &str,
        apply: F,
        writer: &dyn RemoteWriter<V>,
    ) -> Result<MutationOutcome<V>, CacheError>
    where
        F: FnOnce(Option<&V>) -> V + Send,
    {
        self.mutations.mutate(key, operation, apply, writer).await
    }

    // ===== Reconciliation =====

    /// Apply a bulk sync result: every mentioned entity's collection key is
    /// overwritten and marked fresh, whatever its status, and its item keys
    /// are marked stale. Entities not in the result are untouched. Returns
    /// the collection keys written.
    pub fn reconcile(&self, result: ReconcileResult<V>) -> Result<Vec<CacheKey>, CacheError> {
        if result.owner != self.owner {
            return Err(CacheError::OwnerMismatch {
                expected: self.owner.clone(),
                found: result.owner,
            });
        }
        let written = self.store.write_collections(result.into_writes(), self.clock.now());
        info!(owner = %self.owner, collections = written.len(), "Reconciled cache from sync result");
        Ok(written)
    }

    /// Run the external sync job and apply its result. On failure the cache
    /// is left exactly as it was.
    pub async fn sync(&self, reconciler: &dyn Reconciler<V>) -> Result<Vec<CacheKey>, CacheError> {
        info!(owner = %self.owner, "Starting sync");
        match reconciler.run(&self.owner).await {
            Ok(result) => self.reconcile(result),
            Err(e) => {
                warn!(owner = %self.owner, error = %e, "Sync failed, cache left untouched");
                Err(CacheError::ReconciliationFailure {
                    owner: self.owner.clone(),
                    source: Arc::new(e),
                })
            }
        }
    }

    // ===== Lifecycle =====

    /// Drop all cached data, pending fetch bookkeeping and mutation queues.
    /// Fetches still in flight finish but never write back.
    pub fn dispose(&self) {
        self.store.clear();
        self.dedup.clear();
        self.mutations.clear();
        info!(owner = %self.owner, "Cache disposed");
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    pub fn log_stats(&self) {
        self.dedup.log_stats();
    }

    /// Age summary of every cached collection, for status displays.
    pub fn snapshot_ages(&self) -> Vec<CollectionAge> {
        let now = self.clock.now();
        self.store
            .collections_for(&self.owner)
            .into_iter()
            .map(|(key, snapshot)| CollectionAge {
                entity: key.entity(),
                status: snapshot.status,
                age: snapshot.fetched_at.map(|at| age_display(at, now)),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionAge {
    pub entity: EntityType,
    pub status: EntryStatus,
    /// `None` when the collection was never fetched.
    pub age: Option<String>,
}

/// Compact age for status lines: "just now", "5m ago", "2h ago", "3d ago".
pub fn age_display(fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - fetched_at).num_minutes();
    if minutes < 1 {
        // Also covers clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            // Round up: 1h 30m+ becomes 2h
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::cache::clock::ManualClock;
    use crate::cache::mutation::MutationIntent;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Counts calls; each call waits on `gate` when `gated` and answers from
    /// the scripted queue (defaulting to the call number).
    struct ScriptedFetcher {
        calls: AtomicUsize,
        gated: bool,
        gate: Notify,
        script: Mutex<VecDeque<Result<u32, ApiError>>>,
    }

    impl ScriptedFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gated: false,
                gate: Notify::new(),
                script: Mutex::new(VecDeque::new()),
            })
        }

        fn gated() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gated: true,
                gate: Notify::new(),
                script: Mutex::new(VecDeque::new()),
            })
        }

        fn push(&self, result: Result<u32, ApiError>) {
            self.script.lock().unwrap().push_back(result);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher<u32> for ScriptedFetcher {
        async fn fetch(&self, _key: &CacheKey) -> Result<u32, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.gated {
                self.gate.notified().await;
            }
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or(Ok(n as u32 * 100))
        }
    }

    struct Harness {
        cache: CacheManager<u32>,
        fetcher: Arc<ScriptedFetcher>,
        clock: Arc<ManualClock>,
    }

    fn harness(fetcher: Arc<ScriptedFetcher>) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let options = CacheOptions {
            clock: Arc::clone(&clock) as Arc<dyn Clock>,
            ..CacheOptions::default()
        };
        let cache = CacheManager::with_options("user1", Arc::clone(&fetcher) as Arc<dyn Fetcher<u32>>, options);
        Harness { cache, fetcher, clock }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_first_read_waits_for_fetch() {
        let h = harness(ScriptedFetcher::new());
        let key = h.cache.key(EntityType::Pots);

        assert_eq!(h.cache.read(&key).await.unwrap(), 100);
        let snapshot = h.cache.get(&key);
        assert_eq!(snapshot.status, EntryStatus::Fresh);
        assert_eq!(snapshot.value, Some(100));
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_read_within_max_age_does_not_fetch() {
        let h = harness(ScriptedFetcher::new());
        let key = h.cache.key(EntityType::Transactions);
        h.cache.write(&key, 7, h.clock.now());

        h.clock.advance(Duration::milliseconds(59_000));
        assert_eq!(h.cache.read(&key).await.unwrap(), 7);
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_transactions_freshness_scenario() {
        let h = harness(ScriptedFetcher::gated());
        let key = CacheKey::collection(EntityType::Transactions, "user1");
        h.cache.write(&key, 1, h.clock.now());

        // t=30000: served from cache
        h.clock.set_millis(30_000);
        assert_eq!(h.cache.read(&key).await.unwrap(), 1);
        assert_eq!(h.fetcher.calls(), 0);

        // t=70000: past the 60s window, refetch starts, old value served
        h.clock.set_millis(70_000);
        assert_eq!(h.cache.read(&key).await.unwrap(), 1);
        settle().await;
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.cache.get(&key).status, EntryStatus::Fetching);

        // A second read while pending joins instead of fetching again
        assert_eq!(h.cache.read(&key).await.unwrap(), 1);
        let joined = h.cache.refetch(&key);
        tokio::pin!(joined);
        tokio::select! {
            _ = &mut joined => panic!("fetch should still be pending"),
            _ = settle() => {}
        }
        assert_eq!(h.fetcher.calls(), 1);

        h.fetcher.gate.notify_one();
        assert_eq!(joined.await.unwrap(), 100);
        assert_eq!(h.fetcher.calls(), 1);
        let snapshot = h.cache.get(&key);
        assert_eq!(snapshot.status, EntryStatus::Fresh);
        assert_eq!(snapshot.fetched_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_concurrent_first_reads_fetch_once() {
        let h = harness(ScriptedFetcher::gated());
        let key = h.cache.key(EntityType::Debts);

        let reads = futures::future::join_all((0..5).map(|_| h.cache.read(&key)));
        let release = async {
            settle().await;
            h.fetcher.gate.notify_one();
        };
        let (results, _) = tokio::join!(reads, release);

        assert!(results.iter().all(|r| matches!(r, Ok(100))));
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.cache.dedup_stats().new_requests, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_enters_error_and_requires_refetch() {
        let h = harness(ScriptedFetcher::new());
        let key = h.cache.key(EntityType::Income);
        h.fetcher.push(Err(ApiError::Timeout(30)));

        let err = h.cache.read(&key).await.unwrap_err();
        assert!(matches!(err, CacheError::FetchFailure { .. }));
        assert_eq!(h.cache.get(&key).status, EntryStatus::Error);

        // No silent retry
        assert!(h.cache.read(&key).await.is_err());
        assert_eq!(h.fetcher.calls(), 1);

        assert_eq!(h.cache.refetch(&key).await.unwrap(), 200);
        assert_eq!(h.cache.get(&key).status, EntryStatus::Fresh);
    }

    #[tokio::test]
    async fn test_failed_revalidation_keeps_last_good_value() {
        let h = harness(ScriptedFetcher::new());
        let key = h.cache.key(EntityType::Budgets);
        h.cache.write(&key, 5, h.clock.now());
        h.cache.mark_stale(&key);
        h.fetcher.push(Err(ApiError::ServerError("maintenance".into())));

        assert_eq!(h.cache.read(&key).await.unwrap(), 5);
        settle().await;

        let snapshot = h.cache.get(&key);
        assert_eq!(snapshot.status, EntryStatus::Error);
        assert_eq!(snapshot.value, Some(5));
        // Known-good value is still served
        assert_eq!(h.cache.read(&key).await.unwrap(), 5);
        assert_eq!(h.fetcher.calls(), 1);
    }

    struct FailingWriter;

    #[async_trait]
    impl RemoteWriter<u32> for FailingWriter {
        async fn write(&self, _intent: &MutationIntent<u32>) -> Result<Option<u32>, ApiError> {
            Err(ApiError::ServerError("edge function crashed".into()))
        }
    }

    struct AcceptingWriter;

    #[async_trait]
    impl RemoteWriter<u32> for AcceptingWriter {
        async fn write(&self, _intent: &MutationIntent<u32>) -> Result<Option<u32>, ApiError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_debt_payment_rollback_scenario() {
        let h = harness(ScriptedFetcher::new());
        let payment = CacheKey::with_params(EntityType::DebtPayments, "user1", "payment42");
        let totals = h.cache.key(EntityType::Totals);
        h.cache.write(&payment, 80, h.clock.now());
        h.cache.write(&totals, 1_000, h.clock.now());

        let result = h.cache.mutate(&payment, "update_debt_payment", |_| 100, &FailingWriter).await;

        assert!(matches!(result, Err(CacheError::MutationFailure { .. })));
        assert_eq!(h.cache.get(&payment).value, Some(80));
        assert_eq!(h.cache.get(&payment).status, EntryStatus::Fresh);
        assert_eq!(h.cache.get(&totals).status, EntryStatus::Fresh);
    }

    #[tokio::test]
    async fn test_committed_mutation_invalidates_and_next_read_refetches() {
        let h = harness(ScriptedFetcher::new());
        let transactions = h.cache.key(EntityType::Transactions);
        let budgets = h.cache.key(EntityType::Budgets);
        let pots = h.cache.key(EntityType::Pots);
        let totals = h.cache.key(EntityType::Totals);
        let profile = h.cache.key(EntityType::Profile);
        for key in [&budgets, &pots, &totals, &profile] {
            h.cache.write(key, 1, h.clock.now());
        }

        h.cache.mutate(&transactions, "add_transaction", |_| 42, &AcceptingWriter).await.unwrap();

        assert_eq!(h.cache.get(&budgets).status, EntryStatus::Stale);
        assert_eq!(h.cache.get(&pots).status, EntryStatus::Stale);
        assert_eq!(h.cache.get(&totals).status, EntryStatus::Stale);
        assert_eq!(h.cache.get(&profile).status, EntryStatus::Fresh);

        // Stale-while-revalidate: old value now, fresh value after the fetch
        assert_eq!(h.cache.read(&totals).await.unwrap(), 1);
        settle().await;
        assert_eq!(h.cache.get(&totals).value, Some(100));
        assert_eq!(h.cache.get(&totals).status, EntryStatus::Fresh);
    }

    #[tokio::test]
    async fn test_reconcile_leaves_unmentioned_entities_untouched() {
        let h = harness(ScriptedFetcher::new());
        let debts = h.cache.key(EntityType::Debts);
        let income = h.cache.key(EntityType::Income);
        let pots = h.cache.key(EntityType::Pots);
        h.cache.write(&pots, 9, h.clock.now());
        h.cache.mark_stale(&pots);
        h.cache.write(&debts, 1, h.clock.now());
        h.cache.mark_stale(&debts);
        let pots_before = h.cache.get(&pots);

        h.clock.set_millis(5_000);
        let result = ReconcileResult::new("user1")
            .with(EntityType::Debts, 20)
            .with(EntityType::Income, 30);
        let written = h.cache.reconcile(result).unwrap();

        assert_eq!(written, vec![debts.clone(), income.clone()]);
        assert_eq!(h.cache.get(&debts).value, Some(20));
        assert_eq!(h.cache.get(&debts).status, EntryStatus::Fresh);
        assert_eq!(h.cache.get(&income).value, Some(30));
        let pots_after = h.cache.get(&pots);
        assert_eq!(pots_after.value, pots_before.value);
        assert_eq!(pots_after.status, pots_before.status);
        assert_eq!(pots_after.fetched_at, pots_before.fetched_at);
    }

    #[tokio::test]
    async fn test_reconcile_invalidates_item_keys_of_mentioned_entities() {
        let h = harness(ScriptedFetcher::new());
        let car_loan = h.cache.item_key(EntityType::Debts, "car-loan");
        let holiday = h.cache.item_key(EntityType::Pots, "holiday");
        h.cache.write(&car_loan, 5, h.clock.now());
        h.cache.write(&holiday, 6, h.clock.now());

        h.cache.reconcile(ReconcileResult::new("user1").with(EntityType::Debts, 20)).unwrap();

        assert_eq!(h.cache.get(&car_loan).status, EntryStatus::Stale);
        let holiday_after = h.cache.get(&holiday);
        assert_eq!(holiday_after.status, EntryStatus::Fresh);
        assert_eq!(holiday_after.value, Some(6));

        // Next read of the item serves the old value and refetches it
        assert_eq!(h.cache.read(&car_loan).await.unwrap(), 5);
        settle().await;
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.cache.get(&car_loan).status, EntryStatus::Fresh);
    }

    #[tokio::test]
    async fn test_commit_during_dependent_fetch_leaves_dependent_stale() {
        let h = harness(ScriptedFetcher::gated());
        let totals = h.cache.key(EntityType::Totals);
        let transactions = h.cache.key(EntityType::Transactions);

        let first_read = h.cache.read(&totals);
        let commit = async {
            settle().await;
            assert_eq!(h.cache.get(&totals).status, EntryStatus::Fetching);
            let outcome = h
                .cache
                .mutate(&transactions, "add_transaction", |_| 42, &AcceptingWriter)
                .await
                .unwrap();
            assert!(outcome.invalidated.contains(&totals));
            // Fetch started before the commit settles only now
            h.fetcher.gate.notify_one();
        };
        let (value, _) = tokio::join!(first_read, commit);
        assert_eq!(value.unwrap(), 100);

        let snapshot = h.cache.get(&totals);
        assert_eq!(snapshot.status, EntryStatus::Stale);
        assert_eq!(snapshot.value, Some(100));

        // Served while revalidating, with a second fetch issued
        assert_eq!(h.cache.read(&totals).await.unwrap(), 100);
        settle().await;
        assert_eq!(h.fetcher.calls(), 2);
        h.fetcher.gate.notify_one();
    }

    #[tokio::test]
    async fn test_reconcile_supersedes_error_entries() {
        let h = harness(ScriptedFetcher::new());
        let debts = h.cache.key(EntityType::Debts);
        h.fetcher.push(Err(ApiError::Unauthorized));
        assert!(h.cache.read(&debts).await.is_err());

        h.cache.reconcile(ReconcileResult::new("user1").with(EntityType::Debts, 3)).unwrap();
        let snapshot = h.cache.get(&debts);
        assert_eq!(snapshot.status, EntryStatus::Fresh);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_rejects_other_owner() {
        let h = harness(ScriptedFetcher::new());
        let err = h
            .cache
            .reconcile(ReconcileResult::new("user2").with(EntityType::Debts, 1))
            .unwrap_err();
        assert!(matches!(err, CacheError::OwnerMismatch { .. }));
        assert!(h.cache.get(&h.cache.key(EntityType::Debts)).is_idle());
    }

    struct BrokenSync;

    #[async_trait]
    impl Reconciler<u32> for BrokenSync {
        async fn run(&self, _owner: &OwnerId) -> Result<ReconcileResult<u32>, ApiError> {
            Err(ApiError::ServerError("sync job failed".into()))
        }
    }

    struct WorkingSync;

    #[async_trait]
    impl Reconciler<u32> for WorkingSync {
        async fn run(&self, owner: &OwnerId) -> Result<ReconcileResult<u32>, ApiError> {
            Ok(ReconcileResult::new(owner.clone()).with(EntityType::Pots, 77))
        }
    }

    #[tokio::test]
    async fn test_sync_failure_leaves_cache_untouched() {
        let h = harness(ScriptedFetcher::new());
        let pots = h.cache.key(EntityType::Pots);
        h.cache.write(&pots, 9, h.clock.now());

        let err = h.cache.sync(&BrokenSync).await.unwrap_err();
        assert!(matches!(err, CacheError::ReconciliationFailure { .. }));
        assert_eq!(h.cache.get(&pots).value, Some(9));

        h.cache.sync(&WorkingSync).await.unwrap();
        assert_eq!(h.cache.get(&pots).value, Some(77));
    }

    #[tokio::test]
    async fn test_dispose_discards_in_flight_fetch() {
        let h = harness(ScriptedFetcher::gated());
        let key = h.cache.key(EntityType::Profile);

        let read = h.cache.read(&key);
        let dispose = async {
            settle().await;
            h.cache.dispose();
            h.fetcher.gate.notify_one();
        };
        let (result, _) = tokio::join!(read, dispose);

        assert!(matches!(result, Err(CacheError::Disposed(_))));
        settle().await;
        assert!(h.cache.get(&key).is_idle());
    }

    #[tokio::test]
    async fn test_revalidate_expired_only_touches_subscribed_keys() {
        let h = harness(ScriptedFetcher::new());
        let watched = h.cache.key(EntityType::Transactions);
        let unwatched = h.cache.key(EntityType::DebtPayments);
        h.cache.write(&watched, 1, h.clock.now());
        h.cache.write(&unwatched, 1, h.clock.now());

        let notified = Arc::new(AtomicUsize::new(0));
        let n = Arc::clone(&notified);
        let subscriber: Arc<dyn Subscriber> = Arc::new(move |_: &CacheKey| {
            n.fetch_add(1, Ordering::SeqCst);
        });
        h.cache.subscribe(&watched, &subscriber);

        assert_eq!(h.cache.revalidate_expired(), 0);
        h.clock.advance(Duration::minutes(2));
        assert_eq!(h.cache.revalidate_expired(), 1);
        settle().await;

        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.cache.get(&watched).value, Some(100));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(h.cache.get(&unwatched).value, Some(1));
    }

    #[test]
    fn test_age_display() {
        let now = Utc::now();
        assert_eq!(age_display(now, now), "just now");
        assert_eq!(age_display(now + Duration::minutes(3), now), "just now");
        assert_eq!(age_display(now - Duration::minutes(5), now), "5m ago");
        assert_eq!(age_display(now - Duration::minutes(95), now), "2h ago");
        assert_eq!(age_display(now - Duration::minutes(70), now), "1h ago");
        assert_eq!(age_display(now - Duration::hours(40), now), "2d ago");
    }

    #[tokio::test]
    async fn test_snapshot_ages_lists_collections_only() {
        let h = harness(ScriptedFetcher::new());
        h.cache.write(&h.cache.key(EntityType::Pots), 1, h.clock.now());
        h.cache.write(&h.cache.item_key(EntityType::Pots, "holiday"), 1, h.clock.now());
        h.cache.get(&h.cache.key(EntityType::Debts));
        h.clock.advance(Duration::minutes(5));

        let ages = h.cache.snapshot_ages();
        assert_eq!(ages.len(), 2);
        assert_eq!(ages[0].entity, EntityType::Pots);
        assert_eq!(ages[0].age.as_deref(), Some("5m ago"));
        assert_eq!(ages[1].entity, EntityType::Debts);
        assert_eq!(ages[1].age, None);
    }
}
