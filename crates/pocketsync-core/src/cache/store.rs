//! The authoritative in-memory table of cached values.
//!
//! One [`CacheEntry`] exists per distinct [`CacheKey`]. The store never
//! fetches anything itself; it records what the fetch and mutation layers
//! tell it and notifies subscribers about it. Subscriber callbacks always run
//! after the internal lock has been released, so a callback may read from the
//! cache again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::freshness::FreshnessPolicy;
use super::keys::{CacheKey, OwnerId};
use super::error::CacheError;

/// Receives change notifications for the keys it subscribed to.
pub trait Subscriber: Send + Sync {
    fn on_change(&self, key: &CacheKey);
}

impl<F> Subscriber for F
where
    F: Fn(&CacheKey) + Send + Sync,
{
    fn on_change(&self, key: &CacheKey) {
        self(key)
    }
}

pub type SubscriptionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryStatus {
    Idle,
    Fetching,
    Fresh,
    Stale,
    Error,
}

/// Point-in-time copy of an entry, handed out to callers.
#[derive(Debug, Clone)]
pub struct EntrySnapshot<V> {
    pub value: Option<V>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    pub last_error: Option<CacheError>,
}

impl<V> EntrySnapshot<V> {
    fn idle() -> Self {
        Self {
            value: None,
            fetched_at: None,
            status: EntryStatus::Idle,
            last_error: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == EntryStatus::Idle
    }
}

struct CacheEntry<V> {
    value: Option<V>,
    fetched_at: Option<DateTime<Utc>>,
    status: EntryStatus,
    last_error: Option<CacheError>,
    /// Invalidated while a fetch was pending; that fetch settles as `Stale`.
    stale_on_settle: bool,
    subscribers: Vec<(SubscriptionId, Weak<dyn Subscriber>)>,
}

impl<V: Clone> CacheEntry<V> {
    fn new() -> Self {
        Self {
            value: None,
            fetched_at: None,
            status: EntryStatus::Idle,
            last_error: None,
            stale_on_settle: false,
            subscribers: Vec::new(),
        }
    }

    fn snapshot(&self) -> EntrySnapshot<V> {
        EntrySnapshot {
            value: self.value.clone(),
            fetched_at: self.fetched_at,
            status: self.status,
            last_error: self.last_error.clone(),
        }
    }

    fn set_fresh(&mut self, value: V, fetched_at: DateTime<Utc>) {
        self.value = Some(value);
        self.fetched_at = Some(fetched_at);
        self.status = EntryStatus::Fresh;
        self.last_error = None;
        self.stale_on_settle = false;
    }

    /// Upgrade live subscribers and drop the dead ones.
    fn live_subscribers(&mut self) -> Vec<Arc<dyn Subscriber>> {
        let mut live = Vec::with_capacity(self.subscribers.len());
        self.subscribers.retain(|(_, weak)| match weak.upgrade() {
            Some(subscriber) => {
                live.push(subscriber);
                true
            }
            None => false,
        });
        live
    }
}

/// Outcome of checking an entry for a read.
pub(crate) enum Lookup<V> {
    /// Fresh and within its window.
    Hit(V),
    /// Stale or expired; serve the value and refetch in the background.
    Revalidate(V),
    /// A fetch is pending and there is a previous value to serve meanwhile.
    InFlight(V),
    /// Nothing to serve; the caller has to wait for a fetch.
    Miss,
    /// Last fetch failed. Only an explicit refetch leaves this state.
    Failed {
        value: Option<V>,
        error: Option<CacheError>,
    },
}

struct Inner<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    generation: u64,
    next_subscription: SubscriptionId,
}

pub struct EntryStore<V> {
    inner: Mutex<Inner<V>>,
}

type Notification = (CacheKey, Vec<Arc<dyn Subscriber>>);

fn notify(notifications: Vec<Notification>) {
    for (key, subscribers) in notifications {
        for subscriber in subscribers {
            subscriber.on_change(&key);
        }
    }
}

impl<V: Clone> EntryStore<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                generation: 0,
                next_subscription: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current entry for `key`, creating an `Idle` placeholder if absent.
    pub fn get(&self, key: &CacheKey) -> EntrySnapshot<V> {
        let mut inner = self.lock();
        inner
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::new)
            .snapshot()
    }

    /// Like [`get`](Self::get) but without creating a placeholder.
    pub fn peek(&self, key: &CacheKey) -> Option<EntrySnapshot<V>> {
        self.lock().entries.get(key).map(CacheEntry::snapshot)
    }

    /// Replace the value, mark it `Fresh` and notify subscribers.
    pub fn write(&self, key: &CacheKey, value: V, fetched_at: DateTime<Utc>) {
        let subscribers = {
            let mut inner = self.lock();
            let entry = inner.entries.entry(key.clone()).or_insert_with(CacheEntry::new);
            entry.set_fresh(value, fetched_at);
            entry.live_subscribers()
        };
        notify(vec![(key.clone(), subscribers)]);
    }

    /// `Fresh` becomes `Stale`. A `Fetching` entry is flagged instead, so the
    /// pending fetch (which may predate the invalidation) settles as `Stale`.
    /// Other statuses are left alone. The value is kept. Returns whether the
    /// key was invalidated.
    pub fn mark_stale(&self, key: &CacheKey) -> bool {
        let subscribers = {
            let mut inner = self.lock();
            match inner.entries.get_mut(key) {
                Some(entry) if entry.status == EntryStatus::Fresh => {
                    entry.status = EntryStatus::Stale;
                    entry.live_subscribers()
                }
                Some(entry) if entry.status == EntryStatus::Fetching => {
                    entry.stale_on_settle = true;
                    debug!(key = %key, "Pending fetch will settle stale");
                    return true;
                }
                _ => return false,
            }
        };
        debug!(key = %key, "Marked stale");
        notify(vec![(key.clone(), subscribers)]);
        true
    }

    /// Register a subscriber. Only a weak reference is kept.
    pub fn subscribe(&self, key: &CacheKey, subscriber: &Arc<dyn Subscriber>) -> SubscriptionId {
        let mut inner = self.lock();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::new)
            .subscribers
            .push((id, Arc::downgrade(subscriber)));
        id
    }

    pub fn unsubscribe(&self, key: &CacheKey, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                let before = entry.subscribers.len();
                entry.subscribers.retain(|(sid, _)| *sid != id);
                entry.subscribers.len() != before
            }
            None => false,
        }
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Keys that currently have at least one live subscriber.
    pub fn subscribed_keys(&self) -> Vec<CacheKey> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.subscribers.iter().any(|(_, w)| w.strong_count() > 0))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Drop every entry and subscriber. Fetches started before the clear
    /// carry the old generation and will not write back.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.generation += 1;
    }

    pub(crate) fn lookup(&self, key: &CacheKey, policy: &FreshnessPolicy, now: DateTime<Utc>) -> Lookup<V> {
        let mut inner = self.lock();
        let entry = inner.entries.entry(key.clone()).or_insert_with(CacheEntry::new);
        match (entry.status, entry.value.clone(), entry.fetched_at) {
            (EntryStatus::Fresh, Some(value), Some(fetched_at)) => {
                if policy.is_fresh(key.entity(), fetched_at, now) {
                    Lookup::Hit(value)
                } else {
                    Lookup::Revalidate(value)
                }
            }
            (EntryStatus::Stale, Some(value), _) => Lookup::Revalidate(value),
            (EntryStatus::Fetching, Some(value), _) => Lookup::InFlight(value),
            (EntryStatus::Error, value, _) => Lookup::Failed {
                value,
                error: entry.last_error.clone(),
            },
            _ => Lookup::Miss,
        }
    }

    /// Record that a fetch of `generation` started. Returns false, leaving
    /// the entry alone, when the cache was cleared in the meantime.
    pub(crate) fn begin_fetch(&self, key: &CacheKey, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::new)
            .status = EntryStatus::Fetching;
        true
    }

    /// Apply a settled fetch. A failure keeps the last good value. Returns
    /// false when the cache was cleared since the fetch started.
    pub(crate) fn settle_fetch(
        &self,
        key: &CacheKey,
        result: &Result<V, CacheError>,
        fetched_at: DateTime<Utc>,
        generation: u64,
    ) -> bool {
        let subscribers = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return false;
            }
            let entry = inner.entries.entry(key.clone()).or_insert_with(CacheEntry::new);
            match result {
                Ok(value) => {
                    let stale = entry.stale_on_settle;
                    entry.set_fresh(value.clone(), fetched_at);
                    if stale {
                        entry.status = EntryStatus::Stale;
                    }
                }
                Err(error) => {
                    entry.status = EntryStatus::Error;
                    entry.last_error = Some(error.clone());
                    entry.stale_on_settle = false;
                }
            }
            entry.live_subscribers()
        };
        notify(vec![(key.clone(), subscribers)]);
        true
    }

    /// Put back a snapshot taken before an optimistic write.
    ///
    /// A snapshot taken while a fetch was pending cannot keep `Fetching` once
    /// that fetch is gone; it falls back to `Stale` or `Idle`. If a fetch is
    /// pending now, the entry stays `Fetching`.
    pub(crate) fn restore(&self, key: &CacheKey, previous: &EntrySnapshot<V>, fetch_pending: bool) {
        let subscribers = {
            let mut inner = self.lock();
            let entry = inner.entries.entry(key.clone()).or_insert_with(CacheEntry::new);
            entry.value = previous.value.clone();
            entry.fetched_at = previous.fetched_at;
            entry.last_error = previous.last_error.clone();
            if !fetch_pending {
                entry.stale_on_settle = false;
            }
            entry.status = if fetch_pending {
                EntryStatus::Fetching
            } else if previous.status == EntryStatus::Fetching {
                if previous.value.is_some() {
                    EntryStatus::Stale
                } else {
                    EntryStatus::Idle
                }
            } else {
                previous.status
            };
            entry.live_subscribers()
        };
        notify(vec![(key.clone(), subscribers)]);
    }

    /// Write collection values under a single lock, then notify. Item keys of
    /// each written entity for the same owner are invalidated the way
    /// [`mark_stale`](Self::mark_stale) does it. Returns the keys written.
    pub(crate) fn write_collections(&self, writes: Vec<(CacheKey, V)>, fetched_at: DateTime<Utc>) -> Vec<CacheKey> {
        let (written, notifications) = {
            let mut inner = self.lock();
            let mut written: Vec<CacheKey> = Vec::with_capacity(writes.len());
            let mut notifications: Vec<Notification> = Vec::new();
            for (key, value) in writes {
                let entry = inner.entries.entry(key.clone()).or_insert_with(CacheEntry::new);
                entry.set_fresh(value, fetched_at);
                notifications.push((key.clone(), entry.live_subscribers()));
                written.push(key);
            }

            for (key, entry) in inner.entries.iter_mut() {
                let affected = !key.is_collection()
                    && written.iter().any(|w| key.matches(w.entity(), w.owner()));
                if !affected {
                    continue;
                }
                match entry.status {
                    EntryStatus::Fresh => {
                        entry.status = EntryStatus::Stale;
                        notifications.push((key.clone(), entry.live_subscribers()));
                    }
                    EntryStatus::Fetching => entry.stale_on_settle = true,
                    _ => {}
                }
            }
            (written, notifications)
        };
        notify(notifications);
        written
    }

    /// Snapshots of the collection keys held for `owner`.
    pub fn collections_for(&self, owner: &OwnerId) -> Vec<(CacheKey, EntrySnapshot<V>)> {
        let inner = self.lock();
        let mut out: Vec<_> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.owner() == owner && key.is_collection())
            .map(|(key, entry)| (key.clone(), entry.snapshot()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl<V: Clone> Default for EntryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Default for EntrySnapshot<V> {
    fn default() -> Self {
        Self::idle()
    }
}
