//! In-memory entity cache for the dashboard session.
//!
//! [`CacheManager`] is the entry point. It owns the per-key entries and
//! decides when a cached value can be served, shares one fetch between
//! concurrent readers, applies optimistic mutations with rollback, and marks
//! dependent data stale after a committed write.
//!
//! Entity data is never written to disk. A manager belongs to one signed-in
//! user and is disposed on logout.

pub mod clock;
pub mod collaborators;
pub mod dedup;
pub mod error;
pub mod freshness;
pub mod invalidation;
pub mod keys;
pub mod manager;
pub mod mutation;
pub mod reconcile;
pub mod refresh;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{Fetcher, Reconciler, RemoteWriter};
pub use dedup::{DedupStats, RequestDeduplicator};
pub use error::CacheError;
pub use freshness::{FreshnessPolicy, FreshnessRule, DEFAULT_RULES, FALLBACK_MAX_AGE_MS};
pub use invalidation::{AggregateRule, InvalidationEdge, InvalidationGraph};
pub use keys::{CacheKey, EntityType, OwnerId};
pub use manager::{age_display, CacheManager, CacheOptions, CollectionAge};
pub use mutation::{MutationCoordinator, MutationIntent, MutationOutcome, MutationPhase};
pub use reconcile::ReconcileResult;
pub use refresh::spawn_revalidation;
pub use store::{EntrySnapshot, EntryStatus, EntryStore, Subscriber, SubscriptionId};
