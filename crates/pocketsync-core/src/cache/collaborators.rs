//! Interfaces to the collaborators the cache consumes but does not implement.
//!
//! The backend client in [`crate::api`] implements all three for the finance
//! dashboard; tests use in-memory doubles.

use async_trait::async_trait;

use super::keys::{CacheKey, OwnerId};
use super::mutation::MutationIntent;
use super::reconcile::ReconcileResult;
use crate::api::ApiError;

/// Loads the authoritative value for a key.
#[async_trait]
pub trait Fetcher<V>: Send + Sync {
    async fn fetch(&self, key: &CacheKey) -> Result<V, ApiError>;
}

/// Persists a mutation. May return the value the backend stored, which
/// replaces the optimistic guess (server-assigned ids, computed fields).
#[async_trait]
pub trait RemoteWriter<V>: Send + Sync {
    async fn write(&self, intent: &MutationIntent<V>) -> Result<Option<V>, ApiError>;
}

/// Runs the external bulk sync job for an owner and returns its result.
#[async_trait]
pub trait Reconciler<V>: Send + Sync {
    async fn run(&self, owner: &OwnerId) -> Result<ReconcileResult<V>, ApiError>;
}
