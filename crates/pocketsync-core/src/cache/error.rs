use std::sync::Arc;

use thiserror::Error;

use super::keys::{CacheKey, OwnerId};
use crate::api::ApiError;

/// Failures reported by the cache. None of them is retried internally.
///
/// Collaborator errors are held in an `Arc` so the same failure can be handed
/// to every caller that joined a shared fetch.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Fetch failed for {key}: {source}")]
    FetchFailure {
        key: CacheKey,
        #[source]
        source: Arc<ApiError>,
    },

    #[error("Mutation '{operation}' failed for {key}, rolled back: {source}")]
    MutationFailure {
        key: CacheKey,
        operation: String,
        #[source]
        source: Arc<ApiError>,
    },

    #[error("Reconciliation failed for owner {owner}: {source}")]
    ReconciliationFailure {
        owner: OwnerId,
        #[source]
        source: Arc<ApiError>,
    },

    #[error("Reconciliation result for {found} does not belong to cache owner {expected}")]
    OwnerMismatch { expected: OwnerId, found: OwnerId },

    #[error("Cache was disposed while {0} was in flight")]
    Disposed(CacheKey),
}

impl CacheError {
    /// Key the failure relates to, if it relates to a single key.
    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            CacheError::FetchFailure { key, .. }
            | CacheError::MutationFailure { key, .. }
            | CacheError::Disposed(key) => Some(key),
            CacheError::ReconciliationFailure { .. } | CacheError::OwnerMismatch { .. } => None,
        }
    }
}
