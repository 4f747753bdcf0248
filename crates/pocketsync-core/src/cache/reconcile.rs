//! Boundary to the external bulk sync job.
//!
//! The job itself (what it compares, when it runs) lives outside the cache.
//! Its result names an owner and the authoritative record set per entity
//! type; applying it is a bulk write of the owner's collection keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::keys::{CacheKey, EntityType, OwnerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult<V> {
    pub owner: OwnerId,
    pub collections: BTreeMap<EntityType, V>,
}

impl<V> ReconcileResult<V> {
    pub fn new(owner: impl Into<OwnerId>) -> Self {
        Self {
            owner: owner.into(),
            collections: BTreeMap::new(),
        }
    }

    pub fn with(mut self, entity: EntityType, value: V) -> Self {
        self.collections.insert(entity, value);
        self
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityType> + '_ {
        self.collections.keys().copied()
    }

    /// The writes this result stands for, one per mentioned entity type.
    pub fn into_writes(self) -> Vec<(CacheKey, V)> {
        let owner = self.owner;
        self.collections
            .into_iter()
            .map(|(entity, value)| (CacheKey::collection(entity, owner.clone()), value))
            .collect()
    }
}
