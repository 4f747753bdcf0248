//! Cache key schema.
//!
//! Every cached unit of data is addressed by a [`CacheKey`]: the entity
//! collection, the owning user, and optional parameters (a record id or a
//! filter). Keys are built only through the constructors here so that two
//! call sites asking for the same data always produce equal keys.
//!
//! Display format: `v{VERSION}:{entity}:{owner}[:{params}]`

use std::fmt;

use serde::{Deserialize, Serialize};

/// Key schema version - increment when changing the display format
pub const KEY_VERSION: u32 = 1;

/// The entity collections held by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Profile,
    Transactions,
    Budgets,
    Pots,
    RecurringBills,
    Debts,
    DebtPayments,
    Income,
    /// Aggregate derived from the other collections.
    Totals,
}

impl EntityType {
    pub const ALL: [EntityType; 9] = [
        EntityType::Profile,
        EntityType::Transactions,
        EntityType::Budgets,
        EntityType::Pots,
        EntityType::RecurringBills,
        EntityType::Debts,
        EntityType::DebtPayments,
        EntityType::Income,
        EntityType::Totals,
    ];

    /// Stable name, identical to the serde representation and the backend table.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Profile => "profile",
            EntityType::Transactions => "transactions",
            EntityType::Budgets => "budgets",
            EntityType::Pots => "pots",
            EntityType::RecurringBills => "recurring_bills",
            EntityType::Debts => "debts",
            EntityType::DebtPayments => "debt_payments",
            EntityType::Income => "income",
            EntityType::Totals => "totals",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == name)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of the user owning the cached data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Canonical identifier for one unit of cached data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    entity: EntityType,
    owner: OwnerId,
    params: Option<String>,
}

impl CacheKey {
    /// Whole collection for a user.
    /// Format: v1:{entity}:{owner}
    pub fn collection(entity: EntityType, owner: impl Into<OwnerId>) -> Self {
        Self {
            entity,
            owner: owner.into(),
            params: None,
        }
    }

    /// A single record, or any parameterized view, of a collection.
    /// Format: v1:{entity}:{owner}:{params}
    pub fn with_params(
        entity: EntityType,
        owner: impl Into<OwnerId>,
        params: impl Into<String>,
    ) -> Self {
        Self {
            entity,
            owner: owner.into(),
            params: Some(params.into()),
        }
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn params(&self) -> Option<&str> {
        self.params.as_deref()
    }

    pub fn is_collection(&self) -> bool {
        self.params.is_none()
    }

    /// True when the key belongs to `entity` for `owner`, whatever its params.
    pub fn matches(&self, entity: EntityType, owner: &OwnerId) -> bool {
        self.entity == entity && &self.owner == owner
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}:{}", KEY_VERSION, self.entity, self.owner)?;
        if let Some(ref params) = self.params {
            write!(f, ":{}", params)?;
        }
        Ok(())
    }
}
