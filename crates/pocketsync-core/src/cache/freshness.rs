//! Per-entity freshness windows.
//!
//! The policy is a plain lookup table: how long a fetched value of each
//! entity type may be served without going back to the backend. The table
//! is data, so tuning one entity never touches cache logic. Entities that
//! are missing from the table get [`FALLBACK_MAX_AGE_MS`].

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use super::keys::EntityType;
use crate::config::CacheConfig;

/// Conservative window for entities without their own rule.
pub const FALLBACK_MAX_AGE_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessRule {
    pub entity: EntityType,
    pub max_age_ms: i64,
}

/// Default windows. Transactional collections change often and get short
/// windows; the profile barely changes.
pub const DEFAULT_RULES: &[FreshnessRule] = &[
    FreshnessRule { entity: EntityType::Profile, max_age_ms: 30 * 60_000 },
    FreshnessRule { entity: EntityType::Transactions, max_age_ms: 60_000 },
    FreshnessRule { entity: EntityType::DebtPayments, max_age_ms: 60_000 },
    FreshnessRule { entity: EntityType::Totals, max_age_ms: 60_000 },
    FreshnessRule { entity: EntityType::Budgets, max_age_ms: 5 * 60_000 },
    FreshnessRule { entity: EntityType::Pots, max_age_ms: 5 * 60_000 },
    FreshnessRule { entity: EntityType::Debts, max_age_ms: 5 * 60_000 },
    FreshnessRule { entity: EntityType::Income, max_age_ms: 5 * 60_000 },
    FreshnessRule { entity: EntityType::RecurringBills, max_age_ms: 10 * 60_000 },
];

#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
    rules: HashMap<EntityType, Duration>,
    fallback: Duration,
}

impl FreshnessPolicy {
    pub fn new(rules: &[FreshnessRule], fallback_ms: i64) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|r| (r.entity, Duration::milliseconds(r.max_age_ms)))
                .collect(),
            fallback: Duration::milliseconds(fallback_ms),
        }
    }

    /// Defaults overlaid with the configured overrides.
    pub fn from_config(config: &CacheConfig) -> Self {
        let mut policy = Self::new(DEFAULT_RULES, config.fallback_max_age_ms);
        for (entity, ms) in &config.max_age_ms {
            policy.rules.insert(*entity, Duration::milliseconds(*ms));
        }
        policy
    }

    pub fn max_age(&self, entity: EntityType) -> Duration {
        self.rules.get(&entity).copied().unwrap_or(self.fallback)
    }

    /// Whether a value fetched at `fetched_at` is still within its window at `now`.
    pub fn is_fresh(&self, entity: EntityType, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - fetched_at <= self.max_age(entity)
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RULES, FALLBACK_MAX_AGE_MS)
    }
}
