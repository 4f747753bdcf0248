//! Which cached data goes stale when an entity is written.
//!
//! Dependencies are a declarative table rather than conditionals spread over
//! the mutation code. An [`InvalidationEdge`] reads "after a committed write
//! to `source`, every key of each `targets` entity for the same owner is
//! stale". Aggregates are listed separately: an aggregate key is derived from
//! several collections, and any committed write to one of them invalidates it.

use std::collections::BTreeSet;

use super::keys::{CacheKey, EntityType};

#[derive(Debug, Clone, Copy)]
pub struct InvalidationEdge {
    pub source: EntityType,
    pub targets: &'static [EntityType],
}

#[derive(Debug, Clone, Copy)]
pub struct AggregateRule {
    pub aggregate: EntityType,
    pub sources: &'static [EntityType],
}

pub const DEFAULT_EDGES: &[InvalidationEdge] = &[
    InvalidationEdge {
        source: EntityType::Transactions,
        targets: &[EntityType::Budgets, EntityType::Pots],
    },
    InvalidationEdge {
        source: EntityType::DebtPayments,
        targets: &[EntityType::Debts],
    },
    InvalidationEdge {
        source: EntityType::Debts,
        targets: &[EntityType::DebtPayments],
    },
    InvalidationEdge {
        source: EntityType::Income,
        targets: &[EntityType::Budgets],
    },
    InvalidationEdge {
        source: EntityType::RecurringBills,
        targets: &[EntityType::Transactions],
    },
];

pub const DEFAULT_AGGREGATES: &[AggregateRule] = &[AggregateRule {
    aggregate: EntityType::Totals,
    sources: &[
        EntityType::Transactions,
        EntityType::Budgets,
        EntityType::Pots,
        EntityType::RecurringBills,
        EntityType::Debts,
        EntityType::DebtPayments,
        EntityType::Income,
    ],
}];

#[derive(Debug, Clone, Copy)]
pub struct InvalidationGraph {
    edges: &'static [InvalidationEdge],
    aggregates: &'static [AggregateRule],
}

impl InvalidationGraph {
    pub const fn new(edges: &'static [InvalidationEdge], aggregates: &'static [AggregateRule]) -> Self {
        Self { edges, aggregates }
    }

    /// Entity types directly depending on `source`, aggregates included.
    pub fn dependents(&self, source: EntityType) -> BTreeSet<EntityType> {
        let mut out: BTreeSet<EntityType> = self
            .edges
            .iter()
            .filter(|edge| edge.source == source)
            .flat_map(|edge| edge.targets.iter().copied())
            .collect();
        out.extend(
            self.aggregates
                .iter()
                .filter(|rule| rule.sources.contains(&source))
                .map(|rule| rule.aggregate),
        );
        out.remove(&source);
        out
    }

    /// Keys to mark stale after a committed write to `committed`.
    ///
    /// Resolved against `known` (the keys the store currently holds):
    /// siblings of the committed key (same entity and owner, other params),
    /// all keys of dependent entities for that owner, and the owner's
    /// aggregate collection keys even when nothing is cached for them yet.
    /// The committed key itself is never included.
    pub fn on_committed<'a, I>(&self, committed: &CacheKey, known: I) -> BTreeSet<CacheKey>
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        let owner = committed.owner();
        let dependents = self.dependents(committed.entity());

        let mut keys: BTreeSet<CacheKey> = known
            .into_iter()
            .filter(|key| key.owner() == owner)
            .filter(|key| key.entity() == committed.entity() || dependents.contains(&key.entity()))
            .cloned()
            .collect();

        for rule in self.aggregates {
            if rule.sources.contains(&committed.entity()) {
                keys.insert(CacheKey::collection(rule.aggregate, owner.clone()));
            }
        }

        keys.remove(committed);
        keys
    }
}

impl Default for InvalidationGraph {
    fn default() -> Self {
        Self::new(DEFAULT_EDGES, DEFAULT_AGGREGATES)
    }
}
