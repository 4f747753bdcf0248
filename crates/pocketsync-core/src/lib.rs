//! Core library for pocketsync.
//!
//! The cache layer of a personal finance dashboard: freshness-aware reads,
//! shared fetches, optimistic mutations with rollback and dependency-driven
//! invalidation, wired to the hosted backend through [`api::RestClient`].

pub mod api;
pub mod cache;
pub mod config;
pub mod models;

pub use api::{ApiError, RestClient};
pub use cache::{CacheError, CacheKey, CacheManager, EntityType, OwnerId};
pub use config::Config;
pub use models::EntityData;

/// The cache as the dashboard uses it.
pub type FinanceCache = CacheManager<EntityData>;
