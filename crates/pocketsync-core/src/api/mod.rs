//! REST client for the finance backend.
//!
//! Provides `RestClient`, the fetcher, remote writer and sync reconciler the
//! finance cache is wired to, and `ApiError` for collaborator failures.

pub mod client;
pub mod error;

pub use client::RestClient;
pub use error::ApiError;
