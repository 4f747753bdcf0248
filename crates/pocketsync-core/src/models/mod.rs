//! Data models for the finance dashboard entities.
//!
//! - `Transaction`, `Budget`, `Pot`, `RecurringBill`, `Income`: day-to-day ledger
//! - `Debt`, `DebtPayment`: borrowing and repayments
//! - `Profile`, `Totals`: single-row user data and derived summary figures
//! - `EntityData`: what the cache stores per key
//!
//! Field names match the backend's snake_case columns. With the `ts` feature
//! each type also exports a TypeScript binding for the dashboard frontend.

pub mod data;
pub mod debt;
pub mod ledger;
pub mod profile;

pub use data::EntityData;
pub use debt::{Debt, DebtPayment};
pub use ledger::{BillFrequency, Budget, Income, Pot, RecurringBill, Transaction, TransactionKind};
pub use profile::{Profile, Totals};
