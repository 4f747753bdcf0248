use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::debt::{Debt, DebtPayment};
use super::ledger::{Budget, Income, Pot, RecurringBill, Transaction};
use super::profile::{Profile, Totals};
use crate::api::ApiError;
use crate::cache::EntityType;

/// The value the finance cache stores under a key: one entity type's records.
///
/// Profile and totals are single rows; everything else is a collection
/// (an item key holds a one-element collection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "entity", content = "records", rename_all = "snake_case")]
pub enum EntityData {
    Profile(Profile),
    Transactions(Vec<Transaction>),
    Budgets(Vec<Budget>),
    Pots(Vec<Pot>),
    RecurringBills(Vec<RecurringBill>),
    Debts(Vec<Debt>),
    DebtPayments(Vec<DebtPayment>),
    Income(Vec<Income>),
    Totals(Totals),
}

impl EntityData {
    pub fn entity(&self) -> EntityType {
        match self {
            EntityData::Profile(_) => EntityType::Profile,
            EntityData::Transactions(_) => EntityType::Transactions,
            EntityData::Budgets(_) => EntityType::Budgets,
            EntityData::Pots(_) => EntityType::Pots,
            EntityData::RecurringBills(_) => EntityType::RecurringBills,
            EntityData::Debts(_) => EntityType::Debts,
            EntityData::DebtPayments(_) => EntityType::DebtPayments,
            EntityData::Income(_) => EntityType::Income,
            EntityData::Totals(_) => EntityType::Totals,
        }
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        match self {
            EntityData::Profile(_) | EntityData::Totals(_) => 1,
            EntityData::Transactions(v) => v.len(),
            EntityData::Budgets(v) => v.len(),
            EntityData::Pots(v) => v.len(),
            EntityData::RecurringBills(v) => v.len(),
            EntityData::Debts(v) => v.len(),
            EntityData::DebtPayments(v) => v.len(),
            EntityData::Income(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse backend rows for `entity`. Collections expect a JSON array;
    /// single-row entities accept an object or an array holding one.
    pub fn from_rows(entity: EntityType, rows: Value) -> Result<Self, ApiError> {
        Ok(match entity {
            EntityType::Profile => EntityData::Profile(single(entity, rows)?),
            EntityType::Totals => EntityData::Totals(single(entity, rows)?),
            EntityType::Transactions => EntityData::Transactions(parse(entity, rows)?),
            EntityType::Budgets => EntityData::Budgets(parse(entity, rows)?),
            EntityType::Pots => EntityData::Pots(parse(entity, rows)?),
            EntityType::RecurringBills => EntityData::RecurringBills(parse(entity, rows)?),
            EntityType::Debts => EntityData::Debts(parse(entity, rows)?),
            EntityType::DebtPayments => EntityData::DebtPayments(parse(entity, rows)?),
            EntityType::Income => EntityData::Income(parse(entity, rows)?),
        })
    }

    /// The records as backend rows, for upserts.
    pub fn to_rows(&self) -> Result<Value, serde_json::Error> {
        match self {
            EntityData::Profile(v) => serde_json::to_value(v),
            EntityData::Totals(v) => serde_json::to_value(v),
            EntityData::Transactions(v) => serde_json::to_value(v),
            EntityData::Budgets(v) => serde_json::to_value(v),
            EntityData::Pots(v) => serde_json::to_value(v),
            EntityData::RecurringBills(v) => serde_json::to_value(v),
            EntityData::Debts(v) => serde_json::to_value(v),
            EntityData::DebtPayments(v) => serde_json::to_value(v),
            EntityData::Income(v) => serde_json::to_value(v),
        }
    }
}

fn parse<T: DeserializeOwned>(entity: EntityType, rows: Value) -> Result<T, ApiError> {
    serde_json::from_value(rows).map_err(|e| ApiError::InvalidResponse(format!("{} rows: {}", entity, e)))
}

fn single<T: DeserializeOwned>(entity: EntityType, rows: Value) -> Result<T, ApiError> {
    match rows {
        Value::Array(items) => match items.into_iter().next() {
            Some(row) => parse(entity, row),
            None => Err(ApiError::NotFound(format!("no {} row", entity))),
        },
        row => parse(entity, row),
    }
}
