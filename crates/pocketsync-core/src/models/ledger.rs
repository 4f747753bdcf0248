use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Income,
    Expense,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub amount: f64,
    pub kind: TransactionKind,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// ISO date, `YYYY-MM-DD`
    pub date: String,
    #[serde(default)]
    pub pot_id: Option<String>,
}

impl Transaction {
    /// Amount with sign: expenses negative.
    pub fn signed_amount(&self) -> f64 {
        match self.kind {
            TransactionKind::Income => self.amount,
            TransactionKind::Expense => -self.amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Budget {
    pub id: String,
    pub user_id: String,
    pub category: String,
    #[serde(rename = "amount")]
    pub limit: f64,
    #[serde(default)]
    pub spent: f64,
}

impl Budget {
    pub fn remaining(&self) -> f64 {
        self.limit - self.spent
    }

    pub fn is_over(&self) -> bool {
        self.spent > self.limit
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Pot {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub target: Option<f64>,
}

impl Pot {
    /// Progress towards the target, 0.0 to 1.0. `None` without a target.
    pub fn progress(&self) -> Option<f64> {
        self.target
            .filter(|t| *t > 0.0)
            .map(|t| (self.balance / t).clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum BillFrequency {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct RecurringBill {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub amount: f64,
    pub frequency: BillFrequency,
    /// ISO date of the next charge
    #[serde(default)]
    pub next_due: Option<String>,
}

impl RecurringBill {
    /// Cost normalised to one month.
    pub fn monthly_cost(&self) -> f64 {
        match self.frequency {
            BillFrequency::Weekly => self.amount * 52.0 / 12.0,
            BillFrequency::Monthly => self.amount,
            BillFrequency::Quarterly => self.amount / 3.0,
            BillFrequency::Yearly => self.amount / 12.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Income {
    pub id: String,
    pub user_id: String,
    pub source: String,
    pub amount: f64,
    #[serde(default)]
    pub date: Option<String>,
}
