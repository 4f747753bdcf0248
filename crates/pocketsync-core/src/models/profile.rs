use serde::{Deserialize, Serialize};

use super::debt::Debt;
use super::ledger::{Budget, Income, Pot, RecurringBill, Transaction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Profile {
    /// Same as the owning user id
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "GBP".to_string()
}

impl Profile {
    pub fn name(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Dashboard summary figures derived from the other collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Totals {
    #[serde(default)]
    pub income: f64,
    #[serde(default)]
    pub spending: f64,
    #[serde(default)]
    pub budgeted: f64,
    #[serde(default)]
    pub saved: f64,
    #[serde(default)]
    pub bills_monthly: f64,
    #[serde(default)]
    pub debt_outstanding: f64,
}

impl Totals {
    /// Compute locally from cached collections. The backend's own figures
    /// take precedence when available.
    pub fn compute(
        transactions: &[Transaction],
        budgets: &[Budget],
        pots: &[Pot],
        bills: &[RecurringBill],
        debts: &[Debt],
        income: &[Income],
    ) -> Self {
        let spending = transactions
            .iter()
            .map(Transaction::signed_amount)
            .filter(|a| *a < 0.0)
            .map(f64::abs)
            .sum();
        Self {
            income: income.iter().map(|i| i.amount).sum(),
            spending,
            budgeted: budgets.iter().map(|b| b.limit).sum(),
            saved: pots.iter().map(|p| p.balance).sum(),
            bills_monthly: bills.iter().map(RecurringBill::monthly_cost).sum(),
            debt_outstanding: debts.iter().map(|d| d.balance).sum(),
        }
    }

    /// Income left after spending.
    pub fn net(&self) -> f64 {
        self.income - self.spending
    }
}
