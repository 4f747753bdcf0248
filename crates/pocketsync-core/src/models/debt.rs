use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Debt {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// Outstanding balance
    pub balance: f64,
    #[serde(default)]
    pub interest_rate: Option<f64>,
    #[serde(default)]
    pub minimum_payment: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct DebtPayment {
    pub id: String,
    pub user_id: String,
    pub debt_id: String,
    pub amount: f64,
    /// ISO date, `YYYY-MM-DD`
    pub date: String,
}

impl Debt {
    /// Sum of `payments` made against this debt.
    pub fn paid(&self, payments: &[DebtPayment]) -> f64 {
        payments
            .iter()
            .filter(|p| p.debt_id == self.id)
            .map(|p| p.amount)
            .sum()
    }
}
