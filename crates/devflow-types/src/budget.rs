//! Budget accounting types shared by the enforcer and its reporters.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A ceiling the enforcer checks before a budgeted step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLevel {
    Monthly,
    Run,
    Step,
}

impl std::fmt::Display for BudgetLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetLevel::Monthly => write!(f, "monthly"),
            BudgetLevel::Run => write!(f, "run"),
            BudgetLevel::Step => write!(f, "step"),
        }
    }
}

/// Identifier of an outstanding reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(pub Uuid);

impl ReservationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of checking spend against a warning threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// Spend is below the warning threshold.
    Ok,
    /// Spend just crossed the warning threshold (reported once per period).
    Warning,
    /// Spend has reached the limit.
    Exhausted,
}

/// How a reservation was settled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    /// Amount added to `spent` at every level.
    pub charged: f64,
    /// Reported actual cost that could not be charged because it exceeded a
    /// ceiling. Zero when the actual cost fit.
    pub overrun: f64,
}

/// Reserved and spent amounts for one account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub limit: f64,
    pub reserved: f64,
    pub spent: f64,
}

impl AccountSnapshot {
    pub fn remaining(&self) -> f64 {
        (self.limit - self.reserved - self.spent).max(0.0)
    }
}

/// Point-in-time view of the enforcer's ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    /// `YYYY-MM` of the current monthly period.
    pub period: String,
    pub monthly: AccountSnapshot,
    /// Open run accounts.
    pub runs: Vec<(Uuid, AccountSnapshot)>,
    pub outstanding_reservations: usize,
}
