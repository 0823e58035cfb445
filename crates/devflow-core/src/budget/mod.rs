//! Monetary budget enforcement and cost prediction.
//!
//! - `enforcer` -- reserve / reconcile / release across monthly, run and
//!   step ceilings
//! - `estimator` -- pluggable cost prediction and the model pricing table

pub mod enforcer;
pub mod estimator;

use devflow_types::budget::{BudgetLevel, ReservationId};
use thiserror::Error;
use uuid::Uuid;

pub use enforcer::{BudgetEnforcer, BudgetRequest};
pub use estimator::{CostEstimator, HeuristicEstimator, PricingTable};

/// Errors from the budget enforcer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BudgetError {
    /// A reservation would push a ceiling past its limit.
    #[error("{level} budget exceeded: requested {requested:.4}, available {available:.4}")]
    Denied {
        level: BudgetLevel,
        requested: f64,
        available: f64,
    },

    /// The actual cost exceeded what could be charged. `charged` was
    /// recorded as spent; the rest was not.
    #[error("actual cost {actual:.4} overran the budget; charged {charged:.4}")]
    Overrun { actual: f64, charged: f64 },

    /// The reservation was already settled or never existed.
    #[error("unknown reservation {0}")]
    UnknownReservation(ReservationId),

    /// No run account is open for this run.
    #[error("no budget account open for run {0}")]
    UnknownRun(Uuid),

    #[error("invalid amount {0}")]
    InvalidAmount(f64),
}
