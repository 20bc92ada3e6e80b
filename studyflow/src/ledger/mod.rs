//! Per-tenant, per-period cost accounting.
//!
//! This module provides:
//! - Budget and reservation records
//! - The cost ledger with single-writer-per-key reserve/commit/release
//! - A pluggable clock for period boundaries

mod budget;
mod clock;
mod cost_ledger;

pub use budget::{
    BudgetPeriod, BudgetSummary, CommitOutcome, CostBudget, CostEstimate, Reservation,
    ReservationState,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cost_ledger::{CostLedger, LedgerConfig};
