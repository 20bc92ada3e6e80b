//! Budget, reservation and summary records.

use crate::tenancy::TenantId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A budget accounting period: one UTC calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BudgetPeriod(NaiveDate);

impl BudgetPeriod {
    /// Returns the period containing `instant`.
    #[must_use]
    pub fn containing(instant: DateTime<Utc>) -> Self {
        Self(instant.date_naive())
    }

    /// Returns the calendar day.
    #[must_use]
    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// Spend of one tenant within one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBudget {
    /// The tenant.
    pub tenant_id: TenantId,
    /// The period.
    pub period: BudgetPeriod,
    /// Committed spend.
    pub spent_amount: f64,
    /// Committed tokens.
    pub spent_tokens: u64,
    /// Maximum spend for the period.
    pub ceiling_amount: f64,
}

impl CostBudget {
    /// Creates an empty budget.
    #[must_use]
    pub fn new(tenant_id: TenantId, period: BudgetPeriod, ceiling_amount: f64) -> Self {
        Self {
            tenant_id,
            period,
            spent_amount: 0.0,
            spent_tokens: 0,
            ceiling_amount,
        }
    }
}

/// An estimated or actual stage cost.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Monetary cost.
    pub cost: f64,
    /// Model tokens.
    pub tokens: u64,
}

impl CostEstimate {
    /// Creates an estimate.
    #[must_use]
    pub fn new(cost: f64, tokens: u64) -> Self {
        Self { cost, tokens }
    }

    /// An estimate of nothing.
    #[must_use]
    pub fn free() -> Self {
        Self::default()
    }
}

/// Lifecycle of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Held against the budget.
    Open,
    /// Finalized with an actual accrual.
    Committed,
    /// Discarded without accrual.
    Released,
}

impl ReservationState {
    /// Returns true once the reservation has been finalized.
    #[must_use]
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// A provisional hold against a tenant's budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique id.
    pub reservation_id: Uuid,
    /// The tenant.
    pub tenant_id: TenantId,
    /// The run the reservation was taken for, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// The period the hold counts against.
    pub period: BudgetPeriod,
    /// Estimated cost.
    pub estimated_cost: f64,
    /// Estimated tokens.
    pub estimated_tokens: u64,
    /// State at the time this copy was taken.
    pub state: ReservationState,
}

/// Result of a commit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    /// The accrual was applied by this call.
    Applied,
    /// An earlier commit already applied the accrual.
    AlreadyCommitted,
}

/// A tenant's spend for the current period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSummary {
    /// The tenant.
    pub tenant_id: TenantId,
    /// The period.
    pub period: BudgetPeriod,
    /// Committed spend.
    pub spent: f64,
    /// Committed tokens.
    pub spent_tokens: u64,
    /// Held by open reservations.
    pub reserved: f64,
    /// The ceiling.
    pub ceiling: f64,
    /// `spent / ceiling` as a percentage (100 when the ceiling is not positive).
    pub percent_used: f64,
}

impl BudgetSummary {
    pub(crate) fn from_budget(budget: &CostBudget, reserved: f64) -> Self {
        let percent_used = if budget.ceiling_amount > 0.0 {
            budget.spent_amount / budget.ceiling_amount * 100.0
        } else {
            100.0
        };
        Self {
            tenant_id: budget.tenant_id.clone(),
            period: budget.period,
            spent: budget.spent_amount,
            spent_tokens: budget.spent_tokens,
            reserved,
            ceiling: budget.ceiling_amount,
            percent_used,
        }
    }
}
