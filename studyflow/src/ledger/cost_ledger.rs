//! The cost ledger.
//!
//! Each (tenant, period) key owns one mutex-protected entry holding the
//! budget and its reservations. Reserve, commit and release for a key run
//! under that mutex, so concurrent stages of one tenant are serialized while
//! different tenants never contend.
//!
//! Only open reservations are kept in full. A finalized reservation leaves
//! its id and final state behind so repeated commits and releases stay
//! idempotent; those ids live as long as their period's entry.

use super::budget::{
    BudgetPeriod, BudgetSummary, CommitOutcome, CostBudget, CostEstimate, Reservation,
    ReservationState,
};
use super::clock::{Clock, SystemClock};
use crate::errors::{BudgetExceeded, IsolationViolation, LedgerError};
use crate::tenancy::{guard, TenantId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

type BudgetKey = (TenantId, BudgetPeriod);

/// Ledger ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Daily ceiling for tenants without an override.
    #[serde(default = "default_ceiling")]
    pub default_ceiling: f64,
    /// Per-tenant daily ceilings.
    #[serde(default)]
    pub tenant_ceilings: HashMap<TenantId, f64>,
}

fn default_ceiling() -> f64 {
    50.0
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_ceiling: default_ceiling(),
            tenant_ceilings: HashMap::new(),
        }
    }
}

impl LedgerConfig {
    /// Creates a config with the given default ceiling.
    #[must_use]
    pub fn with_default_ceiling(mut self, ceiling: f64) -> Self {
        self.default_ceiling = ceiling;
        self
    }

    /// Adds a tenant override.
    #[must_use]
    pub fn with_tenant_ceiling(mut self, tenant_id: impl Into<TenantId>, ceiling: f64) -> Self {
        self.tenant_ceilings.insert(tenant_id.into(), ceiling);
        self
    }
}

#[derive(Debug)]
struct BudgetEntry {
    budget: CostBudget,
    open: HashMap<Uuid, Reservation>,
    finalized: HashMap<Uuid, ReservationState>,
}

impl BudgetEntry {
    fn new(budget: CostBudget) -> Self {
        Self {
            budget,
            open: HashMap::new(),
            finalized: HashMap::new(),
        }
    }

    fn reserved(&self) -> f64 {
        self.open.values().map(|r| r.estimated_cost).sum()
    }

    fn state_of(&self, id: Uuid) -> Option<ReservationState> {
        if self.open.contains_key(&id) {
            Some(ReservationState::Open)
        } else {
            self.finalized.get(&id).copied()
        }
    }

    fn finalize(&mut self, id: Uuid, state: ReservationState) {
        self.open.remove(&id);
        self.finalized.insert(id, state);
    }
}

/// Per-tenant, per-period reservation accounting.
pub struct CostLedger {
    entries: DashMap<BudgetKey, Arc<Mutex<BudgetEntry>>>,
    default_ceiling: RwLock<f64>,
    tenant_ceilings: DashMap<TenantId, f64>,
    clock: Arc<dyn Clock>,
}

impl CostLedger {
    /// Creates a ledger driven by the wall clock.
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a ledger driven by `clock`.
    #[must_use]
    pub fn with_clock(config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            default_ceiling: RwLock::new(config.default_ceiling),
            tenant_ceilings: config.tenant_ceilings.into_iter().collect(),
            clock,
        }
    }

    /// Sets a tenant's ceiling.
    ///
    /// This is an administrative operation and may run without a tenant
    /// scope; such calls are recorded in the security log.
    pub fn set_ceiling(&self, tenant_id: &TenantId, ceiling: f64) -> Result<(), IsolationViolation> {
        guard::assert_enforced("ledger.set_ceiling", true)?;
        self.tenant_ceilings.insert(tenant_id.clone(), ceiling);
        Ok(())
    }

    /// Returns the ceiling that applies to a tenant.
    #[must_use]
    pub fn ceiling_for(&self, tenant_id: &TenantId) -> f64 {
        self.tenant_ceilings
            .get(tenant_id)
            .map_or_else(|| *self.default_ceiling.read(), |c| *c)
    }

    /// Reserves `est_cost` against the tenant's current period.
    ///
    /// Fails with [`BudgetExceeded`] when committed spend plus open
    /// reservations plus the request would pass the ceiling, and always when
    /// the ceiling is zero or negative.
    pub fn check_and_reserve(
        &self,
        tenant_id: &TenantId,
        est_cost: f64,
        est_tokens: u64,
    ) -> Result<Reservation, LedgerError> {
        self.reserve(tenant_id, None, CostEstimate::new(est_cost, est_tokens))
    }

    /// Like [`Self::check_and_reserve`], tagging the reservation with a run.
    pub fn check_and_reserve_for_run(
        &self,
        tenant_id: &TenantId,
        run_id: Uuid,
        estimate: CostEstimate,
    ) -> Result<Reservation, LedgerError> {
        self.reserve(tenant_id, Some(run_id), estimate)
    }

    fn reserve(
        &self,
        tenant_id: &TenantId,
        run_id: Option<Uuid>,
        estimate: CostEstimate,
    ) -> Result<Reservation, LedgerError> {
        guard::assert_tenant("ledger.check_and_reserve", tenant_id)?;
        check_amount("estimated_cost", estimate.cost)?;

        let period = BudgetPeriod::containing(self.clock.now());
        let key = (tenant_id.clone(), period);
        let entry = self.entry(&key);
        let mut entry = entry.lock();

        let ceiling = self.ceiling_for(tenant_id);
        entry.budget.ceiling_amount = ceiling;
        let spent = entry.budget.spent_amount;
        let reserved = entry.reserved();

        if ceiling <= 0.0 || spent + reserved + estimate.cost > ceiling {
            debug!(
                tenant_id = %tenant_id,
                spent,
                reserved,
                requested = estimate.cost,
                ceiling,
                "Reservation rejected"
            );
            return Err(BudgetExceeded {
                tenant_id: tenant_id.clone(),
                spent,
                reserved,
                requested: estimate.cost,
                ceiling,
            }
            .into());
        }

        let reservation = Reservation {
            reservation_id: Uuid::new_v4(),
            tenant_id: tenant_id.clone(),
            run_id,
            period,
            estimated_cost: estimate.cost,
            estimated_tokens: estimate.tokens,
            state: ReservationState::Open,
        };
        entry
            .open
            .insert(reservation.reservation_id, reservation.clone());

        debug!(
            tenant_id = %tenant_id,
            reservation_id = %reservation.reservation_id,
            estimated_cost = estimate.cost,
            "Reservation opened"
        );
        Ok(reservation)
    }

    /// Finalizes a reservation with the actual accrual.
    ///
    /// Committing an already committed reservation is a no-op that reports
    /// [`CommitOutcome::AlreadyCommitted`]; the accrual is applied once.
    pub fn commit(
        &self,
        reservation: &Reservation,
        actual_cost: f64,
        actual_tokens: u64,
    ) -> Result<CommitOutcome, LedgerError> {
        guard::assert_tenant("ledger.commit", &reservation.tenant_id)?;
        check_amount("actual_cost", actual_cost)?;

        let entry = self.entry_for(reservation)?;
        let mut entry = entry.lock();
        let id = reservation.reservation_id;

        let state = entry
            .state_of(id)
            .ok_or(LedgerError::UnknownReservation(id))?;

        match state {
            ReservationState::Committed => Ok(CommitOutcome::AlreadyCommitted),
            ReservationState::Released => Err(LedgerError::AlreadyReleased(id)),
            ReservationState::Open => {
                entry.finalize(id, ReservationState::Committed);
                entry.budget.spent_amount += actual_cost;
                entry.budget.spent_tokens = entry.budget.spent_tokens.saturating_add(actual_tokens);

                if entry.budget.spent_amount > entry.budget.ceiling_amount {
                    warn!(
                        tenant_id = %reservation.tenant_id,
                        reservation_id = %id,
                        estimated_cost = reservation.estimated_cost,
                        actual_cost,
                        spent = entry.budget.spent_amount,
                        ceiling = entry.budget.ceiling_amount,
                        "Actual cost pushed spend past the ceiling"
                    );
                }
                debug!(
                    tenant_id = %reservation.tenant_id,
                    reservation_id = %id,
                    actual_cost,
                    actual_tokens,
                    "Reservation committed"
                );
                Ok(CommitOutcome::Applied)
            }
        }
    }

    /// Discards an open reservation without accruing cost.
    ///
    /// Returns false if the reservation was already finalized.
    pub fn release(&self, reservation: &Reservation) -> Result<bool, LedgerError> {
        guard::assert_tenant("ledger.release", &reservation.tenant_id)?;

        let entry = self.entry_for(reservation)?;
        let mut entry = entry.lock();
        let id = reservation.reservation_id;

        let state = entry
            .state_of(id)
            .ok_or(LedgerError::UnknownReservation(id))?;

        if state.is_final() {
            debug!(reservation_id = %id, state = ?state, "Release ignored for finalized reservation");
            return Ok(false);
        }
        entry.finalize(id, ReservationState::Released);
        debug!(tenant_id = %reservation.tenant_id, reservation_id = %id, "Reservation released");
        Ok(true)
    }

    /// Returns the tenant's spend for the current period.
    pub fn daily_summary(&self, tenant_id: &TenantId) -> Result<BudgetSummary, IsolationViolation> {
        guard::assert_tenant("ledger.daily_summary", tenant_id)?;

        let period = BudgetPeriod::containing(self.clock.now());
        let key = (tenant_id.clone(), period);
        let ceiling = self.ceiling_for(tenant_id);

        let existing = self.entries.get(&key).map(|e| Arc::clone(e.value()));
        let summary = match existing {
            Some(entry) => {
                let entry = entry.lock();
                let mut budget = entry.budget.clone();
                budget.ceiling_amount = ceiling;
                BudgetSummary::from_budget(&budget, entry.reserved())
            }
            None => BudgetSummary::from_budget(&CostBudget::new(tenant_id.clone(), period, ceiling), 0.0),
        };
        Ok(summary)
    }

    /// Counts the tenant's open reservations across all periods.
    pub fn open_reservations(&self, tenant_id: &TenantId) -> Result<usize, IsolationViolation> {
        guard::assert_tenant("ledger.open_reservations", tenant_id)?;
        Ok(self.count_open(tenant_id, |_| true))
    }

    /// Counts the tenant's open reservations taken for `run_id`.
    pub fn open_reservations_for_run(
        &self,
        tenant_id: &TenantId,
        run_id: Uuid,
    ) -> Result<usize, IsolationViolation> {
        guard::assert_tenant("ledger.open_reservations", tenant_id)?;
        Ok(self.count_open(tenant_id, |r| r.run_id == Some(run_id)))
    }

    /// Drops budgets of periods before `period`.
    ///
    /// Maintenance operation; may run without a tenant scope.
    pub fn prune_before(&self, period: BudgetPeriod) -> Result<usize, IsolationViolation> {
        guard::assert_enforced("ledger.prune_before", true)?;
        let before = self.entries.len();
        self.entries.retain(|(_, p), _| *p >= period);
        Ok(before - self.entries.len())
    }

    /// Number of reservations tracked in full, open ones only.
    #[must_use]
    pub fn tracked_reservations(&self) -> usize {
        let entries: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        entries.iter().map(|entry| entry.lock().open.len()).sum()
    }

    /// Number of (tenant, period) budgets held.
    #[must_use]
    pub fn budget_count(&self) -> usize {
        self.entries.len()
    }

    fn count_open(&self, tenant_id: &TenantId, filter: impl Fn(&Reservation) -> bool) -> usize {
        let entries: Vec<_> = self
            .entries
            .iter()
            .filter(|e| &e.key().0 == tenant_id)
            .map(|e| Arc::clone(e.value()))
            .collect();

        entries
            .iter()
            .map(|entry| entry.lock().open.values().filter(|r| filter(r)).count())
            .sum()
    }

    fn entry(&self, key: &BudgetKey) -> Arc<Mutex<BudgetEntry>> {
        let entry = match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => return Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let ceiling = self.ceiling_for(&key.0);
                let entry = Arc::new(Mutex::new(BudgetEntry::new(CostBudget::new(
                    key.0.clone(),
                    key.1,
                    ceiling,
                ))));
                vacant.insert(Arc::clone(&entry));
                entry
            }
        };
        self.roll_over(key);
        entry
    }

    /// Drops the tenant's budgets of earlier periods once nothing is open
    /// against them.
    fn roll_over(&self, (tenant_id, period): &BudgetKey) {
        let before = self.entries.len();
        self.entries
            .retain(|(t, p), e| t != tenant_id || p >= period || !e.lock().open.is_empty());
        let dropped = before.saturating_sub(self.entries.len());
        if dropped > 0 {
            debug!(tenant_id = %tenant_id, dropped, "Dropped budgets of closed periods");
        }
    }

    fn entry_for(&self, reservation: &Reservation) -> Result<Arc<Mutex<BudgetEntry>>, LedgerError> {
        let key = (reservation.tenant_id.clone(), reservation.period);
        self.entries
            .get(&key)
            .map(|e| Arc::clone(e.value()))
            .ok_or(LedgerError::UnknownReservation(reservation.reservation_id))
    }
}

impl std::fmt::Debug for CostLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostLedger")
            .field("budgets", &self.entries.len())
            .field("default_ceiling", &*self.default_ceiling.read())
            .finish()
    }
}

fn check_amount(name: &str, value: f64) -> Result<(), LedgerError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(LedgerError::InvalidAmount(format!("{name} must be a finite, non-negative number (got {value})")))
    }
}
