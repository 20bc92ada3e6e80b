//! Last-known run snapshots for status polling.

use super::run::PipelineRun;
use crate::errors::IsolationViolation;
use crate::tenancy::guard;
use dashmap::DashMap;
use uuid::Uuid;

/// Stores the most recent snapshot of each run.
///
/// `record` replaces the previous snapshot; there is no history. Both
/// operations require an enforced context for the run's tenant.
pub trait ProgressStore: Send + Sync + std::fmt::Debug {
    /// Replaces the snapshot of `snapshot.run_id`.
    fn record(&self, snapshot: &PipelineRun) -> Result<(), IsolationViolation>;

    /// Returns the last snapshot of a run, or `None` if unknown.
    ///
    /// Reading another tenant's run is an isolation violation.
    fn get(&self, run_id: Uuid) -> Result<Option<PipelineRun>, IsolationViolation>;
}

/// In-memory [`ProgressStore`].
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    snapshots: DashMap<Uuid, PipelineRun>,
}

impl InMemoryProgressStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Returns true if no run is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn record(&self, snapshot: &PipelineRun) -> Result<(), IsolationViolation> {
        guard::assert_tenant("progress.record", &snapshot.tenant_id)?;
        self.snapshots.insert(snapshot.run_id, snapshot.clone());
        Ok(())
    }

    fn get(&self, run_id: Uuid) -> Result<Option<PipelineRun>, IsolationViolation> {
        guard::assert_enforced("progress.get", false)?;
        let Some(snapshot) = self.snapshots.get(&run_id).map(|s| s.value().clone()) else {
            return Ok(None);
        };
        guard::assert_tenant("progress.get", &snapshot.tenant_id)?;
        Ok(Some(snapshot))
    }
}
