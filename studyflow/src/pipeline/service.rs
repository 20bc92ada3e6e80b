//! The in-process entry point: submit, poll and cancel runs.

use super::orchestrator::{PipelineOrchestrator, PipelineRuntime};
use super::run::PipelineRun;
use crate::cancellation::CancellationToken;
use crate::errors::{IsolationViolation, StudyflowError};
use crate::tenancy::{current_context, guard, TenantId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Cancellation reason for caller-initiated cancellation.
pub const USER_CANCEL_REASON: &str = "user_requested";

/// Answer to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The run will stop at its next checkpoint.
    Accepted,
    /// No run has this id.
    NotFound,
    /// The run had already finished.
    AlreadyTerminal,
}

#[derive(Debug)]
struct RunHandle {
    tenant_id: TenantId,
    cancel: Arc<CancellationToken>,
    finished: watch::Receiver<Option<PipelineRun>>,
}

/// Submits runs and answers status and cancellation requests.
///
/// Each submitted run is driven by its own orchestrator on a spawned task.
/// A run's handle is dropped when the run ends; finished runs are answered
/// from the progress store.
#[derive(Debug)]
pub struct PipelineService {
    runtime: Arc<PipelineRuntime>,
    runs: Arc<DashMap<Uuid, RunHandle>>,
}

impl PipelineService {
    /// Creates a service.
    #[must_use]
    pub fn new(runtime: PipelineRuntime) -> Self {
        Self {
            runtime: Arc::new(runtime),
            runs: Arc::new(DashMap::new()),
        }
    }

    /// Returns the shared runtime.
    #[must_use]
    pub fn runtime(&self) -> &Arc<PipelineRuntime> {
        &self.runtime
    }

    /// Starts a run and returns its id.
    ///
    /// May be called without a tenant scope (the run enters its own), but an
    /// active scope for a different tenant is rejected. Must be called from
    /// within a tokio runtime.
    pub fn submit(
        &self,
        tenant_id: &TenantId,
        subject_id: impl Into<String>,
        input_ref: impl Into<String>,
    ) -> Result<Uuid, StudyflowError> {
        if current_context().is_some() {
            guard::assert_tenant("pipeline.submit", tenant_id)?;
        }

        let run = PipelineRun::new(tenant_id.clone(), subject_id, input_ref);
        let run_id = run.run_id;
        guard::scoped_sync(tenant_id, "pipeline.submit", || self.runtime.progress().record(&run))?;

        let cancel = Arc::new(CancellationToken::new());
        let (finished_tx, finished) = watch::channel(None);
        self.runs.insert(
            run_id,
            RunHandle {
                tenant_id: tenant_id.clone(),
                cancel: Arc::clone(&cancel),
                finished,
            },
        );

        info!(run_id = %run_id, tenant_id = %tenant_id, subject_id = %run.subject_id, "Run submitted");
        let orchestrator = PipelineOrchestrator::new(Arc::clone(&self.runtime), run, cancel);
        let runs = Arc::clone(&self.runs);
        tokio::spawn(async move {
            let run = orchestrator.run().await;
            // no receiver left just means nobody is waiting
            let _ = finished_tx.send(Some(run));
            runs.remove(&run_id);
        });
        Ok(run_id)
    }

    /// Returns the last published snapshot of a run.
    ///
    /// Requires an enforced scope for the run's tenant.
    pub fn get_status(&self, run_id: Uuid) -> Result<PipelineRun, StudyflowError> {
        self.runtime
            .progress()
            .get(run_id)?
            .ok_or(StudyflowError::RunNotFound(run_id))
    }

    /// Requests cooperative cancellation of a run.
    ///
    /// Requires an enforced scope for the run's tenant.
    pub fn cancel(&self, run_id: Uuid) -> Result<CancelOutcome, IsolationViolation> {
        guard::assert_enforced("pipeline.cancel", false)?;
        let Some(handle) = self.runs.get(&run_id) else {
            let finished = self.runtime.progress().get(run_id)?;
            return Ok(if finished.is_some_and(|snapshot| snapshot.is_terminal()) {
                CancelOutcome::AlreadyTerminal
            } else {
                CancelOutcome::NotFound
            });
        };
        guard::assert_tenant("pipeline.cancel", &handle.tenant_id)?;

        let finished = handle.finished.borrow().is_some();
        let terminal = finished
            || self
                .runtime
                .progress()
                .get(run_id)?
                .is_some_and(|snapshot| snapshot.is_terminal());
        if terminal {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        if handle.cancel.cancel(USER_CANCEL_REASON) {
            info!(run_id = %run_id, tenant_id = %handle.tenant_id, "Run cancellation requested");
        }
        Ok(CancelOutcome::Accepted)
    }

    /// Waits for a run to finish and returns its terminal snapshot.
    ///
    /// Requires an enforced scope for the run's tenant.
    pub async fn wait(&self, run_id: Uuid) -> Result<PipelineRun, StudyflowError> {
        let handle = self
            .runs
            .get(&run_id)
            .map(|h| (h.tenant_id.clone(), h.finished.clone()));
        let Some((tenant_id, mut finished)) = handle else {
            let run = self.get_status(run_id)?;
            return if run.is_terminal() {
                Ok(run)
            } else {
                Err(StudyflowError::Internal(format!(
                    "run {run_id} is not driven by this service"
                )))
            };
        };
        guard::assert_tenant("pipeline.wait", &tenant_id)?;

        loop {
            let current = finished.borrow_and_update().clone();
            if let Some(run) = current {
                return Ok(run);
            }
            if finished.changed().await.is_err() {
                return Err(StudyflowError::Internal(format!(
                    "run {run_id} ended without a result"
                )));
            }
        }
    }

    /// Number of runs still in flight.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}
