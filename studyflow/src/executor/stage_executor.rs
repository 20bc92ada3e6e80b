//! Executes one stage with retries, deadlines, cancellation and cost
//! reservations.

use super::audit::AuditDispatcher;
use super::policy::{BudgetAction, RetryDecision, RetryPolicy, RetryState};
use crate::cancellation::CancellationToken;
use crate::collaborators::{AuditAction, AuditEvent};
use crate::errors::{ErrorKind, StageError};
use crate::events::{event_types, EventSink, PipelineEvent};
use crate::ledger::{CostEstimate, CostLedger};
use crate::observability::SpanTimer;
use crate::stages::{StageName, StageOutcome, StageResult};
use crate::tenancy::{guard, TenantId};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity and budget of one stage execution.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// The run.
    pub run_id: Uuid,
    /// The tenant every attempt runs under.
    pub tenant_id: TenantId,
    /// The stage.
    pub stage: StageName,
    /// Cost reserved before each attempt.
    pub estimate: CostEstimate,
}

impl StageRequest {
    /// Creates a request with no cost estimate.
    #[must_use]
    pub fn new(run_id: Uuid, tenant_id: TenantId, stage: StageName) -> Self {
        Self {
            run_id,
            tenant_id,
            stage,
            estimate: CostEstimate::free(),
        }
    }

    /// Sets the reservation estimate.
    #[must_use]
    pub fn with_estimate(mut self, estimate: CostEstimate) -> Self {
        self.estimate = estimate;
        self
    }
}

/// Value returned by a successful stage call.
#[derive(Debug, Clone)]
pub struct StageSuccess<T> {
    /// The collaborator's output.
    pub value: T,
    /// Actual usage; the estimate is committed when absent.
    pub usage: Option<CostEstimate>,
}

impl<T> StageSuccess<T> {
    /// Wraps a value whose cost equals the estimate.
    pub fn new(value: T) -> Self {
        Self { value, usage: None }
    }

    /// Wraps a value with its actual usage.
    pub fn with_usage(value: T, usage: CostEstimate) -> Self {
        Self {
            value,
            usage: Some(usage),
        }
    }
}

/// Result of [`StageExecutor::execute`].
#[derive(Debug, Clone)]
pub struct StageExecution<T> {
    /// The immutable stage record.
    pub result: StageResult,
    /// The collaborator's output, present only on success.
    pub value: Option<T>,
}

/// Runs stage calls.
///
/// Each attempt enters the request's tenant scope, reserves the estimate,
/// invokes the stage under the policy deadline, then commits or releases
/// the reservation. Every attempt is reported to the audit trail.
#[derive(Clone)]
pub struct StageExecutor {
    ledger: Arc<CostLedger>,
    audit: AuditDispatcher,
    events: Arc<dyn EventSink>,
}

impl StageExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(ledger: Arc<CostLedger>, audit: AuditDispatcher, events: Arc<dyn EventSink>) -> Self {
        Self {
            ledger,
            audit,
            events,
        }
    }

    /// Executes `stage_fn` until it succeeds, fails terminally, exhausts
    /// its retries or observes cancellation.
    pub async fn execute<T, F, Fut>(
        &self,
        request: &StageRequest,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut stage_fn: F,
    ) -> StageExecution<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<StageSuccess<T>, StageError>>,
    {
        let started_at = Utc::now();
        let timer = SpanTimer::start(request.stage.as_str());
        let mut state = RetryState::new();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return self.cancelled(request, started_at, attempts, cancel);
            }

            attempts += 1;
            debug!(
                run_id = %request.run_id,
                tenant_id = %request.tenant_id,
                stage = %request.stage,
                attempt = attempts,
                "Starting stage attempt"
            );
            self.emit(
                request,
                event_types::STAGE_ATTEMPT,
                serde_json::json!({ "attempt": attempts }),
            );

            let outcome = guard::scoped(
                &request.tenant_id,
                request.stage.as_str(),
                self.attempt(request, policy, &mut stage_fn),
            )
            .await;

            let error = match outcome {
                Ok((value, usage)) => {
                    self.audit_attempt(request, AuditAction::StageSucceeded, attempts, None, usage.cost);
                    let result = StageResult::finish(
                        request.stage,
                        StageOutcome::Success,
                        request.tenant_id.clone(),
                        started_at,
                    )
                    .with_usage(usage.cost, usage.tokens)
                    .with_attempts(attempts);
                    info!(
                        run_id = %request.run_id,
                        tenant_id = %request.tenant_id,
                        stage = %request.stage,
                        attempts,
                        cost = usage.cost,
                        duration_ms = timer.elapsed_ms(),
                        "Stage completed"
                    );
                    self.emit(
                        request,
                        event_types::STAGE_COMPLETED,
                        serde_json::json!({
                            "attempts": attempts,
                            "cost": usage.cost,
                            "tokens": usage.tokens,
                        }),
                    );
                    return StageExecution {
                        result,
                        value: Some(value),
                    };
                }
                Err(error) => error,
            };

            if matches!(error, StageError::BudgetExceeded(_))
                && policy.on_budget_exceeded == BudgetAction::Skip
            {
                return self.skipped(request, started_at, attempts, &error);
            }
            self.audit_attempt(request, AuditAction::StageFailed, attempts, Some(error.kind()), 0.0);

            match policy.decide(&mut state, &error, attempts - 1) {
                RetryDecision::Retry(delay) => {
                    debug!(
                        run_id = %request.run_id,
                        stage = %request.stage,
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Retrying stage after error"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            return self.cancelled(request, started_at, attempts, cancel);
                        }
                    }
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    return self.failed(request, started_at, attempts, &error);
                }
            }
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        request: &StageRequest,
        policy: &RetryPolicy,
        stage_fn: &mut F,
    ) -> Result<(T, CostEstimate), StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<StageSuccess<T>, StageError>>,
    {
        // Zero estimates reserve too, so an exhausted ceiling still rejects.
        let reservation = self.ledger.check_and_reserve_for_run(
            &request.tenant_id,
            request.run_id,
            request.estimate,
        )?;

        let outcome = match tokio::time::timeout(policy.timeout, stage_fn()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StageError::Timeout {
                timeout_ms: u64::try_from(policy.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match outcome {
            Ok(success) => {
                let usage = success.usage.unwrap_or(request.estimate);
                self.ledger.commit(&reservation, usage.cost, usage.tokens)?;
                Ok((success.value, usage))
            }
            Err(error) => {
                if let Err(release_error) = self.ledger.release(&reservation) {
                    warn!(
                        run_id = %request.run_id,
                        stage = %request.stage,
                        reservation_id = %reservation.reservation_id,
                        error = %release_error,
                        "Could not release reservation"
                    );
                }
                Err(error)
            }
        }
    }

    fn failed<T>(
        &self,
        request: &StageRequest,
        started_at: chrono::DateTime<Utc>,
        attempts: u32,
        error: &StageError,
    ) -> StageExecution<T> {
        if error.is_isolation_violation() {
            warn!(
                run_id = %request.run_id,
                stage = %request.stage,
                "Stage aborted by isolation violation"
            );
        } else {
            warn!(
                run_id = %request.run_id,
                tenant_id = %request.tenant_id,
                stage = %request.stage,
                attempts,
                error_kind = %error.kind(),
                error = %error,
                "Stage failed"
            );
        }
        self.emit(
            request,
            event_types::STAGE_FAILED,
            serde_json::json!({
                "attempts": attempts,
                "error_kind": error.kind(),
                "error": error.to_string(),
            }),
        );
        StageExecution {
            result: StageResult::finish(
                request.stage,
                StageOutcome::Failed,
                request.tenant_id.clone(),
                started_at,
            )
            .with_error(error)
            .with_attempts(attempts),
            value: None,
        }
    }

    fn skipped<T>(
        &self,
        request: &StageRequest,
        started_at: chrono::DateTime<Utc>,
        attempts: u32,
        error: &StageError,
    ) -> StageExecution<T> {
        let warning = error.kind().as_str();
        warn!(
            run_id = %request.run_id,
            tenant_id = %request.tenant_id,
            stage = %request.stage,
            warning,
            "Stage skipped"
        );
        self.audit_attempt(request, AuditAction::StageSkipped, attempts, Some(error.kind()), 0.0);
        self.emit(
            request,
            event_types::STAGE_SKIPPED,
            serde_json::json!({ "warning": warning }),
        );
        StageExecution {
            result: StageResult::finish(
                request.stage,
                StageOutcome::Skipped,
                request.tenant_id.clone(),
                started_at,
            )
            .with_error(error)
            .with_warning(warning)
            .with_attempts(attempts),
            value: None,
        }
    }

    fn cancelled<T>(
        &self,
        request: &StageRequest,
        started_at: chrono::DateTime<Utc>,
        attempts: u32,
        cancel: &CancellationToken,
    ) -> StageExecution<T> {
        let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
        info!(
            run_id = %request.run_id,
            stage = %request.stage,
            attempts,
            reason = %reason,
            "Stage cancelled"
        );
        self.audit_attempt(
            request,
            AuditAction::StageCancelled,
            attempts,
            Some(ErrorKind::Cancelled),
            0.0,
        );
        self.emit(
            request,
            event_types::STAGE_CANCELLED,
            serde_json::json!({ "reason": reason.clone() }),
        );
        StageExecution {
            result: StageResult::finish(
                request.stage,
                StageOutcome::Cancelled,
                request.tenant_id.clone(),
                started_at,
            )
            .with_error(&StageError::Cancelled { reason })
            .with_attempts(attempts),
            value: None,
        }
    }

    fn audit_attempt(
        &self,
        request: &StageRequest,
        action: AuditAction,
        attempt: u32,
        error_kind: Option<ErrorKind>,
        cost: f64,
    ) {
        self.audit.dispatch(
            AuditEvent::stage_attempt(
                request.run_id,
                request.tenant_id.clone(),
                request.stage,
                action,
                attempt,
            )
            .with_error_kind(error_kind)
            .with_cost(cost),
        );
    }

    fn emit(&self, request: &StageRequest, event_type: &'static str, data: serde_json::Value) {
        self.events.try_emit(
            PipelineEvent::new(event_type, request.run_id, request.tenant_id.clone())
                .with_stage(request.stage)
                .with_data(data),
        );
    }
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("ledger", &self.ledger)
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}
