//! The pipeline orchestrator.
//!
//! Drives one run through PARSE, PARALLEL(CALCULATE, VALIDATE), NARRATE and
//! AUDIT. The orchestrator is the only writer of the run's status and
//! publishes a snapshot to the progress store after every transition and
//! every recorded stage result.

use super::progress::{InMemoryProgressStore, ProgressStore};
use super::run::{PipelineRun, AUDIT_FAILED_WARNING, RUN_TIMEOUT_WARNING};
use super::state::PipelineStatus;
use crate::cancellation::CancellationToken;
use crate::collaborators::{
    AuditEvent, Collaborators, ComplianceResult, FinancialResult, ParsedData,
};
use crate::config::StudyflowConfig;
use crate::errors::{ParseErrorKind, StageError, StudyflowError};
use crate::events::{event_types, EventSink, NoOpEventSink, PipelineEvent};
use crate::executor::{
    AuditDispatcher, BudgetAction, RetryPolicy, StageExecution, StageExecutor, StageRequest,
    StageSuccess,
};
use crate::ledger::{CostEstimate, CostLedger};
use crate::observability::SpanTimer;
use crate::stages::{StageName, StageOutcome, StageResult};
use crate::tenancy::guard;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Cancellation reason set by the run timeout watchdog.
pub const RUN_TIMEOUT_REASON: &str = "run_timeout";

/// Shared services every run uses.
pub struct PipelineRuntime {
    config: Arc<StudyflowConfig>,
    collaborators: Collaborators,
    ledger: Arc<CostLedger>,
    progress: Arc<dyn ProgressStore>,
    events: Arc<dyn EventSink>,
    audit: AuditDispatcher,
}

impl PipelineRuntime {
    /// Creates a runtime with an in-memory progress store, a ledger built
    /// from `config` and no event sink.
    #[must_use]
    pub fn new(config: StudyflowConfig, collaborators: Collaborators) -> Self {
        let events: Arc<dyn EventSink> = Arc::new(NoOpEventSink);
        let ledger = Arc::new(CostLedger::new(config.ledger_config()));
        let audit = AuditDispatcher::new(
            Arc::clone(&collaborators.audit),
            Arc::clone(&events),
            config.audit_timeout(),
        );
        Self {
            config: Arc::new(config),
            collaborators,
            ledger,
            progress: Arc::new(InMemoryProgressStore::new()),
            events,
            audit,
        }
    }

    /// Replaces the cost ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Replaces the progress store.
    #[must_use]
    pub fn with_progress_store(mut self, progress: Arc<dyn ProgressStore>) -> Self {
        self.progress = progress;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.audit = AuditDispatcher::new(
            Arc::clone(&self.collaborators.audit),
            Arc::clone(&events),
            self.config.audit_timeout(),
        );
        self.events = events;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &StudyflowConfig {
        &self.config
    }

    /// Returns the cost ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    /// Returns the progress store.
    #[must_use]
    pub fn progress(&self) -> &Arc<dyn ProgressStore> {
        &self.progress
    }

    /// Returns the audit dispatcher.
    #[must_use]
    pub fn audit(&self) -> &AuditDispatcher {
        &self.audit
    }

    fn executor(&self) -> StageExecutor {
        StageExecutor::new(
            Arc::clone(&self.ledger),
            self.audit.clone(),
            Arc::clone(&self.events),
        )
    }
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("config", &self.config)
            .field("ledger", &self.ledger)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

enum ParallelOutput {
    Calculate(StageExecution<FinancialResult>),
    Validate(StageExecution<ComplianceResult>),
}

/// Drives a single run to a terminal status.
#[derive(Debug)]
pub struct PipelineOrchestrator {
    runtime: Arc<PipelineRuntime>,
    executor: StageExecutor,
    run: PipelineRun,
    cancel: Arc<CancellationToken>,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator owning `run`.
    #[must_use]
    pub fn new(runtime: Arc<PipelineRuntime>, run: PipelineRun, cancel: Arc<CancellationToken>) -> Self {
        Self {
            executor: runtime.executor(),
            runtime,
            run,
            cancel,
        }
    }

    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run.run_id
    }

    /// Runs the pipeline and returns the terminal run.
    pub async fn run(mut self) -> PipelineRun {
        let timer = SpanTimer::start("pipeline.run");
        info!(
            run_id = %self.run.run_id,
            tenant_id = %self.run.tenant_id,
            subject_id = %self.run.subject_id,
            "Pipeline run started"
        );
        let watchdog = self.spawn_watchdog();

        let terminal = match self.drive().await {
            Ok(status) => status,
            Err(e) => {
                error!(run_id = %self.run.run_id, error = %e, "Pipeline run aborted");
                if let Err(record_err) = self.run.add_error(e.kind().as_str(), e.to_string()) {
                    error!(run_id = %self.run.run_id, error = %record_err, "Could not record run error");
                }
                PipelineStatus::Failed
            }
        };
        watchdog.abort();

        if let Err(e) = self.finish(terminal).await {
            error!(run_id = %self.run.run_id, error = %e, "Could not finalize run");
            if !self.run.is_terminal() && self.run.transition(PipelineStatus::Failed).is_ok() {
                if let Err(publish_err) = self.publish() {
                    error!(
                        run_id = %self.run.run_id,
                        error = %publish_err,
                        "Could not publish failed run"
                    );
                }
            }
        }

        info!(
            run_id = %self.run.run_id,
            tenant_id = %self.run.tenant_id,
            status = %self.run.status,
            total_cost = self.run.total_cost,
            duration_ms = timer.elapsed_ms(),
            "Pipeline run finished"
        );
        self.emit(
            event_types::PIPELINE_COMPLETED,
            serde_json::json!({
                "status": self.run.status,
                "total_cost": self.run.total_cost,
                "total_tokens": self.run.total_tokens,
                "failed_stages": self.run.failed_stages(),
            }),
        );
        self.run
    }

    async fn drive(&mut self) -> Result<PipelineStatus, StudyflowError> {
        self.advance(PipelineStatus::Parse)?;
        if let Some(stop) = self.verdict(&[]) {
            return Ok(stop);
        }
        let execution = self.execute_parse().await;
        let outcome = self.record(execution.result)?;
        if let Some(stop) = self.verdict(&[outcome]) {
            return Ok(stop);
        }
        let parsed = Arc::new(execution.value.ok_or_else(|| missing_output(StageName::Parse))?);

        self.advance(PipelineStatus::Parallel)?;
        if let Some(stop) = self.verdict(&[]) {
            return Ok(stop);
        }
        let (financial, compliance, outcomes) = self.execute_parallel(parsed).await?;
        if let Some(stop) = self.verdict(&outcomes) {
            return Ok(stop);
        }
        let financial = financial.ok_or_else(|| missing_output(StageName::Calculate))?;
        let compliance = compliance.ok_or_else(|| missing_output(StageName::Validate))?;

        self.advance(PipelineStatus::Narrate)?;
        if let Some(stop) = self.verdict(&[]) {
            return Ok(stop);
        }
        let execution = self.execute_narrate(financial, compliance).await;
        let outcome = self.record(execution.result)?;
        if let Some(stop) = self.verdict(&[outcome]) {
            return Ok(stop);
        }

        self.advance(PipelineStatus::Audit)?;
        if let Some(stop) = self.verdict(&[]) {
            return Ok(stop);
        }
        let execution = self.execute_audit().await;
        let outcome = self.record(execution.result)?;
        if outcome == StageOutcome::Cancelled || self.cancel.is_cancelled() {
            return Ok(PipelineStatus::Cancelled);
        }

        Ok(PipelineStatus::Completed)
    }

    /// Decides whether the run stops at this checkpoint.
    fn verdict(&self, outcomes: &[StageOutcome]) -> Option<PipelineStatus> {
        if self.cancel.is_cancelled() || outcomes.contains(&StageOutcome::Cancelled) {
            Some(PipelineStatus::Cancelled)
        } else if outcomes.contains(&StageOutcome::Failed) {
            Some(PipelineStatus::Failed)
        } else {
            None
        }
    }

    async fn finish(&mut self, terminal: PipelineStatus) -> Result<(), StudyflowError> {
        if terminal == PipelineStatus::Completed {
            self.advance(PipelineStatus::Finalizing)?;
        }

        for failure in self.runtime.audit.flush_run(self.run.run_id).await {
            self.run
                .add_warning(AUDIT_FAILED_WARNING, None, failure)?;
        }

        if terminal == PipelineStatus::Cancelled {
            let reason = self.cancel.reason();
            if reason.as_deref() == Some(RUN_TIMEOUT_REASON) {
                self.run.add_warning(
                    RUN_TIMEOUT_WARNING,
                    None,
                    format!("run exceeded {}ms", self.runtime.config.run_timeout_ms),
                )?;
            }
            info!(
                run_id = %self.run.run_id,
                reason = reason.as_deref().unwrap_or("cancelled"),
                "Pipeline run cancelled"
            );
        }

        self.advance(terminal)
    }

    async fn execute_parse(&self) -> StageExecution<ParsedData> {
        let parser = Arc::clone(&self.runtime.collaborators.parser);
        let input_ref = self.run.input_ref.clone();
        let threshold = self.runtime.config.quality_threshold;
        let (request, policy) = self.stage_setup(StageName::Parse);

        self.executor
            .execute(&request, &policy, &self.cancel, || {
                let parser = Arc::clone(&parser);
                let input_ref = input_ref.clone();
                async move {
                    let parsed = parser.parse(&input_ref).await?;
                    if parsed.quality_score < threshold {
                        return Err(StageError::parse(
                            ParseErrorKind::LowQuality,
                            format!(
                                "quality score {} is below threshold {threshold}",
                                parsed.quality_score
                            ),
                        ));
                    }
                    Ok(StageSuccess::new(parsed))
                }
            })
            .await
    }

    async fn execute_parallel(
        &mut self,
        parsed: Arc<ParsedData>,
    ) -> Result<(Option<FinancialResult>, Option<ComplianceResult>, Vec<StageOutcome>), StudyflowError> {
        let executor = self.executor.clone();
        let cancel = Arc::clone(&self.cancel);
        let calculator = Arc::clone(&self.runtime.collaborators.calculator);
        let validator = Arc::clone(&self.runtime.collaborators.validator);
        let (calc_request, calc_policy) = self.stage_setup(StageName::Calculate);
        let (validate_request, validate_policy) = self.stage_setup(StageName::Validate);

        let mut group: FuturesUnordered<BoxFuture<'_, ParallelOutput>> = FuturesUnordered::new();
        {
            let parsed = Arc::clone(&parsed);
            let executor = &executor;
            let cancel = &*cancel;
            group.push(
                async move {
                    let execution = executor
                        .execute(&calc_request, &calc_policy, cancel, || {
                            let calculator = Arc::clone(&calculator);
                            let parsed = Arc::clone(&parsed);
                            async move { calculator.calculate(&parsed).await.map(StageSuccess::new) }
                        })
                        .await;
                    ParallelOutput::Calculate(execution)
                }
                .boxed(),
            );
        }
        {
            let executor = &executor;
            let cancel = &*cancel;
            group.push(
                async move {
                    let execution = executor
                        .execute(&validate_request, &validate_policy, cancel, || {
                            let validator = Arc::clone(&validator);
                            let parsed = Arc::clone(&parsed);
                            async move { validator.validate(&parsed, None).await.map(StageSuccess::new) }
                        })
                        .await;
                    ParallelOutput::Validate(execution)
                }
                .boxed(),
            );
        }

        let mut financial = None;
        let mut compliance = None;
        let mut outcomes = Vec::with_capacity(2);
        let mut first_error = None;

        // Results are recorded in completion order; a failed sibling does
        // not cancel the other, the group always drains.
        while let Some(output) = group.next().await {
            let result = match output {
                ParallelOutput::Calculate(execution) => {
                    financial = execution.value;
                    execution.result
                }
                ParallelOutput::Validate(execution) => {
                    compliance = execution.value;
                    execution.result
                }
            };
            match self.record(result) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok((financial, compliance, outcomes)),
        }
    }

    async fn execute_narrate(
        &self,
        financial: FinancialResult,
        compliance: ComplianceResult,
    ) -> StageExecution<()> {
        let generator = Arc::clone(&self.runtime.collaborators.generator);
        let financial = Arc::new(financial);
        let compliance = Arc::new(compliance);
        let (request, policy) = self.stage_setup(StageName::Narrate);
        let policy = policy.with_budget_action(BudgetAction::Skip);

        self.executor
            .execute(&request, &policy, &self.cancel, || {
                let generator = Arc::clone(&generator);
                let financial = Arc::clone(&financial);
                let compliance = Arc::clone(&compliance);
                async move {
                    let narrative = generator.generate(&financial, &compliance).await?;
                    let usage = CostEstimate::new(narrative.cost, narrative.tokens_used);
                    Ok(StageSuccess::with_usage((), usage))
                }
            })
            .await
    }

    async fn execute_audit(&self) -> StageExecution<()> {
        let recorder = Arc::clone(&self.runtime.collaborators.audit);
        let run_id = self.run.run_id;
        let tenant_id = self.run.tenant_id.clone();
        let total_cost = self.run.total_cost;
        let (request, policy) = self.stage_setup(StageName::Audit);
        let policy = policy.with_classifier(|e| {
            !matches!(e, StageError::Cancelled { .. } | StageError::BudgetExceeded(_))
        });

        self.executor
            .execute(&request, &policy, &self.cancel, || {
                let recorder = Arc::clone(&recorder);
                let event = AuditEvent::run_audited(run_id, tenant_id.clone(), total_cost);
                async move {
                    recorder
                        .record(event)
                        .await
                        .map(StageSuccess::new)
                        .map_err(|e| StageError::Internal(e.to_string()))
                }
            })
            .await
    }

    fn stage_setup(&self, stage: StageName) -> (StageRequest, RetryPolicy) {
        let config = self.runtime.config.stage_policy(stage);
        let request = StageRequest::new(self.run.run_id, self.run.tenant_id.clone(), stage)
            .with_estimate(CostEstimate::new(config.estimated_cost, config.estimated_tokens));
        (request, RetryPolicy::from_config(config))
    }

    fn advance(&mut self, to: PipelineStatus) -> Result<(), StudyflowError> {
        let from = self.run.status;
        self.run.transition(to)?;
        info!(
            run_id = %self.run.run_id,
            tenant_id = %self.run.tenant_id,
            from = %from,
            to = %to,
            "Pipeline transition"
        );
        self.emit(
            event_types::PIPELINE_TRANSITION,
            serde_json::json!({ "from": from, "to": to }),
        );
        self.publish()
    }

    fn record(&mut self, result: StageResult) -> Result<StageOutcome, StudyflowError> {
        let outcome = result.outcome;
        self.run.record_stage(result)?;
        self.publish()?;
        Ok(outcome)
    }

    fn publish(&self) -> Result<(), StudyflowError> {
        guard::scoped_sync(&self.run.tenant_id, "progress.record", || {
            self.runtime.progress.record(&self.run)
        })?;
        Ok(())
    }

    fn emit(&self, event_type: &'static str, data: serde_json::Value) {
        self.runtime.events.try_emit(
            PipelineEvent::new(event_type, self.run.run_id, self.run.tenant_id.clone()).with_data(data),
        );
    }

    fn spawn_watchdog(&self) -> JoinHandle<()> {
        let cancel = Arc::clone(&self.cancel);
        let limit = self.runtime.config.run_timeout();
        let run_id = self.run.run_id;
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(limit) => {
                    if cancel.cancel(RUN_TIMEOUT_REASON) {
                        warn!(
                            run_id = %run_id,
                            timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                            "Run timed out, requesting cancellation"
                        );
                    }
                }
                () = cancel.cancelled() => {}
            }
        })
    }
}

fn missing_output(stage: StageName) -> StudyflowError {
    StudyflowError::Internal(format!("stage {stage} succeeded without output"))
}
