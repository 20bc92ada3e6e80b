//! End-to-end tests driving whole runs through the service.

use crate::collaborators::{Collaborators, MockDocumentParser, ParsedData};
use crate::config::{load_config, StagePolicyConfig, StudyflowConfig};
use crate::errors::{IsolationViolation, LedgerError, ParseErrorKind, StageError, StudyflowError};
use crate::events::{event_types, CollectingEventSink};
use crate::executor::JitterStrategy;
use crate::ledger::{CommitOutcome, CostLedger, LedgerConfig};
use crate::pipeline::{
    CancelOutcome, InMemoryProgressStore, PipelineRun, PipelineRuntime, PipelineService,
    PipelineStatus, ProgressStore, AUDIT_FAILED_WARNING, RUN_TIMEOUT_WARNING,
};
use crate::stages::{StageName, StageOutcome};
use crate::testing::{
    RecordingAuditSink, ScriptedCalculator, ScriptedGenerator, ScriptedParser, ScriptedValidator,
};
use crate::tenancy::{enter, TenantId};
use futures::future::join_all;
use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    parser: Arc<ScriptedParser>,
    calculator: Arc<ScriptedCalculator>,
    validator: Arc<ScriptedValidator>,
    generator: Arc<ScriptedGenerator>,
    audit: Arc<RecordingAuditSink>,
    events: Arc<CollectingEventSink>,
}

impl Harness {
    fn new() -> Self {
        Self {
            parser: Arc::new(ScriptedParser::new(92.0)),
            calculator: Arc::new(ScriptedCalculator::new()),
            validator: Arc::new(ScriptedValidator::new()),
            generator: Arc::new(ScriptedGenerator::new(0.30, 1_500)),
            audit: Arc::new(RecordingAuditSink::new()),
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            Arc::clone(&self.parser) as _,
            Arc::clone(&self.calculator) as _,
            Arc::clone(&self.validator) as _,
            Arc::clone(&self.generator) as _,
            Arc::clone(&self.audit) as _,
        )
    }

    fn service(&self, config: StudyflowConfig) -> PipelineService {
        self.service_with(config, self.collaborators())
    }

    fn service_with(&self, config: StudyflowConfig, collaborators: Collaborators) -> PipelineService {
        let runtime = PipelineRuntime::new(config, collaborators)
            .with_event_sink(Arc::clone(&self.events) as _);
        PipelineService::new(runtime)
    }
}

/// Short backoffs so retry-heavy runs stay quick on the paused clock.
fn fast_config() -> StudyflowConfig {
    let mut config = StudyflowConfig::new();
    for stage in StageName::ALL {
        let policy = config.stage_policy(stage).clone().with_backoff_ms(10, 100);
        config = config.with_stage_policy(stage, policy);
    }
    config
}

fn tenant(id: &str) -> TenantId {
    TenantId::new(id)
}

async fn wait_as(service: &PipelineService, tenant_id: &str, run_id: Uuid) -> PipelineRun {
    enter(tenant_id)
        .run(service.wait(run_id))
        .await
        .unwrap()
}

fn stage_outcome(run: &PipelineRun, stage: StageName) -> Option<StageOutcome> {
    run.stage_result(stage).map(|r| r.outcome)
}

fn warning_codes(run: &PipelineRun) -> Vec<&str> {
    run.warnings.iter().map(|w| w.code.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_completes() {
    let h = Harness::new();
    let service = h.service(fast_config());

    let run_id = service.submit(&tenant("acme"), "study-1", "s3://docs/study-1.pdf").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Completed);
    assert!(run.errors.is_empty());
    assert!(run.warnings.is_empty());

    let order: Vec<StageName> = run.stage_history.iter().map(|r| r.stage).collect();
    assert_eq!(order.len(), 5);
    assert_eq!(order[0], StageName::Parse);
    assert!(order[1..3].contains(&StageName::Calculate));
    assert!(order[1..3].contains(&StageName::Validate));
    assert_eq!(&order[3..], &[StageName::Narrate, StageName::Audit]);

    // parse 0.05 + calculate 0.02 + validate 0.01 estimates, narrate reports 0.30
    assert!((run.total_cost - 0.38).abs() < 1e-9);
    assert_eq!(run.total_tokens, 1_500);
    assert!(run.completed_at.is_some());

    assert_eq!(h.validator.saw_financial(), vec![false]);
    for observed in h.parser.observed_tenants() {
        assert_eq!(observed, Some(tenant("acme")));
    }

    let transitions = h.events.events_of_type(event_types::PIPELINE_TRANSITION);
    assert_eq!(transitions.len(), 6);
    assert_eq!(h.events.events_of_type(event_types::PIPELINE_COMPLETED).len(), 1);

    assert_eq!(h.audit.events_for_stage(StageName::Narrate).len(), 1);
    assert!(h
        .audit
        .events()
        .iter()
        .all(|e| e.tenant_id == tenant("acme") && e.run_id == run_id));

    let status = enter("acme").run_sync(|| service.get_status(run_id)).unwrap();
    assert_eq!(status, run);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_tenants_do_not_interfere() {
    let h = Harness::new();
    let service = h.service(fast_config());

    let run_a = service.submit(&tenant("tenant-a"), "study-a", "doc-a").unwrap();
    let run_b = service.submit(&tenant("tenant-b"), "study-b", "doc-b").unwrap();

    let (a, b) = tokio::join!(
        wait_as(&service, "tenant-a", run_a),
        wait_as(&service, "tenant-b", run_b)
    );
    assert_eq!(a.tenant_id, tenant("tenant-a"));
    assert_eq!(b.tenant_id, tenant("tenant-b"));
    assert!(a.stage_history.iter().all(|r| r.tenant_id == tenant("tenant-a")));
    assert!(b.stage_history.iter().all(|r| r.tenant_id == tenant("tenant-b")));

    let cross = enter("tenant-b").run_sync(|| service.get_status(run_a));
    assert!(matches!(cross, Err(StudyflowError::Isolation(_))));
    let cross_cancel = enter("tenant-a").run_sync(|| service.cancel(run_b));
    assert!(cross_cancel.is_err());
    let cross_wait = enter("tenant-a").run(service.wait(run_b)).await;
    assert!(matches!(cross_wait, Err(StudyflowError::Isolation(_))));

    for event in h.audit.events() {
        let expected = if event.run_id == run_a { "tenant-a" } else { "tenant-b" };
        assert_eq!(event.tenant_id, tenant(expected));
    }

    let ledger = service.runtime().ledger();
    let spent_a = enter("tenant-a")
        .run_sync(|| ledger.daily_summary(&tenant("tenant-a")))
        .unwrap()
        .spent;
    assert!((spent_a - a.total_cost).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_access_without_context_is_a_violation() {
    let h = Harness::new();
    let service = h.service(fast_config());
    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();

    assert!(matches!(service.get_status(run_id), Err(StudyflowError::Isolation(_))));
    assert!(service.cancel(run_id).is_err());
    assert!(matches!(service.wait(run_id).await, Err(StudyflowError::Isolation(_))));

    let ledger = service.runtime().ledger();
    let err = ledger.check_and_reserve(&tenant("acme"), 0.1, 0).unwrap_err();
    assert!(matches!(err, LedgerError::Isolation(_)));

    let run = wait_as(&service, "acme", run_id).await;
    assert_eq!(run.status, PipelineStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_submit_rejects_conflicting_scope() {
    let h = Harness::new();
    let service = h.service(fast_config());

    let err = enter("tenant-b")
        .run_sync(|| service.submit(&tenant("tenant-a"), "study-1", "doc-1"))
        .unwrap_err();
    assert!(matches!(err, StudyflowError::Isolation(_)));
    assert_eq!(service.run_count(), 0);

    let run_id = enter("tenant-a")
        .run_sync(|| service.submit(&tenant("tenant-a"), "study-1", "doc-1"))
        .unwrap();
    assert_eq!(wait_as(&service, "tenant-a", run_id).await.status, PipelineStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_reservations_never_pass_ceiling() {
    let ledger = Arc::new(CostLedger::new(LedgerConfig::default().with_default_ceiling(1.0)));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let ledger = Arc::clone(&ledger);
        tasks.push(tokio::spawn(enter("acme").run(async move {
            ledger.check_and_reserve(&tenant("acme"), 0.1, 0).is_ok()
        })));
    }
    let mut granted = 0;
    for task in tasks {
        if task.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 10);

    let summary = enter("acme").run_sync(|| ledger.daily_summary(&tenant("acme"))).unwrap();
    assert!(summary.reserved <= 1.0 + 1e-9);
}

#[test]
fn test_double_commit_accrues_once() {
    let ledger = CostLedger::new(LedgerConfig::default().with_default_ceiling(5.0));
    enter("acme").run_sync(|| {
        let reservation = ledger.check_and_reserve(&tenant("acme"), 0.5, 100).unwrap();
        assert_eq!(ledger.commit(&reservation, 0.4, 90).unwrap(), CommitOutcome::Applied);
        assert_eq!(
            ledger.commit(&reservation, 0.4, 90).unwrap(),
            CommitOutcome::AlreadyCommitted
        );

        let summary = ledger.daily_summary(&tenant("acme")).unwrap();
        assert!((summary.spent - 0.4).abs() < 1e-9);
        assert_eq!(summary.spent_tokens, 90);
        assert_eq!(summary.reserved, 0.0);
    });
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_up_to_limit() {
    let h = Harness::new();
    for _ in 0..3 {
        h.calculator.push_err(StageError::calculation_transient("rate source unavailable"));
    }
    let service = h.service(fast_config());

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Failed);
    let calc = run.stage_result(StageName::Calculate).unwrap();
    assert_eq!(calc.outcome, StageOutcome::Failed);
    assert_eq!(calc.attempt_count, 3);
    assert_eq!(h.calculator.call_count(), 3);
    assert_eq!(h.generator.call_count(), 0);

    let open = enter("acme")
        .run_sync(|| service.runtime().ledger().open_reservations_for_run(&tenant("acme"), run_id))
        .unwrap();
    assert_eq!(open, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_after_transient_failures() {
    let h = Harness::new();
    h.calculator
        .push_err(StageError::calculation_transient("timeout"))
        .push_err(StageError::calculation_transient("timeout"));
    let service = h.service(fast_config());

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Completed);
    assert_eq!(run.stage_result(StageName::Calculate).unwrap().attempt_count, 3);
    // failed attempts release their reservations; only the success accrues
    assert!((run.stage_result(StageName::Calculate).unwrap().cost - 0.02).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_low_quality_document_fails_without_cost() {
    let h = Harness::new();
    h.parser.set_fallback(Ok(ParsedData::new(40.0)));
    let service = h.service(fast_config());

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Failed);
    assert_eq!(run.stage_history.len(), 1);
    let parse = &run.stage_history[0];
    assert_eq!(parse.outcome, StageOutcome::Failed);
    assert_eq!(parse.attempt_count, 1);
    assert_eq!(parse.cost, 0.0);
    assert_eq!(run.total_cost, 0.0);
    assert_eq!(run.errors[0].code, "low_quality");

    assert_eq!(h.calculator.call_count(), 0);
    assert_eq!(h.validator.call_count(), 0);
    assert_eq!(h.generator.call_count(), 0);

    let spent = enter("acme")
        .run_sync(|| service.runtime().ledger().daily_summary(&tenant("acme")))
        .unwrap()
        .spent;
    assert_eq!(spent, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_document_is_not_retried() {
    let h = Harness::new();
    let mut parser = MockDocumentParser::new();
    parser
        .expect_parse()
        .times(1)
        .returning(|_| Err(StageError::parse(ParseErrorKind::Malformed, "not a PDF")));
    let collaborators = h.collaborators().with_parser(Arc::new(parser));
    let service = h.service_with(fast_config(), collaborators);

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Failed);
    assert_eq!(run.errors[0].code, "malformed");
    assert_eq!(run.errors[0].stage, Some(StageName::Parse));
}

#[tokio::test(start_paused = true)]
async fn test_sibling_failure_keeps_both_results() {
    let h = Harness::new();
    h.validator.set_fallback(Err(StageError::validation("debt ratio above limit")));
    let service = h.service(fast_config());

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Failed);
    assert_eq!(stage_outcome(&run, StageName::Calculate), Some(StageOutcome::Success));
    assert_eq!(stage_outcome(&run, StageName::Validate), Some(StageOutcome::Failed));
    assert_eq!(stage_outcome(&run, StageName::Narrate), None);
    assert_eq!(h.calculator.call_count(), 1);
    assert_eq!(h.generator.call_count(), 0);

    // parse and calculate still committed their spend
    assert!((run.total_cost - 0.07).abs() < 1e-9);
    assert_eq!(run.errors.len(), 1);
    assert_eq!(run.errors[0].code, "validation");
}

#[tokio::test(start_paused = true)]
async fn test_narrate_skipped_when_budget_exhausted() {
    let h = Harness::new();
    let config = fast_config()
        .with_daily_ceiling(1.0)
        .with_stage_policy(
            StageName::Parse,
            StagePolicyConfig::for_stage(StageName::Parse).with_estimate(0.0, 0),
        )
        .with_stage_policy(
            StageName::Calculate,
            StagePolicyConfig::for_stage(StageName::Calculate).with_estimate(1.0, 0),
        )
        .with_stage_policy(
            StageName::Validate,
            StagePolicyConfig::for_stage(StageName::Validate).with_estimate(0.0, 0),
        );
    let service = h.service(config);

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Completed);
    let narrate = run.stage_result(StageName::Narrate).unwrap();
    assert_eq!(narrate.outcome, StageOutcome::Skipped);
    assert_eq!(narrate.warning.as_deref(), Some("budget_exceeded"));
    assert_eq!(warning_codes(&run), vec!["budget_exceeded"]);
    assert_eq!(stage_outcome(&run, StageName::Audit), Some(StageOutcome::Success));
    assert_eq!(h.generator.call_count(), 0);

    let summary = enter("acme")
        .run_sync(|| service.runtime().ledger().daily_summary(&tenant("acme")))
        .unwrap();
    assert!(summary.spent <= summary.ceiling + 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_budget_failure_outside_narrate_fails_run() {
    let h = Harness::new();
    let service = h.service(fast_config().with_daily_ceiling(0.0));

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Failed);
    assert_eq!(run.errors[0].code, "budget_exceeded");
    assert_eq!(h.parser.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_parallel() {
    let h = Harness::new();
    let calculator = Arc::new(ScriptedCalculator::new().with_delay(Duration::from_secs(10)));
    let validator = Arc::new(ScriptedValidator::new().with_delay(Duration::from_secs(10)));
    let collaborators = Collaborators::new(
        Arc::clone(&h.parser) as _,
        Arc::clone(&calculator) as _,
        Arc::clone(&validator) as _,
        Arc::clone(&h.generator) as _,
        Arc::clone(&h.audit) as _,
    );
    let service = h.service_with(fast_config(), collaborators);

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let snapshot = enter("acme").run_sync(|| service.get_status(run_id)).unwrap();
    assert_eq!(snapshot.status, PipelineStatus::Parallel);

    let outcome = enter("acme").run_sync(|| service.cancel(run_id)).unwrap();
    assert_eq!(outcome, CancelOutcome::Accepted);

    let run = wait_as(&service, "acme", run_id).await;
    assert_eq!(run.status, PipelineStatus::Cancelled);
    assert_eq!(stage_outcome(&run, StageName::Narrate), None);
    assert_eq!(h.generator.call_count(), 0);

    // both calls were in flight; each finishes its attempt and stops there
    for stage in [StageName::Calculate, StageName::Validate] {
        let result = run.stage_result(stage).unwrap();
        assert_eq!(result.outcome, StageOutcome::Success);
        assert_eq!(result.attempt_count, 1);
    }
    assert_eq!(calculator.call_count(), 1);
    assert_eq!(validator.call_count(), 1);

    let open = enter("acme")
        .run_sync(|| service.runtime().ledger().open_reservations_for_run(&tenant("acme"), run_id))
        .unwrap();
    assert_eq!(open, 0);

    let again = enter("acme").run_sync(|| service.cancel(run_id)).unwrap();
    assert_eq!(again, CancelOutcome::AlreadyTerminal);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_parallel_with_sibling_in_backoff() {
    let h = Harness::new();
    h.calculator.set_fallback(Err(StageError::calculation_transient("rate source down")));
    let validator = Arc::new(ScriptedValidator::new().with_delay(Duration::from_secs(10)));
    let collaborators = Collaborators::new(
        Arc::clone(&h.parser) as _,
        Arc::clone(&h.calculator) as _,
        Arc::clone(&validator) as _,
        Arc::clone(&h.generator) as _,
        Arc::clone(&h.audit) as _,
    );
    let config = fast_config().with_stage_policy(
        StageName::Calculate,
        StagePolicyConfig::for_stage(StageName::Calculate)
            .with_max_retries(5)
            .with_backoff_ms(60_000, 60_000)
            .with_jitter(JitterStrategy::None),
    );
    let service = h.service_with(config, collaborators);

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let open = enter("acme")
        .run_sync(|| service.runtime().ledger().open_reservations_for_run(&tenant("acme"), run_id))
        .unwrap();
    assert_eq!(open, 1, "only the in-flight validator holds a reservation");
    assert_eq!(
        enter("acme").run_sync(|| service.cancel(run_id)).unwrap(),
        CancelOutcome::Accepted
    );

    let run = wait_as(&service, "acme", run_id).await;
    assert_eq!(run.status, PipelineStatus::Cancelled);

    let calc = run.stage_result(StageName::Calculate).unwrap();
    assert_eq!(calc.outcome, StageOutcome::Cancelled);
    assert_eq!(calc.attempt_count, 1);
    assert_eq!(h.calculator.call_count(), 1);

    let validate = run.stage_result(StageName::Validate).unwrap();
    assert_eq!(validate.outcome, StageOutcome::Success);
    assert_eq!(validate.attempt_count, 1);

    // the backing-off sibling finishes first; the in-flight one drains after
    let order: Vec<StageName> = run.stage_history.iter().map(|r| r.stage).collect();
    assert_eq!(order, vec![StageName::Parse, StageName::Calculate, StageName::Validate]);
    assert_eq!(h.generator.call_count(), 0);

    let open = enter("acme")
        .run_sync(|| service.runtime().ledger().open_reservations_for_run(&tenant("acme"), run_id))
        .unwrap();
    assert_eq!(open, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_retries() {
    let h = Harness::new();
    h.calculator.set_fallback(Err(StageError::calculation_transient("rate source down")));
    let config = fast_config().with_stage_policy(
        StageName::Calculate,
        StagePolicyConfig::for_stage(StageName::Calculate)
            .with_max_retries(5)
            .with_backoff_ms(60_000, 60_000)
            .with_jitter(JitterStrategy::None),
    );
    let service = h.service(config);

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(
        enter("acme").run_sync(|| service.cancel(run_id)).unwrap(),
        CancelOutcome::Accepted
    );

    let run = wait_as(&service, "acme", run_id).await;
    assert_eq!(run.status, PipelineStatus::Cancelled);
    assert_eq!(stage_outcome(&run, StageName::Calculate), Some(StageOutcome::Cancelled));
    assert_eq!(h.calculator.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_cancels_run() {
    let h = Harness::new();
    let calculator = Arc::new(ScriptedCalculator::new().with_delay(Duration::from_secs(10)));
    let collaborators = Collaborators::new(
        Arc::clone(&h.parser) as _,
        Arc::clone(&calculator) as _,
        Arc::clone(&h.validator) as _,
        Arc::clone(&h.generator) as _,
        Arc::clone(&h.audit) as _,
    );
    let service =
        h.service_with(fast_config().with_run_timeout(Duration::from_secs(2)), collaborators);

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Cancelled);
    assert!(warning_codes(&run).contains(&RUN_TIMEOUT_WARNING));
    assert_eq!(h.generator.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_audit_failure_is_a_warning() {
    let h = Harness::new();
    h.audit.set_failure(Some("audit store offline".to_string()));
    let service = h.service(fast_config());

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Completed);
    assert!(run.errors.is_empty());
    assert_eq!(stage_outcome(&run, StageName::Audit), Some(StageOutcome::Failed));
    assert_eq!(stage_outcome(&run, StageName::Narrate), Some(StageOutcome::Success));
    assert!(!run.warnings.is_empty());
    assert!(run.warnings.iter().all(|w| w.code == AUDIT_FAILED_WARNING));
    assert!(h.audit.attempt_count() > 0);
    assert!(!h.events.events_of_type(event_types::AUDIT_FAILED).is_empty());

    assert!(run.failed_stages().is_empty());
    let completed = h.events.events_of_type(event_types::PIPELINE_COMPLETED);
    assert_eq!(completed[0].data["failed_stages"], serde_json::json!([]));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_outcomes() {
    let h = Harness::new();
    let service = h.service(fast_config());

    let unknown = enter("acme").run_sync(|| service.cancel(Uuid::new_v4())).unwrap();
    assert_eq!(unknown, CancelOutcome::NotFound);

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;
    assert_eq!(run.status, PipelineStatus::Completed);

    let late = enter("acme").run_sync(|| service.cancel(run_id)).unwrap();
    assert_eq!(late, CancelOutcome::AlreadyTerminal);

    let missing = enter("acme").run_sync(|| service.get_status(Uuid::new_v4()));
    assert!(matches!(missing, Err(StudyflowError::RunNotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_partial_narrate_config_still_skips_on_budget() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "default_daily_ceiling": 1.0,
            "stages": {{
                "parse": {{"estimated_cost": 0.0}},
                "calculate": {{"estimated_cost": 1.0}},
                "validate": {{"estimated_cost": 0.0}},
                "narrate": {{"max_retries": 1, "estimated_cost": 0.1}}
            }}
        }}"#
    )
    .unwrap();
    let config = load_config(file.path()).unwrap();
    assert_eq!(config.stage_policy(StageName::Narrate).timeout_ms, 120_000);

    let h = Harness::new();
    let service = h.service(config);
    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Completed);
    let narrate = run.stage_result(StageName::Narrate).unwrap();
    assert_eq!(narrate.outcome, StageOutcome::Skipped);
    assert_eq!(narrate.warning.as_deref(), Some("budget_exceeded"));
    assert_eq!(stage_outcome(&run, StageName::Audit), Some(StageOutcome::Success));
    assert_eq!(h.generator.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_zero_estimate_stage_accrues_reported_cost() {
    let h = Harness::new();
    let config = fast_config().with_daily_ceiling(0.40).with_stage_policy(
        StageName::Narrate,
        StagePolicyConfig::for_stage(StageName::Narrate).with_estimate(0.0, 0),
    );
    let service = h.service(config);

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;

    assert_eq!(run.status, PipelineStatus::Completed);
    let narrate = run.stage_result(StageName::Narrate).unwrap();
    assert!((narrate.cost - 0.30).abs() < 1e-9);
    assert_eq!(narrate.tokens, 1_500);
    assert!((run.total_cost - 0.38).abs() < 1e-9);

    let summary = enter("acme")
        .run_sync(|| service.runtime().ledger().daily_summary(&tenant("acme")))
        .unwrap();
    assert!((summary.spent - run.total_cost).abs() < 1e-9);
    assert_eq!(summary.spent_tokens, 1_500);

    // the narrative's real cost leaves no room for another parse
    let next = service.submit(&tenant("acme"), "study-2", "doc-2").unwrap();
    let next = wait_as(&service, "acme", next).await;
    assert_eq!(next.status, PipelineStatus::Failed);
    assert_eq!(next.errors[0].code, "budget_exceeded");
}

#[tokio::test(start_paused = true)]
async fn test_finished_runs_release_service_and_ledger_state() {
    let h = Harness::new();
    let service = h.service(fast_config());
    let tenants = ["tenant-a", "tenant-b", "tenant-c", "tenant-d", "tenant-e"];

    let submitted: Vec<(&str, Uuid)> = (0..50)
        .map(|i| {
            let tenant_id = tenants[i % tenants.len()];
            let run_id = service
                .submit(&tenant(tenant_id), format!("study-{i}"), format!("doc-{i}"))
                .unwrap();
            (tenant_id, run_id)
        })
        .collect();
    let runs = join_all(
        submitted
            .iter()
            .map(|(tenant_id, run_id)| wait_as(&service, tenant_id, *run_id)),
    )
    .await;
    assert!(runs.iter().all(|r| r.status == PipelineStatus::Completed));

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(service.run_count(), 0);
    assert_eq!(service.runtime().ledger().tracked_reservations(), 0);

    // finished runs are still answered from the progress store
    let (tenant_id, run_id) = submitted[0];
    assert_eq!(
        enter(tenant_id).run_sync(|| service.cancel(run_id)).unwrap(),
        CancelOutcome::AlreadyTerminal
    );
    assert_eq!(wait_as(&service, tenant_id, run_id).await, runs[0]);
    let cross = enter("tenant-b").run(service.wait(run_id)).await;
    assert!(matches!(cross, Err(StudyflowError::Isolation(_))));
    assert!(enter("tenant-b").run_sync(|| service.cancel(run_id)).is_err());

    let unknown = enter(tenant_id).run(service.wait(Uuid::new_v4())).await;
    assert!(matches!(unknown, Err(StudyflowError::RunNotFound(_))));
}

/// Accepts snapshots except those in one status.
#[derive(Debug)]
struct RejectingProgressStore {
    inner: InMemoryProgressStore,
    rejected: PipelineStatus,
}

impl ProgressStore for RejectingProgressStore {
    fn record(&self, snapshot: &PipelineRun) -> Result<(), IsolationViolation> {
        if snapshot.status == self.rejected {
            return Err(IsolationViolation::new(
                "progress.record",
                Some(snapshot.tenant_id.clone()),
                None,
            ));
        }
        self.inner.record(snapshot)
    }

    fn get(&self, run_id: Uuid) -> Result<Option<PipelineRun>, IsolationViolation> {
        self.inner.get(run_id)
    }
}

#[tokio::test(start_paused = true)]
async fn test_finalize_failure_publishes_failed_run() {
    let h = Harness::new();
    let store = Arc::new(RejectingProgressStore {
        inner: InMemoryProgressStore::new(),
        rejected: PipelineStatus::Finalizing,
    });
    let runtime = PipelineRuntime::new(fast_config(), h.collaborators())
        .with_progress_store(Arc::clone(&store) as _);
    let service = PipelineService::new(runtime);

    let run_id = service.submit(&tenant("acme"), "study-1", "doc-1").unwrap();
    let run = wait_as(&service, "acme", run_id).await;
    assert_eq!(run.status, PipelineStatus::Failed);
    assert!(run.completed_at.is_some());

    let published = enter("acme").run_sync(|| service.get_status(run_id)).unwrap();
    assert_eq!(published.status, PipelineStatus::Failed);
    assert_eq!(
        enter("acme").run_sync(|| service.cancel(run_id)).unwrap(),
        CancelOutcome::AlreadyTerminal
    );
}
