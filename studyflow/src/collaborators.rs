//! Contracts of the external collaborators the pipeline delegates to.
//!
//! Implementations live outside this crate. The pipeline only decides
//! whether, when, how often, under which tenant and within which budget each
//! collaborator is called.

use crate::errors::{ErrorKind, StageError};
use crate::stages::{StageName, StageOutcome};
use crate::tenancy::TenantId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Output of the parse stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedData {
    /// Data-quality score in `0..=100`.
    pub quality_score: f64,
    /// Extracted fields.
    #[serde(default)]
    pub fields: serde_json::Value,
}

impl ParsedData {
    /// Creates parsed data with the given quality score.
    #[must_use]
    pub fn new(quality_score: f64) -> Self {
        Self {
            quality_score,
            fields: serde_json::Value::Null,
        }
    }

    /// Sets the extracted fields.
    #[must_use]
    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        self.fields = fields;
        self
    }
}

/// Output of the calculate stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialResult {
    /// Named metrics (e.g. `npv`, `irr`).
    pub metrics: BTreeMap<String, f64>,
}

impl FinancialResult {
    /// Adds a metric.
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Output of the validate stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceResult {
    /// Number of rules evaluated.
    pub rules_evaluated: u32,
    /// Non-blocking findings.
    #[serde(default)]
    pub findings: Vec<String>,
}

/// Output of the narrate stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NarrativeResult {
    /// The generated text.
    pub text: String,
    /// Tokens consumed.
    pub tokens_used: u64,
    /// Actual cost.
    pub cost: f64,
}

/// What an audit event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A stage attempt succeeded.
    StageSucceeded,
    /// A stage attempt failed.
    StageFailed,
    /// A stage was skipped.
    StageSkipped,
    /// A stage was cancelled.
    StageCancelled,
    /// The run reached its audit stage.
    RunAudited,
}

impl From<StageOutcome> for AuditAction {
    fn from(outcome: StageOutcome) -> Self {
        match outcome {
            StageOutcome::Success => Self::StageSucceeded,
            StageOutcome::Failed => Self::StageFailed,
            StageOutcome::Skipped => Self::StageSkipped,
            StageOutcome::Cancelled => Self::StageCancelled,
        }
    }
}

/// An entry for the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique id.
    pub event_id: Uuid,
    /// The run.
    pub run_id: Uuid,
    /// The tenant.
    pub tenant_id: TenantId,
    /// The stage, for stage-level events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    /// What happened.
    pub action: AuditAction,
    /// 1-based attempt number, 0 for run-level events.
    pub attempt: u32,
    /// Error kind of a failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Cost committed by the attempt.
    pub cost: f64,
    /// When the event was produced.
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Creates a stage-attempt event.
    #[must_use]
    pub fn stage_attempt(
        run_id: Uuid,
        tenant_id: TenantId,
        stage: StageName,
        action: AuditAction,
        attempt: u32,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            run_id,
            tenant_id,
            stage: Some(stage),
            action,
            attempt,
            error_kind: None,
            cost: 0.0,
            recorded_at: Utc::now(),
        }
    }

    /// Creates the run-level event written by the audit stage.
    #[must_use]
    pub fn run_audited(run_id: Uuid, tenant_id: TenantId, total_cost: f64) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            run_id,
            tenant_id,
            stage: None,
            action: AuditAction::RunAudited,
            attempt: 0,
            error_kind: None,
            cost: total_cost,
            recorded_at: Utc::now(),
        }
    }

    /// Sets the error kind.
    #[must_use]
    pub fn with_error_kind(mut self, kind: Option<ErrorKind>) -> Self {
        self.error_kind = kind;
        self
    }

    /// Sets the committed cost.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Failure to write to the audit trail.
#[derive(Debug, Clone, Error)]
#[error("Audit write failed: {message}")]
pub struct AuditError {
    /// Details.
    pub message: String,
}

impl AuditError {
    /// Creates an audit error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Extracts structured data from an uploaded document.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Parses the document behind `input_ref`.
    async fn parse(&self, input_ref: &str) -> Result<ParsedData, StageError>;
}

/// Computes financial metrics.
#[async_trait]
pub trait FinancialCalculator: Send + Sync {
    /// Computes metrics for parsed data.
    async fn calculate(&self, parsed: &ParsedData) -> Result<FinancialResult, StageError>;
}

/// Applies compliance rules.
#[async_trait]
pub trait ComplianceValidator: Send + Sync {
    /// Validates a study.
    ///
    /// `financial` is `None` when validation runs alongside calculation.
    async fn validate(
        &self,
        parsed: &ParsedData,
        financial: Option<&FinancialResult>,
    ) -> Result<ComplianceResult, StageError>;
}

/// Generates the study narrative.
#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    /// Generates a narrative for the computed and validated study.
    async fn generate(
        &self,
        financial: &FinancialResult,
        compliance: &ComplianceResult,
    ) -> Result<NarrativeResult, StageError>;
}

/// Writes to the audit trail.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    /// Records one event.
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// The set of collaborators a pipeline runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub(crate) parser: Arc<dyn DocumentParser>,
    pub(crate) calculator: Arc<dyn FinancialCalculator>,
    pub(crate) validator: Arc<dyn ComplianceValidator>,
    pub(crate) generator: Arc<dyn NarrativeGenerator>,
    pub(crate) audit: Arc<dyn AuditRecorder>,
}

impl Collaborators {
    /// Creates a collaborator set.
    #[must_use]
    pub fn new(
        parser: Arc<dyn DocumentParser>,
        calculator: Arc<dyn FinancialCalculator>,
        validator: Arc<dyn ComplianceValidator>,
        generator: Arc<dyn NarrativeGenerator>,
        audit: Arc<dyn AuditRecorder>,
    ) -> Self {
        Self {
            parser,
            calculator,
            validator,
            generator,
            audit,
        }
    }

    /// Replaces the parser.
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn DocumentParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Replaces the audit recorder.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditRecorder>) -> Self {
        self.audit = audit;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
