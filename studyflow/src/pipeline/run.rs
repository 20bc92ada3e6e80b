//! The pipeline run record.

use super::state::PipelineStatus;
use crate::errors::{ErrorKind, StudyflowError};
use crate::stages::{StageName, StageOutcome, StageResult};
use crate::tenancy::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

/// Warning code for audit writes that did not succeed.
pub const AUDIT_FAILED_WARNING: &str = "audit_failed";
/// Warning code for runs cancelled by the run timeout.
pub const RUN_TIMEOUT_WARNING: &str = "run_timeout";

/// An error or warning attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIssue {
    /// Machine-readable code (an error kind or a warning code).
    pub code: String,
    /// The stage involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    /// Human-readable message.
    pub message: String,
    /// When the issue was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl RunIssue {
    /// Creates an issue.
    #[must_use]
    pub fn new(code: impl Into<String>, stage: Option<StageName>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            stage,
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// One execution of the study pipeline.
///
/// Owned by a single orchestrator, which is its only writer. Once the status
/// is terminal the record is frozen; mutators return
/// [`StudyflowError::RunFrozen`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique id.
    pub run_id: Uuid,
    /// The owning tenant; never changes.
    pub tenant_id: TenantId,
    /// The study being processed.
    pub subject_id: String,
    /// Reference to the uploaded document.
    pub input_ref: String,
    /// Current status.
    pub status: PipelineStatus,
    /// The stage in flight, `None` between stages and during PARALLEL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageName>,
    /// Stage results in completion order.
    pub stage_history: Vec<StageResult>,
    /// When the run was submitted.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Committed cost across stages.
    pub total_cost: f64,
    /// Committed tokens across stages.
    pub total_tokens: u64,
    /// Failures.
    pub errors: Vec<RunIssue>,
    /// Degradations that did not fail the run.
    pub warnings: Vec<RunIssue>,
}

impl PipelineRun {
    /// Creates a run in INITIALIZING.
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        subject_id: impl Into<String>,
        input_ref: impl Into<String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            tenant_id,
            subject_id: subject_id.into(),
            input_ref: input_ref.into(),
            status: PipelineStatus::Initializing,
            current_stage: None,
            stage_history: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            total_cost: 0.0,
            total_tokens: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Returns true once the run can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the latest result of a stage.
    #[must_use]
    pub fn stage_result(&self, stage: StageName) -> Option<&StageResult> {
        self.stage_history.iter().rev().find(|r| r.stage == stage)
    }

    /// Returns each failed stage with its error kind.
    ///
    /// A failed AUDIT stage is a warning, not a failure, and is left out.
    #[must_use]
    pub fn failed_stages(&self) -> Vec<(StageName, ErrorKind)> {
        self.stage_history
            .iter()
            .filter(|r| r.outcome == StageOutcome::Failed && r.stage != StageName::Audit)
            .map(|r| (r.stage, r.error_kind.unwrap_or(ErrorKind::Internal)))
            .collect()
    }

    /// Wall time of the run in milliseconds, up to now if still running.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        u64::try_from((end - self.started_at).num_milliseconds()).unwrap_or(0)
    }

    /// Returns a one-paragraph human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Run {} for subject '{}' is {}",
            self.run_id, self.subject_id, self.status
        );
        if self.stage_history.is_empty() {
            out.push_str("; no stages ran");
        } else {
            let stages: Vec<String> = self
                .stage_history
                .iter()
                .map(|r| match r.error_kind {
                    Some(kind) if r.outcome != StageOutcome::Success => {
                        format!("{} {} ({kind})", r.stage, r.outcome)
                    }
                    _ => format!("{} {}", r.stage, r.outcome),
                })
                .collect();
            let _ = write!(out, "; stages: {}", stages.join(", "));
        }
        let _ = write!(
            out,
            "; cost {:.4} over {} tokens",
            self.total_cost, self.total_tokens
        );
        if !self.warnings.is_empty() {
            let codes: Vec<&str> = self.warnings.iter().map(|w| w.code.as_str()).collect();
            let _ = write!(out, "; warnings: {}", codes.join(", "));
        }
        out
    }

    pub(crate) fn transition(&mut self, to: PipelineStatus) -> Result<(), StudyflowError> {
        self.ensure_live()?;
        if !self.status.can_transition_to(to) {
            return Err(StudyflowError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.current_stage = match to {
            PipelineStatus::Parse => Some(StageName::Parse),
            PipelineStatus::Narrate => Some(StageName::Narrate),
            PipelineStatus::Audit => Some(StageName::Audit),
            _ => None,
        };
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub(crate) fn record_stage(&mut self, result: StageResult) -> Result<(), StudyflowError> {
        self.ensure_live()?;
        if !self.stage_in_flight(result.stage) {
            return Err(StudyflowError::UnexpectedStage {
                stage: result.stage,
                status: self.status,
            });
        }
        self.total_cost += result.cost;
        self.total_tokens = self.total_tokens.saturating_add(result.tokens);

        match result.outcome {
            StageOutcome::Failed if result.stage == StageName::Audit => {
                let message = result.error.clone().unwrap_or_else(|| "audit stage failed".to_string());
                self.warnings.push(RunIssue::new(AUDIT_FAILED_WARNING, Some(result.stage), message));
            }
            StageOutcome::Failed => {
                let code = result.error_kind.unwrap_or(ErrorKind::Internal);
                let message = result.error.clone().unwrap_or_else(|| code.to_string());
                self.errors.push(RunIssue::new(code.as_str(), Some(result.stage), message));
            }
            StageOutcome::Skipped => {
                let code = result.warning.clone().unwrap_or_else(|| "skipped".to_string());
                let message = result.error.clone().unwrap_or_else(|| code.clone());
                self.warnings.push(RunIssue::new(code, Some(result.stage), message));
            }
            StageOutcome::Success | StageOutcome::Cancelled => {}
        }
        self.stage_history.push(result);
        Ok(())
    }

    pub(crate) fn add_warning(
        &mut self,
        code: impl Into<String>,
        stage: Option<StageName>,
        message: impl Into<String>,
    ) -> Result<(), StudyflowError> {
        self.ensure_live()?;
        self.warnings.push(RunIssue::new(code, stage, message));
        Ok(())
    }

    pub(crate) fn add_error(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), StudyflowError> {
        self.ensure_live()?;
        self.errors.push(RunIssue::new(code, None, message));
        Ok(())
    }

    fn stage_in_flight(&self, stage: StageName) -> bool {
        match self.status {
            PipelineStatus::Parallel => matches!(stage, StageName::Calculate | StageName::Validate),
            _ => self.current_stage == Some(stage),
        }
    }

    fn ensure_live(&self) -> Result<(), StudyflowError> {
        if self.is_terminal() {
            return Err(StudyflowError::RunFrozen {
                run_id: self.run_id,
                status: self.status,
            });
        }
        Ok(())
    }
}
