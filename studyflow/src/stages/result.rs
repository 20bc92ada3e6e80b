//! Stage result records.

use super::StageName;
use crate::errors::{ErrorKind, StageError};
use crate::tenancy::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageOutcome {
    /// The collaborator produced a result.
    Success,
    /// The stage failed after exhausting or forgoing retries.
    Failed,
    /// The stage was intentionally not run to completion.
    Skipped,
    /// The stage observed a cancellation request.
    Cancelled,
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// The immutable record of one stage execution.
///
/// Produced once by the stage executor and appended to the run's history in
/// completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage.
    pub stage: StageName,
    /// How it ended.
    pub outcome: StageOutcome,
    /// Machine-readable error kind for failed, skipped or cancelled stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Human-readable error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Warning code for degraded outcomes (e.g. `budget_exceeded`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Wall time across all attempts, including backoff.
    pub duration_ms: u64,
    /// Committed cost.
    pub cost: f64,
    /// Committed tokens.
    pub tokens: u64,
    /// Attempts started.
    pub attempt_count: u32,
    /// The tenant the stage ran under.
    pub tenant_id: TenantId,
    /// When the first attempt was scheduled.
    pub started_at: DateTime<Utc>,
    /// When the result was produced.
    pub ended_at: DateTime<Utc>,
}

impl StageResult {
    /// Creates a result ending now.
    #[must_use]
    pub fn finish(
        stage: StageName,
        outcome: StageOutcome,
        tenant_id: TenantId,
        started_at: DateTime<Utc>,
    ) -> Self {
        let ended_at = Utc::now();
        let duration_ms = u64::try_from((ended_at - started_at).num_milliseconds()).unwrap_or(0);
        Self {
            stage,
            outcome,
            error_kind: None,
            error: None,
            warning: None,
            duration_ms,
            cost: 0.0,
            tokens: 0,
            attempt_count: 0,
            tenant_id,
            started_at,
            ended_at,
        }
    }

    /// Attaches the error that ended the stage.
    #[must_use]
    pub fn with_error(mut self, error: &StageError) -> Self {
        self.error_kind = Some(error.kind());
        self.error = Some(error.to_string());
        self
    }

    /// Attaches a warning code.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    /// Sets the committed cost and tokens.
    #[must_use]
    pub fn with_usage(mut self, cost: f64, tokens: u64) -> Self {
        self.cost = cost;
        self.tokens = tokens;
        self
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == StageOutcome::Success
    }
}
