//! Error types for the studyflow core.
//!
//! Business failures of collaborators ([`StageError`]) are kept apart from
//! security failures ([`IsolationViolation`]); both map to a
//! machine-readable [`ErrorKind`] for run diagnostics.

use crate::pipeline::PipelineStatus;
use crate::stages::StageName;
use crate::tenancy::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Machine-readable error classification exposed on stage results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input could not be parsed.
    Malformed,
    /// Input parsed but did not match the expected schema.
    SchemaInvalid,
    /// Parsed data fell below the data-quality threshold.
    LowQuality,
    /// Transient calculation fault.
    CalculationTransient,
    /// Deterministic calculation failure.
    Calculation,
    /// Compliance rules rejected the study.
    Validation,
    /// Narrative generation failed.
    Generation,
    /// The tenant's cost ceiling would be exceeded.
    BudgetExceeded,
    /// The stage exceeded its deadline.
    Timeout,
    /// The stage observed a cancellation request.
    Cancelled,
    /// No verified, matching tenant context was present.
    IsolationViolation,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// Returns the `snake_case` code for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::SchemaInvalid => "schema_invalid",
            Self::LowQuality => "low_quality",
            Self::CalculationTransient => "calculation_transient",
            Self::Calculation => "calculation",
            Self::Validation => "validation",
            Self::Generation => "generation",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::IsolationViolation => "isolation_violation",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subtypes of a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    /// The document is unreadable.
    Malformed,
    /// The document does not match the study schema.
    SchemaInvalid,
    /// The document parsed but its quality score is too low.
    LowQuality,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed"),
            Self::SchemaInvalid => write!(f, "schema_invalid"),
            Self::LowQuality => write!(f, "low_quality"),
        }
    }
}

/// A data access attempted without a verified, matching tenant context.
///
/// Emitted to the security log when raised; never used to drive business
/// decisions beyond failing closed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error(
    "Isolation violation in '{operation}': expected tenant {}, observed {}",
    show_tenant(.expected_tenant),
    show_tenant(.observed_context)
)]
pub struct IsolationViolation {
    /// The guarded operation.
    pub operation: String,
    /// The tenant the operation required, if known.
    pub expected_tenant: Option<TenantId>,
    /// The tenant found in the ambient context, if any.
    pub observed_context: Option<TenantId>,
    /// When the violation was detected.
    pub timestamp: DateTime<Utc>,
}

impl IsolationViolation {
    /// Creates a new violation record.
    #[must_use]
    pub fn new(
        operation: impl Into<String>,
        expected_tenant: Option<TenantId>,
        observed_context: Option<TenantId>,
    ) -> Self {
        Self {
            operation: operation.into(),
            expected_tenant,
            observed_context,
            timestamp: Utc::now(),
        }
    }
}

fn show_tenant(tenant: &Option<TenantId>) -> String {
    tenant
        .as_ref()
        .map_or_else(|| "<none>".to_string(), ToString::to_string)
}

/// Raised when a reservation would push a tenant past its ceiling.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Budget exceeded for tenant '{tenant_id}': spent {spent:.4} + reserved {reserved:.4} + requested {requested:.4} > ceiling {ceiling:.4}")]
pub struct BudgetExceeded {
    /// The tenant.
    pub tenant_id: TenantId,
    /// Amount already committed this period.
    pub spent: f64,
    /// Amount held by open reservations.
    pub reserved: f64,
    /// Amount requested by the rejected reservation.
    pub requested: f64,
    /// The period ceiling.
    pub ceiling: f64,
}

/// Failure reported by, or on behalf of, a stage collaborator.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// Parsing failed.
    #[error("Parse failed ({kind}): {message}")]
    Parse {
        /// The parse failure subtype.
        kind: ParseErrorKind,
        /// Details.
        message: String,
    },

    /// A financial computation failed.
    #[error("Calculation failed: {message}")]
    Calculation {
        /// Details.
        message: String,
        /// Whether the fault is transient (resource) rather than deterministic.
        transient: bool,
    },

    /// Compliance validation rejected the study.
    #[error("Validation failed: {message}")]
    Validation {
        /// Details.
        message: String,
    },

    /// Narrative generation failed.
    #[error("Generation failed: {message}")]
    Generation {
        /// Details.
        message: String,
    },

    /// The tenant's budget cannot cover the stage.
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    /// The stage did not finish within its deadline.
    #[error("Stage timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The stage observed a cancellation request.
    #[error("Stage cancelled: {reason}")]
    Cancelled {
        /// The cancellation reason.
        reason: String,
    },

    /// A tenant isolation check failed.
    #[error(transparent)]
    Isolation(#[from] IsolationViolation),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StageError {
    /// Creates a parse error.
    #[must_use]
    pub fn parse(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::Parse {
            kind,
            message: message.into(),
        }
    }

    /// Creates a transient (retryable) calculation error.
    #[must_use]
    pub fn calculation_transient(message: impl Into<String>) -> Self {
        Self::Calculation {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a deterministic calculation error.
    #[must_use]
    pub fn calculation(message: impl Into<String>) -> Self {
        Self::Calculation {
            message: message.into(),
            transient: false,
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a generation error.
    #[must_use]
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
        }
    }

    /// Returns the machine-readable kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { kind, .. } => match kind {
                ParseErrorKind::Malformed => ErrorKind::Malformed,
                ParseErrorKind::SchemaInvalid => ErrorKind::SchemaInvalid,
                ParseErrorKind::LowQuality => ErrorKind::LowQuality,
            },
            Self::Calculation { transient: true, .. } => ErrorKind::CalculationTransient,
            Self::Calculation { transient: false, .. } => ErrorKind::Calculation,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Generation { .. } => ErrorKind::Generation,
            Self::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Isolation(_) => ErrorKind::IsolationViolation,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Default retry classification.
    ///
    /// Transient calculation faults, generation failures and timeouts are
    /// retryable. Parse, validation, budget, cancellation and isolation
    /// failures are terminal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Calculation { transient: true, .. } | Self::Generation { .. } | Self::Timeout { .. }
        )
    }

    /// Returns true for tenant isolation failures.
    #[must_use]
    pub fn is_isolation_violation(&self) -> bool {
        matches!(self, Self::Isolation(_))
    }
}

impl From<LedgerError> for StageError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::BudgetExceeded(e) => Self::BudgetExceeded(e),
            LedgerError::Isolation(v) => Self::Isolation(v),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Errors raised by the cost ledger.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The reservation would exceed the ceiling.
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    /// The reservation id is not known to the ledger.
    #[error("Unknown reservation: {0}")]
    UnknownReservation(Uuid),

    /// Commit was attempted on a released reservation.
    #[error("Reservation {0} was already released")]
    AlreadyReleased(Uuid),

    /// A negative or non-finite amount was supplied.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// The caller's tenant context did not match the budget.
    #[error(transparent)]
    Isolation(#[from] IsolationViolation),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A field holds an unusable value.
    #[error("Invalid configuration for '{field}': {reason}")]
    Invalid {
        /// The offending field.
        field: String,
        /// Why it is invalid.
        reason: String,
    },

    /// The configuration document could not be decoded.
    #[error("Could not decode configuration: {0}")]
    Decode(String),
}

impl ConfigError {
    /// Creates an invalid-field error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// The main error type for studyflow operations.
#[derive(Debug, Error)]
pub enum StudyflowError {
    /// A tenant isolation check failed.
    #[error(transparent)]
    Isolation(#[from] IsolationViolation),

    /// A ledger operation failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A stage failed outside the executor.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No run exists with the given id.
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    /// A terminal run was mutated.
    #[error("Run {run_id} is {status} and can no longer change")]
    RunFrozen {
        /// The run.
        run_id: Uuid,
        /// Its terminal status.
        status: PipelineStatus,
    },

    /// The state machine rejected a transition.
    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition {
        /// Current status.
        from: PipelineStatus,
        /// Requested status.
        to: PipelineStatus,
    },

    /// A stage result was recorded for a stage that is not in flight.
    #[error("Stage {stage} is not running in state {status}")]
    UnexpectedStage {
        /// The stage.
        stage: StageName,
        /// The run status at the time.
        status: PipelineStatus,
    },

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StudyflowError {
    /// Returns the machine-readable kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Isolation(_) => ErrorKind::IsolationViolation,
            Self::Ledger(LedgerError::BudgetExceeded(_)) => ErrorKind::BudgetExceeded,
            Self::Ledger(LedgerError::Isolation(_)) => ErrorKind::IsolationViolation,
            Self::Stage(e) => e.kind(),
            _ => ErrorKind::Internal,
        }
    }
}
