//! # Studyflow
//!
//! Tenant-isolated, budget-bounded orchestration of financial study
//! pipelines.
//!
//! A run takes an uploaded study document through five stages:
//!
//! - **Parse**: extract structured data and reject low-quality documents
//! - **Calculate** and **Validate**: run concurrently on the parsed data
//! - **Narrate**: generate the study narrative, skipped when the budget is spent
//! - **Audit**: write the run to the audit trail
//!
//! Every data access happens inside an enforced tenant scope. Each stage
//! attempt reserves against the tenant's daily ceiling before it runs and
//! is reported to the audit trail.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use studyflow::prelude::*;
//!
//! let runtime = PipelineRuntime::new(StudyflowConfig::new(), collaborators);
//! let service = PipelineService::new(runtime);
//!
//! let run_id = service.submit(&TenantId::new("acme"), "study-42", "s3://uploads/42.pdf")?;
//! let run = enter("acme").run(service.wait(run_id)).await?;
//! println!("{}", run.summary());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod tenancy;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::collaborators::{
        AuditEvent, AuditRecorder, Collaborators, ComplianceResult, ComplianceValidator,
        DocumentParser, FinancialCalculator, FinancialResult, NarrativeGenerator,
        NarrativeResult, ParsedData,
    };
    pub use crate::config::{load_config, StagePolicyConfig, StudyflowConfig};
    pub use crate::errors::{
        BudgetExceeded, ErrorKind, IsolationViolation, LedgerError, StageError, StudyflowError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::ledger::{CostLedger, LedgerConfig};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        CancelOutcome, PipelineRun, PipelineRuntime, PipelineService, PipelineStatus,
    };
    pub use crate::stages::{StageName, StageOutcome, StageResult};
    pub use crate::tenancy::{enter, get_current, TenantId};
}
