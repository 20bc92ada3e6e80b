//! Study pipeline orchestration.
//!
//! This module provides:
//! - The run state machine and run record
//! - The orchestrator that drives one run
//! - The progress store used for status polling
//! - The service used to submit, poll and cancel runs

mod orchestrator;
mod progress;
mod run;
mod service;
mod state;

#[cfg(test)]
mod integration_tests;

pub use orchestrator::{PipelineOrchestrator, PipelineRuntime, RUN_TIMEOUT_REASON};
pub use progress::{InMemoryProgressStore, ProgressStore};
pub use run::{PipelineRun, RunIssue, AUDIT_FAILED_WARNING, RUN_TIMEOUT_WARNING};
pub use service::{CancelOutcome, PipelineService, USER_CANCEL_REASON};
pub use state::PipelineStatus;
