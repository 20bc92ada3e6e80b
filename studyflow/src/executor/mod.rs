//! Stage execution.
//!
//! This module provides:
//! - The retry policy value object and backoff calculation
//! - The stage executor (scope, reserve, call, commit/release, retry)
//! - Best-effort audit delivery

mod audit;
mod policy;
mod stage_executor;

pub use audit::AuditDispatcher;
pub use policy::{
    BudgetAction, JitterStrategy, RetryClassifier, RetryDecision, RetryPolicy, RetryState,
};
pub use stage_executor::{StageExecution, StageExecutor, StageRequest, StageSuccess};
