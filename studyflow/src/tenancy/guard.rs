//! Runtime tenant isolation guard.
//!
//! Every data-touching call proves that a live, enforced tenant context
//! exists (and, where a tenant is known, that it matches) before touching
//! tenant data. All checks fail closed: a missing or mismatched context is
//! an [`IsolationViolation`], never an unfiltered read.

use super::context::{self, TenantId};
use crate::errors::IsolationViolation;
use crate::observability::security;
use crate::observability::SpanTimer;
use std::future::Future;
use tracing::debug;

/// Fails unless an enforced tenant context is active.
///
/// `allow_system` is the explicit escape for non-tenant system operations
/// (health checks, migrations). Every use of it without an enforced context
/// is written to the security log.
pub fn assert_enforced(operation: &str, allow_system: bool) -> Result<(), IsolationViolation> {
    if context::is_enforced() {
        return Ok(());
    }
    if allow_system {
        security::log_system_bypass(operation, context::get_current().as_ref());
        return Ok(());
    }
    Err(violation(operation, None))
}

/// Fails unless the enforced context belongs to `expected`.
pub fn assert_tenant(operation: &str, expected: &TenantId) -> Result<(), IsolationViolation> {
    match context::current_context() {
        Some(ctx) if ctx.enforced && &ctx.tenant_id == expected => Ok(()),
        _ => Err(violation(operation, Some(expected.clone()))),
    }
}

/// Invokes `f` only after proving an enforced context exists.
pub fn require_tenant_context<R>(
    operation: &str,
    f: impl FnOnce() -> R,
) -> Result<R, IsolationViolation> {
    assert_enforced(operation, false)?;
    Ok(f())
}

/// Async form of [`require_tenant_context`].
///
/// The check runs when the returned future is first polled, immediately
/// before the wrapped future starts.
pub async fn require_tenant_context_async<F>(
    operation: &str,
    future: F,
) -> Result<F::Output, IsolationViolation>
where
    F: Future,
{
    assert_enforced(operation, false)?;
    Ok(future.await)
}

/// Runs `future` inside an enforced scope for `tenant_id`, logging entry and
/// exit.
///
/// This is the single entry point for call paths that do not inherit a
/// request scope: background tasks, delegate invocations and every stage
/// attempt.
pub async fn scoped<F>(tenant_id: &TenantId, operation: &str, future: F) -> F::Output
where
    F: Future,
{
    let timer = SpanTimer::start(operation);
    debug!(tenant_id = %tenant_id, operation, "Entering tenant scope");
    let output = context::enter(tenant_id.clone()).run(future).await;
    debug!(
        tenant_id = %tenant_id,
        operation,
        duration_ms = timer.elapsed_ms(),
        "Exited tenant scope"
    );
    output
}

/// Synchronous form of [`scoped`].
pub fn scoped_sync<R>(tenant_id: &TenantId, operation: &str, f: impl FnOnce() -> R) -> R {
    debug!(tenant_id = %tenant_id, operation, "Entering tenant scope");
    let output = context::enter(tenant_id.clone()).run_sync(f);
    debug!(tenant_id = %tenant_id, operation, "Exited tenant scope");
    output
}

fn violation(operation: &str, expected: Option<TenantId>) -> IsolationViolation {
    let violation = IsolationViolation::new(operation, expected, context::get_current());
    security::log_violation(&violation);
    violation
}
