//! Task-scoped ambient tenant context.
//!
//! The active tenant lives in a tokio task-local slot, so every unit of
//! concurrency sees only the identity it entered itself. Spawned tasks start
//! with no context and must enter one explicitly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

tokio::task_local! {
    static CURRENT_TENANT: TenantContext;
}

/// Identifier of an isolated customer organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The ambient identity of one unit of concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    /// The active tenant.
    pub tenant_id: TenantId,
    /// Whether isolation is enforced for this scope.
    pub enforced: bool,
}

impl TenantContext {
    /// Creates an enforced context for a tenant.
    #[must_use]
    pub fn new(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            enforced: true,
        }
    }

    /// Sets the enforcement flag.
    #[must_use]
    pub fn with_enforced(mut self, enforced: bool) -> Self {
        self.enforced = enforced;
        self
    }
}

/// Handle for a tenant scope that has been entered but not yet run.
///
/// The context is installed only while the wrapped body executes and the
/// previous value (if any) is restored when the body returns, errors or
/// panics. Nesting is allowed.
#[must_use = "a tenant scope does nothing until a body is run inside it"]
#[derive(Debug, Clone)]
pub struct TenantScope {
    context: TenantContext,
}

impl TenantScope {
    /// Creates a scope handle from an explicit context.
    pub fn from_context(context: TenantContext) -> Self {
        Self { context }
    }

    /// Returns the context this scope installs.
    #[must_use]
    pub fn context(&self) -> &TenantContext {
        &self.context
    }

    /// Runs a future with this scope's context installed.
    pub fn run<F>(self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        CURRENT_TENANT.scope(self.context, future)
    }

    /// Runs a synchronous closure with this scope's context installed.
    pub fn run_sync<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT_TENANT.sync_scope(self.context, f)
    }
}

/// Enters an enforced scope for `tenant_id`.
pub fn enter(tenant_id: impl Into<TenantId>) -> TenantScope {
    TenantScope::from_context(TenantContext::new(tenant_id))
}

/// Returns the active tenant id, if any scope is active.
#[must_use]
pub fn get_current() -> Option<TenantId> {
    CURRENT_TENANT.try_with(|ctx| ctx.tenant_id.clone()).ok()
}

/// Returns the full active context, if any.
#[must_use]
pub fn current_context() -> Option<TenantContext> {
    CURRENT_TENANT.try_with(Clone::clone).ok()
}

/// Returns true if an enforced tenant scope is active.
#[must_use]
pub fn is_enforced() -> bool {
    CURRENT_TENANT.try_with(|ctx| ctx.enforced).unwrap_or(false)
}
