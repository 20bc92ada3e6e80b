//! Tenant identity and runtime isolation enforcement.
//!
//! This module provides:
//! - Task-scoped ambient tenant context with explicit scope handles
//! - The isolation guard: assertion, guarding wrappers and scoped entry

mod context;
pub mod guard;

pub use context::{
    current_context, enter, get_current, is_enforced, TenantContext, TenantId, TenantScope,
};
pub use guard::{
    assert_enforced, assert_tenant, require_tenant_context, require_tenant_context_async,
    scoped, scoped_sync,
};
