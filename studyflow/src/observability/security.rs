//! Security log for tenant isolation events.
//!
//! Isolation events go to their own `tracing` target so they can be routed
//! and retained separately from ordinary business errors.

use crate::errors::IsolationViolation;
use crate::tenancy::TenantId;
use tracing::{error, warn};

/// The `tracing` target used for every security event.
pub const SECURITY_TARGET: &str = "studyflow::security";

/// Writes an isolation violation to the security log.
pub fn log_violation(violation: &IsolationViolation) {
    error!(
        target: SECURITY_TARGET,
        event = "isolation_violation",
        operation = %violation.operation,
        expected_tenant = ?violation.expected_tenant.as_ref().map(TenantId::as_str),
        observed_context = ?violation.observed_context.as_ref().map(TenantId::as_str),
        timestamp = %violation.timestamp.to_rfc3339(),
        "Tenant isolation violation"
    );
}

/// Writes a privileged system bypass to the security log.
pub fn log_system_bypass(operation: &str, observed: Option<&TenantId>) {
    warn!(
        target: SECURITY_TARGET,
        event = "system_bypass",
        operation,
        observed_context = ?observed.map(TenantId::as_str),
        "Tenant enforcement bypassed for system operation"
    );
}
