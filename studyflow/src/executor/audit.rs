//! Best-effort audit delivery.
//!
//! Audit events are written on spawned tasks so the pipeline never waits on
//! the audit trail. Each delivery re-enters the event's tenant scope, is
//! bounded by a timeout, and on failure is logged, reported as an
//! `audit.failed` event and kept as a per-run warning.

use crate::collaborators::{AuditEvent, AuditRecorder};
use crate::events::{event_types, EventSink, PipelineEvent};
use crate::tenancy::guard;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Default)]
struct Pending {
    handles: HashMap<Uuid, Vec<JoinHandle<()>>>,
    failures: HashMap<Uuid, Vec<String>>,
}

/// Dispatches audit events without blocking the caller.
#[derive(Clone)]
pub struct AuditDispatcher {
    recorder: Arc<dyn AuditRecorder>,
    events: Arc<dyn EventSink>,
    timeout: Duration,
    pending: Arc<Mutex<Pending>>,
}

impl AuditDispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(recorder: Arc<dyn AuditRecorder>, events: Arc<dyn EventSink>, timeout: Duration) -> Self {
        Self {
            recorder,
            events,
            timeout,
            pending: Arc::new(Mutex::new(Pending::default())),
        }
    }

    /// Schedules delivery of `event` and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, event: AuditEvent) {
        let run_id = event.run_id;
        let tenant_id = event.tenant_id.clone();
        let recorder = Arc::clone(&self.recorder);
        let events = Arc::clone(&self.events);
        let pending = Arc::clone(&self.pending);
        let timeout = self.timeout;

        let handle = tokio::spawn(async move {
            let scope_tenant = tenant_id.clone();
            let error = guard::scoped(&scope_tenant, "audit.record", async move {
                match tokio::time::timeout(timeout, recorder.record(event)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!("audit write timed out after {}ms", timeout.as_millis())),
                }
            })
            .await;

            match error {
                None => debug!(run_id = %run_id, tenant_id = %tenant_id, "Audit event recorded"),
                Some(message) => {
                    warn!(run_id = %run_id, tenant_id = %tenant_id, error = %message, "Audit event dropped");
                    events.try_emit(
                        PipelineEvent::new(event_types::AUDIT_FAILED, run_id, tenant_id)
                            .with_data(serde_json::json!({ "error": message.clone() })),
                    );
                    pending.lock().failures.entry(run_id).or_default().push(message);
                }
            }
        });

        let mut pending = self.pending.lock();
        let handles = pending.handles.entry(run_id).or_default();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Awaits every delivery scheduled for `run_id` and returns the failures.
    pub async fn flush_run(&self, run_id: Uuid) -> Vec<String> {
        let handles = self.pending.lock().handles.remove(&run_id).unwrap_or_default();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(run_id = %run_id, error = %e, "Audit delivery task aborted");
            }
        }
        self.pending.lock().failures.remove(&run_id).unwrap_or_default()
    }

    /// Awaits every pending delivery.
    pub async fn flush(&self) {
        let handles: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.handles.drain().flat_map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Returns the number of failed deliveries not yet collected by
    /// [`Self::flush_run`].
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.pending.lock().failures.values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for AuditDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditDispatcher")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
