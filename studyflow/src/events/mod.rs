//! Pipeline lifecycle events.
//!
//! The orchestrator, stage executor and audit dispatcher report what they do
//! to an injected [`EventSink`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::stages::StageName;
use crate::tenancy::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type names.
pub mod event_types {
    /// The run changed status.
    pub const PIPELINE_TRANSITION: &str = "pipeline.transition";
    /// The run reached a terminal status.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A stage attempt started.
    pub const STAGE_ATTEMPT: &str = "stage.attempt";
    /// A stage succeeded.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage was skipped.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage was cancelled.
    pub const STAGE_CANCELLED: &str = "stage.cancelled";
    /// An audit event could not be delivered.
    pub const AUDIT_FAILED: &str = "audit.failed";
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Event type, one of [`event_types`].
    pub event_type: String,
    /// The run.
    pub run_id: Uuid,
    /// The run's tenant.
    pub tenant_id: TenantId,
    /// The stage, for stage events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    /// Creates an event with an empty payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>, run_id: Uuid, tenant_id: TenantId) -> Self {
        Self {
            event_type: event_type.into(),
            run_id,
            tenant_id,
            stage: None,
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageName) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
