//! Testing utilities for studyflow pipelines.
//!
//! Scripted collaborators that return queued results, record the tenant
//! they observed and count their calls.

mod mocks;

pub use mocks::{
    RecordingAuditSink, ScriptedCalculator, ScriptedGenerator, ScriptedParser, ScriptedValidator,
};
