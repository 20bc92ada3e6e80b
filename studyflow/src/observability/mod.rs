//! Observability utilities.
//!
//! Logging is done through `tracing`; this module installs the subscriber,
//! times spans and owns the dedicated security log.

pub mod security;
mod telemetry;

pub use telemetry::{init_tracing, SpanTimer};
