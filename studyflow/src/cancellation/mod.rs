//! Cooperative cancellation.
//!
//! Runs share one [`CancellationToken`] between the service (which sets it)
//! and the orchestrator and stage executor (which observe it at stage
//! boundaries and during backoff waits).

mod token;

pub use token::CancellationToken;
