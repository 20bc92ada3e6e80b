//! Scripted collaborators for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::collaborators::{
    AuditError, AuditEvent, AuditRecorder, ComplianceResult, ComplianceValidator, DocumentParser,
    FinancialCalculator, FinancialResult, NarrativeGenerator, NarrativeResult, ParsedData,
};
use crate::errors::StageError;
use crate::stages::StageName;
use crate::tenancy::{get_current, TenantId};

/// Queued responses with a fallback, shared by the scripted collaborators.
#[derive(Debug)]
struct Script<T> {
    queued: Mutex<VecDeque<Result<T, StageError>>>,
    fallback: Mutex<Result<T, StageError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    tenants: Mutex<Vec<Option<TenantId>>>,
}

impl<T: Clone> Script<T> {
    fn new(fallback: Result<T, StageError>) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
            tenants: Mutex::new(Vec::new()),
        }
    }

    async fn next(&self) -> Result<T, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tenants.lock().push(get_current());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self.queued.lock().pop_front();
        queued.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

macro_rules! scripted_controls {
    ($ty:ident, $out:ty) => {
        impl $ty {
            /// Queues a response for the next call.
            pub fn push(&self, result: Result<$out, StageError>) -> &Self {
                self.script.queued.lock().push_back(result);
                self
            }

            /// Queues a failure for the next call.
            pub fn push_err(&self, error: StageError) -> &Self {
                self.push(Err(error))
            }

            /// Replaces the response used once the queue is empty.
            pub fn set_fallback(&self, result: Result<$out, StageError>) {
                *self.script.fallback.lock() = result;
            }

            /// Delays every call by `delay`.
            #[must_use]
            pub fn with_delay(self, delay: Duration) -> Self {
                *self.script.delay.lock() = Some(delay);
                self
            }

            /// Returns the number of calls.
            #[must_use]
            pub fn call_count(&self) -> usize {
                self.script.calls.load(Ordering::SeqCst)
            }

            /// Returns the tenant observed in the ambient context on each call.
            #[must_use]
            pub fn observed_tenants(&self) -> Vec<Option<TenantId>> {
                self.script.tenants.lock().clone()
            }
        }
    };
}

/// A parser returning scripted results.
#[derive(Debug)]
pub struct ScriptedParser {
    script: Script<ParsedData>,
}

impl ScriptedParser {
    /// Creates a parser that returns data of the given quality.
    #[must_use]
    pub fn new(quality_score: f64) -> Self {
        Self {
            script: Script::new(Ok(ParsedData::new(quality_score))),
        }
    }
}

scripted_controls!(ScriptedParser, ParsedData);

#[async_trait]
impl DocumentParser for ScriptedParser {
    async fn parse(&self, _input_ref: &str) -> Result<ParsedData, StageError> {
        self.script.next().await
    }
}

/// A calculator returning scripted results.
#[derive(Debug)]
pub struct ScriptedCalculator {
    script: Script<FinancialResult>,
}

impl ScriptedCalculator {
    /// Creates a calculator that succeeds with a single `npv` metric.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Script::new(Ok(FinancialResult::default().with_metric("npv", 1_250_000.0))),
        }
    }
}

impl Default for ScriptedCalculator {
    fn default() -> Self {
        Self::new()
    }
}

scripted_controls!(ScriptedCalculator, FinancialResult);

#[async_trait]
impl FinancialCalculator for ScriptedCalculator {
    async fn calculate(&self, _parsed: &ParsedData) -> Result<FinancialResult, StageError> {
        self.script.next().await
    }
}

/// A validator returning scripted results.
#[derive(Debug)]
pub struct ScriptedValidator {
    script: Script<ComplianceResult>,
    saw_financial: Mutex<Vec<bool>>,
}

impl ScriptedValidator {
    /// Creates a validator that passes with no findings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Script::new(Ok(ComplianceResult {
                rules_evaluated: 12,
                findings: Vec::new(),
            })),
            saw_financial: Mutex::new(Vec::new()),
        }
    }

    /// Returns, per call, whether financial results were supplied.
    #[must_use]
    pub fn saw_financial(&self) -> Vec<bool> {
        self.saw_financial.lock().clone()
    }
}

impl Default for ScriptedValidator {
    fn default() -> Self {
        Self::new()
    }
}

scripted_controls!(ScriptedValidator, ComplianceResult);

#[async_trait]
impl ComplianceValidator for ScriptedValidator {
    async fn validate(
        &self,
        _parsed: &ParsedData,
        financial: Option<&FinancialResult>,
    ) -> Result<ComplianceResult, StageError> {
        self.saw_financial.lock().push(financial.is_some());
        self.script.next().await
    }
}

/// A narrative generator returning scripted results.
#[derive(Debug)]
pub struct ScriptedGenerator {
    script: Script<NarrativeResult>,
}

impl ScriptedGenerator {
    /// Creates a generator reporting the given usage.
    #[must_use]
    pub fn new(cost: f64, tokens_used: u64) -> Self {
        Self {
            script: Script::new(Ok(NarrativeResult {
                text: "The study supports the proposed investment.".to_string(),
                tokens_used,
                cost,
            })),
        }
    }
}

scripted_controls!(ScriptedGenerator, NarrativeResult);

#[async_trait]
impl NarrativeGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _financial: &FinancialResult,
        _compliance: &ComplianceResult,
    ) -> Result<NarrativeResult, StageError> {
        self.script.next().await
    }
}

/// An audit recorder that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failure: Mutex<Option<String>>,
    attempts: AtomicUsize,
}

impl RecordingAuditSink {
    /// Creates a sink that accepts every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink that rejects every event.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        let sink = Self::default();
        *sink.failure.lock() = Some(message.into());
        sink
    }

    /// Toggles rejection of subsequent events.
    pub fn set_failure(&self, message: Option<String>) {
        *self.failure.lock() = message;
    }

    /// Returns the accepted events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Returns the accepted events for one stage.
    #[must_use]
    pub fn events_for_stage(&self, stage: StageName) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.stage == Some(stage))
            .cloned()
            .collect()
    }

    /// Returns the number of write attempts, accepted or not.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditRecorder for RecordingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failure.lock().clone() {
            return Err(AuditError::new(message));
        }
        self.events.lock().push(event);
        Ok(())
    }
}
