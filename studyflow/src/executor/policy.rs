//! Retry policy with exponential backoff and jitter.
//!
//! A [`RetryPolicy`] is a plain value consumed by the stage executor; it
//! decides whether a failed attempt is retried and how long to wait first.

use crate::config::StagePolicyConfig;
use crate::errors::StageError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// What to do when the ledger refuses a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    /// The stage fails.
    #[default]
    Fail,
    /// The stage is recorded as skipped with a `budget_exceeded` warning.
    Skip,
}

/// Custom retry classifier.
pub type RetryClassifier = Arc<dyn Fn(&StageError) -> bool + Send + Sync>;

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// How a stage is retried.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub backoff_base: Duration,
    /// Cap on any single delay.
    pub backoff_max: Duration,
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
    /// Reaction to an exhausted budget.
    pub on_budget_exceeded: BudgetAction,
    classifier: Option<RetryClassifier>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            on_budget_exceeded: BudgetAction::Fail,
            classifier: None,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the policy of a configured stage. Budget exhaustion fails the
    /// stage; callers opt into [`BudgetAction::Skip`] per stage.
    #[must_use]
    pub fn from_config(config: &StagePolicyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.base_delay_ms),
            backoff_max: Duration::from_millis(config.max_delay_ms),
            timeout: Duration::from_millis(config.timeout_ms),
            jitter: config.jitter,
            on_budget_exceeded: BudgetAction::Fail,
            classifier: None,
        }
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff base and cap.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Sets the per-attempt deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the budget reaction.
    #[must_use]
    pub fn with_budget_action(mut self, action: BudgetAction) -> Self {
        self.on_budget_exceeded = action;
        self
    }

    /// Replaces the default classification of [`StageError::is_retryable`].
    ///
    /// Isolation violations are never retried, whatever the classifier says.
    #[must_use]
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&StageError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Classifies an error.
    #[must_use]
    pub fn is_retryable(&self, error: &StageError) -> bool {
        if error.is_isolation_violation() {
            return false;
        }
        match &self.classifier {
            Some(classify) => classify(error),
            None => error.is_retryable(),
        }
    }

    /// Decides what follows the failed attempt `attempt` (0-based).
    pub fn decide(&self, state: &mut RetryState, error: &StageError, attempt: u32) -> RetryDecision {
        if !self.is_retryable(error) {
            return RetryDecision::NotRetryable;
        }
        if attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(state.calculate_delay(self, attempt))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field("timeout", &self.timeout)
            .field("jitter", &self.jitter)
            .field("on_budget_exceeded", &self.on_budget_exceeded)
            .field("custom_classifier", &self.classifier.is_some())
            .finish()
    }
}

/// Per-execution backoff state.
#[derive(Debug, Default)]
pub struct RetryState {
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculates the delay after the failed attempt `attempt` (0-based):
    /// `min(base * 2^attempt, max)`, then jittered.
    #[must_use]
    pub fn calculate_delay(&mut self, policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = duration_ms(policy.backoff_base);
        let max = duration_ms(policy.backoff_max);

        let delay = base.saturating_mul(2u64.saturating_pow(attempt)).min(max);

        let jittered = match policy.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base.min(max)
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delay_ms = Some(next);
                next
            }
        };

        Duration::from_millis(jittered)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{IsolationViolation, ParseErrorKind};

    fn no_jitter(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new()
            .with_backoff(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_exponential_delay_no_jitter() {
        let policy = no_jitter(100, 10_000);
        let mut state = RetryState::new();
        assert_eq!(state.calculate_delay(&policy, 0), Duration::from_millis(100));
        assert_eq!(state.calculate_delay(&policy, 1), Duration::from_millis(200));
        assert_eq!(state.calculate_delay(&policy, 2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = no_jitter(1000, 5000);
        let mut state = RetryState::new();
        assert_eq!(state.calculate_delay(&policy, 10), Duration::from_millis(5000));
        assert_eq!(state.calculate_delay(&policy, 64), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_within_bounds() {
        let policy = no_jitter(100, 10_000).with_jitter(JitterStrategy::Full);
        let mut state = RetryState::new();
        for _ in 0..20 {
            assert!(state.calculate_delay(&policy, 1) <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_equal_and_decorrelated_jitter_bounds() {
        let mut state = RetryState::new();
        let policy = no_jitter(100, 1000).with_jitter(JitterStrategy::Equal);
        for _ in 0..20 {
            let d = state.calculate_delay(&policy, 0);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }

        let policy = no_jitter(100, 1000).with_jitter(JitterStrategy::Decorrelated);
        for attempt in 0..20 {
            let d = state.calculate_delay(&policy, attempt);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_decide_counts_attempts() {
        let policy = no_jitter(10, 100).with_max_retries(2);
        let mut state = RetryState::new();
        let err = StageError::calculation_transient("pool exhausted");

        assert!(matches!(policy.decide(&mut state, &err, 0), RetryDecision::Retry(_)));
        assert!(matches!(policy.decide(&mut state, &err, 1), RetryDecision::Retry(_)));
        assert_eq!(policy.decide(&mut state, &err, 2), RetryDecision::GiveUp);
    }

    #[test]
    fn test_decide_not_retryable() {
        let policy = no_jitter(10, 100).with_max_retries(5);
        let mut state = RetryState::new();
        let err = StageError::parse(ParseErrorKind::LowQuality, "score 40");
        assert_eq!(policy.decide(&mut state, &err, 0), RetryDecision::NotRetryable);
    }

    #[test]
    fn test_custom_classifier_cannot_retry_isolation() {
        let policy = no_jitter(10, 100).with_max_retries(5).with_classifier(|_| true);
        let mut state = RetryState::new();

        let validation = StageError::validation("rule 7");
        assert!(matches!(policy.decide(&mut state, &validation, 0), RetryDecision::Retry(_)));

        let isolation = StageError::from(IsolationViolation::new("parse", None, None));
        assert_eq!(policy.decide(&mut state, &isolation, 0), RetryDecision::NotRetryable);
    }

    #[test]
    fn test_from_config() {
        let config = StagePolicyConfig::new()
            .with_max_retries(3)
            .with_backoff_ms(250, 4000)
            .with_timeout_ms(1500);
        let policy = RetryPolicy::from_config(&config);

        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff_base, Duration::from_millis(250));
        assert_eq!(policy.backoff_max, Duration::from_millis(4000));
        assert_eq!(policy.timeout, Duration::from_millis(1500));
        assert_eq!(policy.on_budget_exceeded, BudgetAction::Fail);
        assert_eq!(
            policy.with_budget_action(BudgetAction::Skip).on_budget_exceeded,
            BudgetAction::Skip
        );
    }
}
