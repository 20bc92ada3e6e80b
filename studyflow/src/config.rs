//! Runtime configuration.

use crate::errors::ConfigError;
use crate::executor::JitterStrategy;
use crate::ledger::LedgerConfig;
use crate::stages::StageName;
use crate::tenancy::TenantId;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding [`StudyflowConfig::quality_threshold`].
pub const ENV_QUALITY_THRESHOLD: &str = "STUDYFLOW_QUALITY_THRESHOLD";
/// Environment variable overriding [`StudyflowConfig::run_timeout_ms`].
pub const ENV_RUN_TIMEOUT_MS: &str = "STUDYFLOW_RUN_TIMEOUT_MS";
/// Environment variable overriding [`StudyflowConfig::default_daily_ceiling`].
pub const ENV_DAILY_CEILING: &str = "STUDYFLOW_DAILY_CEILING";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyflowConfig {
    /// Parse results scoring below this fail with `low_quality`.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Wall-clock limit for a whole run.
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    /// Per-event deadline for best-effort audit delivery.
    #[serde(default = "default_audit_timeout_ms")]
    pub audit_timeout_ms: u64,
    /// Daily ceiling for tenants without an override.
    #[serde(default = "default_daily_ceiling")]
    pub default_daily_ceiling: f64,
    /// Per-tenant daily ceilings.
    #[serde(default)]
    pub tenant_ceilings: HashMap<TenantId, f64>,
    /// Per-stage execution policy.
    #[serde(default)]
    pub stages: StagePolicies,
}

fn default_quality_threshold() -> f64 {
    70.0
}

fn default_run_timeout_ms() -> u64 {
    15 * 60 * 1000
}

fn default_audit_timeout_ms() -> u64 {
    5_000
}

fn default_daily_ceiling() -> f64 {
    50.0
}

impl Default for StudyflowConfig {
    fn default() -> Self {
        Self {
            quality_threshold: default_quality_threshold(),
            run_timeout_ms: default_run_timeout_ms(),
            audit_timeout_ms: default_audit_timeout_ms(),
            default_daily_ceiling: default_daily_ceiling(),
            tenant_ceilings: HashMap::new(),
            stages: StagePolicies::default(),
        }
    }
}

impl StudyflowConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Decode(e.to_string()))
    }

    /// Sets the quality threshold.
    #[must_use]
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    /// Sets the run timeout.
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the audit delivery timeout.
    #[must_use]
    pub fn with_audit_timeout(mut self, timeout: Duration) -> Self {
        self.audit_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the default daily ceiling.
    #[must_use]
    pub fn with_daily_ceiling(mut self, ceiling: f64) -> Self {
        self.default_daily_ceiling = ceiling;
        self
    }

    /// Sets a tenant's daily ceiling.
    #[must_use]
    pub fn with_tenant_ceiling(mut self, tenant_id: impl Into<TenantId>, ceiling: f64) -> Self {
        self.tenant_ceilings.insert(tenant_id.into(), ceiling);
        self
    }

    /// Replaces one stage's policy.
    #[must_use]
    pub fn with_stage_policy(mut self, stage: StageName, policy: StagePolicyConfig) -> Self {
        *self.stages.get_mut(stage) = policy;
        self
    }

    /// Returns the policy of a stage.
    #[must_use]
    pub fn stage_policy(&self, stage: StageName) -> &StagePolicyConfig {
        self.stages.get(stage)
    }

    /// Returns the run timeout.
    #[must_use]
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Returns the audit delivery timeout.
    #[must_use]
    pub fn audit_timeout(&self) -> Duration {
        Duration::from_millis(self.audit_timeout_ms)
    }

    /// Returns the ledger configuration.
    #[must_use]
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            default_ceiling: self.default_daily_ceiling,
            tenant_ceilings: self.tenant_ceilings.clone(),
        }
    }

    /// Applies `STUDYFLOW_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_QUALITY_THRESHOLD) {
            self.quality_threshold = parse_var(ENV_QUALITY_THRESHOLD, &value)?;
        }
        if let Some(value) = lookup(ENV_RUN_TIMEOUT_MS) {
            self.run_timeout_ms = parse_var(ENV_RUN_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_DAILY_CEILING) {
            self.default_daily_ceiling = parse_var(ENV_DAILY_CEILING, &value)?;
        }
        Ok(())
    }

    /// Rejects unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.quality_threshold.is_finite() || self.quality_threshold < 0.0 {
            return Err(ConfigError::invalid(
                "quality_threshold",
                "must be a non-negative number",
            ));
        }
        if self.run_timeout_ms == 0 {
            return Err(ConfigError::invalid("run_timeout_ms", "must be positive"));
        }
        if self.audit_timeout_ms == 0 {
            return Err(ConfigError::invalid("audit_timeout_ms", "must be positive"));
        }
        if !self.default_daily_ceiling.is_finite() {
            return Err(ConfigError::invalid("default_daily_ceiling", "must be finite"));
        }
        for stage in StageName::ALL {
            self.stages.get(stage).validate(stage)?;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, format!("could not parse '{value}': {e}")))
}

/// Loads a JSON configuration file, applies environment overrides and
/// validates the result.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<StudyflowConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let mut config = StudyflowConfig::from_json_str(&raw)
        .with_context(|| format!("decoding config file {}", path.display()))?;
    config
        .apply_env_overrides()
        .context("applying environment overrides")?;
    config
        .validate()
        .with_context(|| format!("validating config file {}", path.display()))?;
    Ok(config)
}

/// Execution policy of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePolicyConfig {
    /// Retries after the first attempt.
    #[serde(default)]
    pub max_retries: u32,
    /// Backoff base in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-attempt deadline in milliseconds.
    #[serde(default = "default_stage_timeout_ms")]
    pub timeout_ms: u64,
    /// Jitter applied to backoff delays.
    #[serde(default)]
    pub jitter: JitterStrategy,
    /// Cost reserved before each attempt.
    #[serde(default)]
    pub estimated_cost: f64,
    /// Tokens reserved before each attempt.
    #[serde(default)]
    pub estimated_tokens: u64,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_stage_timeout_ms() -> u64 {
    60_000
}

impl Default for StagePolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_ms: default_stage_timeout_ms(),
            jitter: JitterStrategy::default(),
            estimated_cost: 0.0,
            estimated_tokens: 0,
        }
    }
}

impl StagePolicyConfig {
    /// Creates a policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default policy for a stage.
    #[must_use]
    pub fn for_stage(stage: StageName) -> Self {
        let base = Self::default();
        match stage {
            StageName::Parse => base.with_max_retries(2).with_estimate(0.05, 0),
            StageName::Calculate => base.with_max_retries(2).with_estimate(0.02, 0),
            StageName::Validate => base.with_estimate(0.01, 0),
            StageName::Narrate => base
                .with_max_retries(3)
                .with_timeout_ms(120_000)
                .with_estimate(0.50, 2_000),
            StageName::Audit => base.with_max_retries(1).with_timeout_ms(10_000),
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
    pub fn with_backoff_ms(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Sets the per-attempt deadline.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the reservation estimate.
    #[must_use]
    pub fn with_estimate(mut self, cost: f64, tokens: u64) -> Self {
        self.estimated_cost = cost;
        self.estimated_tokens = tokens;
        self
    }

    fn validate(&self, stage: StageName) -> Result<(), ConfigError> {
        let field = |name: &str| format!("stages.{stage}.{name}");
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid(field("timeout_ms"), "must be positive"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::invalid(
                field("base_delay_ms"),
                format!("{} exceeds max_delay_ms {}", self.base_delay_ms, self.max_delay_ms),
            ));
        }
        if !self.estimated_cost.is_finite() || self.estimated_cost < 0.0 {
            return Err(ConfigError::invalid(
                field("estimated_cost"),
                "must be a non-negative number",
            ));
        }
        Ok(())
    }
}

/// Policies for every stage.
///
/// Fields absent from a decoded stage object keep that stage's own
/// defaults, not the generic [`StagePolicyConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StagePolicyOverrides")]
pub struct StagePolicies {
    /// Parse policy.
    pub parse: StagePolicyConfig,
    /// Calculate policy.
    pub calculate: StagePolicyConfig,
    /// Validate policy.
    pub validate: StagePolicyConfig,
    /// Narrate policy.
    pub narrate: StagePolicyConfig,
    /// Audit policy.
    pub audit: StagePolicyConfig,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            parse: StagePolicyConfig::for_stage(StageName::Parse),
            calculate: StagePolicyConfig::for_stage(StageName::Calculate),
            validate: StagePolicyConfig::for_stage(StageName::Validate),
            narrate: StagePolicyConfig::for_stage(StageName::Narrate),
            audit: StagePolicyConfig::for_stage(StageName::Audit),
        }
    }
}

/// A partially specified stage policy, as decoded.
#[derive(Debug, Default, Deserialize)]
struct StagePolicyOverride {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    timeout_ms: Option<u64>,
    jitter: Option<JitterStrategy>,
    estimated_cost: Option<f64>,
    estimated_tokens: Option<u64>,
}

impl StagePolicyOverride {
    fn apply(self, stage: StageName) -> StagePolicyConfig {
        let base = StagePolicyConfig::for_stage(stage);
        StagePolicyConfig {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            base_delay_ms: self.base_delay_ms.unwrap_or(base.base_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            jitter: self.jitter.unwrap_or(base.jitter),
            estimated_cost: self.estimated_cost.unwrap_or(base.estimated_cost),
            estimated_tokens: self.estimated_tokens.unwrap_or(base.estimated_tokens),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StagePolicyOverrides {
    parse: StagePolicyOverride,
    calculate: StagePolicyOverride,
    validate: StagePolicyOverride,
    narrate: StagePolicyOverride,
    audit: StagePolicyOverride,
}

impl From<StagePolicyOverrides> for StagePolicies {
    fn from(raw: StagePolicyOverrides) -> Self {
        Self {
            parse: raw.parse.apply(StageName::Parse),
            calculate: raw.calculate.apply(StageName::Calculate),
            validate: raw.validate.apply(StageName::Validate),
            narrate: raw.narrate.apply(StageName::Narrate),
            audit: raw.audit.apply(StageName::Audit),
        }
    }
}

impl StagePolicies {
    /// Returns a stage's policy.
    #[must_use]
    pub fn get(&self, stage: StageName) -> &StagePolicyConfig {
        match stage {
            StageName::Parse => &self.parse,
            StageName::Calculate => &self.calculate,
            StageName::Validate => &self.validate,
            StageName::Narrate => &self.narrate,
            StageName::Audit => &self.audit,
        }
    }

    fn get_mut(&mut self, stage: StageName) -> &mut StagePolicyConfig {
        match stage {
            StageName::Parse => &mut self.parse,
            StageName::Calculate => &mut self.calculate,
            StageName::Validate => &mut self.validate,
            StageName::Narrate => &mut self.narrate,
            StageName::Audit => &mut self.audit,
        }
    }
}
