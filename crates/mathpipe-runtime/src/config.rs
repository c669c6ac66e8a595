//! Pipeline configuration.
//!
//! [`PipelineConfig`] is an immutable value handed to the orchestrator at
//! construction (or per request via `handle_with`). Durations are written in
//! humantime form (`"30s"`, `"250ms"`).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::providers::CompletionOptions;

/// Environment variable overriding `provider_order` (comma-separated).
pub const ENV_PROVIDER_ORDER: &str = "MATHPIPE_PROVIDER_ORDER";
/// Environment variable overriding `max_solve_retries`.
pub const ENV_MAX_SOLVE_RETRIES: &str = "MATHPIPE_MAX_SOLVE_RETRIES";
/// Environment variable overriding `request_timeout` (humantime).
pub const ENV_REQUEST_TIMEOUT: &str = "MATHPIPE_REQUEST_TIMEOUT";

/// Errors from configuration validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("provider_order must name at least one provider")]
    EmptyProviderOrder,

    #[error("provider '{0}' appears more than once in provider_order")]
    DuplicateProvider(String),

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("{field} must be at least 1")]
    ZeroBudget { field: String },

    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("backoff_cap ({cap:?}) is shorter than backoff_base ({base:?})")]
    BackoffCapBelowBase { base: Duration, cap: Duration },

    #[error("Invalid value for {key}: {reason}")]
    InvalidOverride { key: &'static str, reason: String },
}

/// Configuration for one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Provider type names, highest priority first
    pub provider_order: Vec<String>,

    /// Attempts each provider gets per pool call
    pub retry_budget_per_provider: u32,

    /// Per-provider budget overrides, keyed by provider name
    pub retry_budget_overrides: BTreeMap<String, u32>,

    /// Solver retries allowed after the first attempt
    pub max_solve_retries: u32,

    /// Deadline for a whole request
    #[serde(with = "humantime_duration")]
    pub request_timeout: Duration,

    /// Router confidence below which the classification is treated as `Other`
    pub low_confidence_threshold: f64,

    /// First retry delay within one provider
    #[serde(with = "humantime_duration")]
    pub backoff_base: Duration,

    /// Upper bound for any retry delay, including server `retry-after` hints
    #[serde(with = "humantime_duration")]
    pub backoff_cap: Duration,

    /// Verifier confidence required for acceptance
    pub min_verifier_confidence: f64,

    /// Re-invoke a stage once with a reformat hint after unparseable output
    pub reformat_retry: bool,

    /// Solutions kept in the per-request history
    pub history_limit: usize,

    /// Deadline for a single math tool evaluation
    #[serde(with = "humantime_duration")]
    pub tool_timeout: Duration,

    /// Defaults for every completion request
    pub completion: CompletionOptions,

    /// Provider-specific settings passed to the provider factories
    pub providers: BTreeMap<String, JsonValue>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            provider_order: vec!["gemini".to_string(), "groq".to_string()],
            retry_budget_per_provider: 2,
            retry_budget_overrides: BTreeMap::new(),
            max_solve_retries: 3,
            request_timeout: Duration::from_secs(30),
            low_confidence_threshold: 0.5,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(4),
            min_verifier_confidence: 0.85,
            reformat_retry: true,
            history_limit: 8,
            tool_timeout: Duration::from_secs(2),
            completion: CompletionOptions::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Check every invariant the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider_order.is_empty() {
            return Err(ConfigError::EmptyProviderOrder);
        }
        for (i, name) in self.provider_order.iter().enumerate() {
            if self.provider_order[..i].contains(name) {
                return Err(ConfigError::DuplicateProvider(name.clone()));
            }
        }

        if self.retry_budget_per_provider == 0 {
            return Err(ConfigError::ZeroBudget {
                field: "retry_budget_per_provider".to_string(),
            });
        }
        if let Some((name, _)) = self.retry_budget_overrides.iter().find(|(_, b)| **b == 0) {
            return Err(ConfigError::ZeroBudget {
                field: format!("retry_budget_overrides.{}", name),
            });
        }

        for (field, value) in [
            ("low_confidence_threshold", self.low_confidence_threshold),
            ("min_verifier_confidence", self.min_verifier_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }

        for (field, value) in [
            ("request_timeout", self.request_timeout),
            ("backoff_cap", self.backoff_cap),
            ("tool_timeout", self.tool_timeout),
            ("completion.timeout", self.completion.timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(field));
            }
        }
        if self.backoff_cap < self.backoff_base {
            return Err(ConfigError::BackoffCapBelowBase {
                base: self.backoff_base,
                cap: self.backoff_cap,
            });
        }

        Ok(())
    }

    /// Retry budget for one provider, honouring overrides.
    pub fn budget_for(&self, provider: &str) -> u32 {
        self.retry_budget_overrides
            .get(provider)
            .copied()
            .unwrap_or(self.retry_budget_per_provider)
    }

    /// Settings blob for one provider (`null` when absent).
    pub fn provider_settings(&self, provider: &str) -> &JsonValue {
        static NULL: JsonValue = JsonValue::Null;
        self.providers.get(provider).unwrap_or(&NULL)
    }

    /// Apply `MATHPIPE_*` overrides read through `lookup`.
    ///
    /// `lookup` is usually `|k| std::env::var(k).ok()`; tests pass a map.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(order) = lookup(ENV_PROVIDER_ORDER) {
            self.provider_order = order
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(retries) = lookup(ENV_MAX_SOLVE_RETRIES) {
            self.max_solve_retries =
                retries
                    .trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ConfigError::InvalidOverride {
                        key: ENV_MAX_SOLVE_RETRIES,
                        reason: e.to_string(),
                    })?;
        }

        if let Some(timeout) = lookup(ENV_REQUEST_TIMEOUT) {
            self.request_timeout = humantime::parse_duration(timeout.trim()).map_err(|e| {
                ConfigError::InvalidOverride {
                    key: ENV_REQUEST_TIMEOUT,
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(())
    }
}

/// Serde adapter for humantime durations (`"30s"`, `"1m 30s"`).
pub mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
