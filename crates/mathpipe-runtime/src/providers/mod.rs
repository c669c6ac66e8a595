//! Model provider abstractions for mathpipe-runtime.
//!
//! A [`ProviderClient`] wraps one LLM backend behind a single
//! `complete(prompt, options)` call. Clients never retry internally; retry
//! and fallback belong to [`crate::resilience::ProviderPool`].
//!
//! The HTTP providers are always registered; their network code is behind
//! the `gemini` and `groq` cargo features. Without the feature a provider
//! reports [`ProviderError::NotConfigured`] and the pool skips it.
//!
//! ## Security
//!
//! All providers use the [`secrets`] module for credential handling.
//! See [`ApiCredential`] for the recommended patterns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use mathpipe_core::ProviderErrorKind;

mod factory;
mod gemini;
mod groq;
pub mod secrets;

#[cfg(test)]
pub(crate) mod mock;

pub use factory::{ProviderFactory, ProviderRegistry};
pub use gemini::{GeminiProvider, GeminiProviderFactory, GEMINI_API_KEY_ENV};
pub use groq::{GroqProvider, GroqProviderFactory, GROQ_API_KEY_ENV};
pub use secrets::{ApiCredential, CredentialSource};

/// Errors from model providers.
///
/// Every variant maps onto one [`ProviderErrorKind`], which is all the pool
/// looks at when deciding whether to retry.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Provider unavailable: {message}")]
    Unavailable { status: Option<u16>, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// The failure class used by the retry policy.
    ///
    /// A provider that is not configured can never succeed, so it is
    /// treated like a credential failure.
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::RateLimited { .. } => ProviderErrorKind::RateLimited,
            ProviderError::Timeout(_) => ProviderErrorKind::Timeout,
            ProviderError::AuthFailed(_) | ProviderError::NotConfigured(_) => {
                ProviderErrorKind::AuthFailed
            }
            ProviderError::Unavailable { .. } => ProviderErrorKind::Unavailable,
            ProviderError::MalformedResponse(_) => ProviderErrorKind::MalformedResponse,
        }
    }

    /// Server-provided retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map an HTTP status to an error. Only meaningful for non-success codes.
    pub fn from_status(status: u16, retry_after: Option<Duration>, message: String) -> Self {
        match status {
            429 => ProviderError::RateLimited { retry_after },
            401 | 403 => ProviderError::AuthFailed(message),
            _ => ProviderError::Unavailable {
                status: Some(status),
                message,
            },
        }
    }
}

/// Options for a single completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionOptions {
    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Per-call timeout
    #[serde(with = "crate::config::humantime_duration")]
    pub timeout: Duration,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.2,
            timeout: Duration::from_secs(15),
        }
    }
}

/// Uniform capability wrapping one LLM backend.
///
/// Implementations must not panic on remote failures and must not retry;
/// every failure is reported as a [`ProviderError`].
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Execute a single completion.
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError>;

    /// Check if the provider is usable (credentials present, endpoint sane).
    async fn health_check(&self) -> bool;

    /// Provider name used in logs and attempt records.
    fn name(&self) -> &str;
}

/// Parse a `retry-after` header value given in whole seconds.
#[cfg_attr(not(any(feature = "gemini", feature = "groq")), allow(dead_code))]
pub(crate) fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
