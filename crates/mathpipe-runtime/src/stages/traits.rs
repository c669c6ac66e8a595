//! Stage trait and common types.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use mathpipe_core::{ParseError, ProviderAttempt, StageKind};

use crate::config::PipelineConfig;
use crate::prompts::REFORMAT_HINT;
use crate::providers::CompletionOptions;
use crate::resilience::{PoolExhausted, ProviderPool};

/// Errors from a stage invocation.
#[derive(Error, Debug, Clone)]
pub enum StageError {
    #[error("{stage} output unparseable ({provider}): {reason}")]
    Unparseable {
        stage: StageKind,
        reason: ParseError,
        /// Provider whose completion could not be parsed
        provider: String,
        attempts: Vec<ProviderAttempt>,
    },

    #[error("{stage} could not reach any provider: {source}")]
    PoolExhausted {
        stage: StageKind,
        source: PoolExhausted,
    },
}

impl StageError {
    pub fn stage(&self) -> StageKind {
        match self {
            StageError::Unparseable { stage, .. } | StageError::PoolExhausted { stage, .. } => {
                *stage
            }
        }
    }

    /// Stable label recorded in the attempt log.
    pub fn kind_label(&self) -> &'static str {
        match self {
            StageError::Unparseable { .. } => "unparseable",
            StageError::PoolExhausted { .. } => "pool_exhausted",
        }
    }

    pub fn provider_used(&self) -> Option<&str> {
        match self {
            StageError::Unparseable { provider, .. } => Some(provider),
            StageError::PoolExhausted { .. } => None,
        }
    }

    pub fn provider_attempts(&self) -> &[ProviderAttempt] {
        match self {
            StageError::Unparseable { attempts, .. } => attempts,
            StageError::PoolExhausted { source, .. } => &source.attempts,
        }
    }

    pub fn is_unparseable(&self) -> bool {
        matches!(self, StageError::Unparseable { .. })
    }
}

/// Provider attempts of an invocation, readable even if it is cancelled.
pub type ProviderTrail = Mutex<Vec<ProviderAttempt>>;

/// Everything a stage may use besides its input.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub pool: &'a ProviderPool,
    pub config: &'a PipelineConfig,
    /// Ask for strict JSON again after an unparseable completion
    pub reformat: bool,
    /// Receives each provider attempt as it completes
    pub trail: Option<&'a ProviderTrail>,
}

/// Output of one stage invocation plus the provider trail behind it.
#[derive(Debug, Clone)]
pub struct StageRun<T> {
    pub output: T,
    /// `None` when no provider was called
    pub provider_used: Option<String>,
    pub provider_attempts: Vec<ProviderAttempt>,
}

impl<T> StageRun<T> {
    /// An output produced without calling any provider.
    pub fn local(output: T) -> Self {
        Self {
            output,
            provider_used: None,
            provider_attempts: Vec::new(),
        }
    }
}

/// One step of the pipeline.
///
/// Stages hold no per-request state; one instance serves concurrent
/// requests.
#[async_trait]
pub trait Stage: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    fn kind(&self) -> StageKind;

    /// Short description of the input for the attempt log.
    fn input_ref(&self, input: &Self::Input) -> String;

    /// Short description of the output for the attempt log.
    fn output_ref(&self, output: &Self::Output) -> String;

    async fn run(
        &self,
        input: &Self::Input,
        ctx: &StageContext<'_>,
    ) -> Result<StageRun<Self::Output>, StageError>;
}

/// Send `prompt` through the pool and decode the completion with `parse`.
pub(crate) async fn complete_and_parse<T, F>(
    stage: StageKind,
    mut prompt: String,
    options: &CompletionOptions,
    ctx: &StageContext<'_>,
    parse: F,
) -> Result<StageRun<T>, StageError>
where
    F: FnOnce(&str) -> Result<T, ParseError>,
{
    if ctx.reformat {
        prompt.push_str(REFORMAT_HINT);
    }

    let served = ctx
        .pool
        .call_traced(&prompt, options, ctx.trail)
        .await
        .map_err(|source| StageError::PoolExhausted { stage, source })?;

    match parse(&served.text) {
        Ok(output) => Ok(StageRun {
            output,
            provider_used: Some(served.provider),
            provider_attempts: served.attempts,
        }),
        Err(reason) => {
            tracing::warn!(stage = ?stage, provider = %served.provider, error = %reason, "Stage output unparseable");
            Err(StageError::Unparseable {
                stage,
                reason,
                provider: served.provider,
                attempts: served.attempts,
            })
        }
    }
}
