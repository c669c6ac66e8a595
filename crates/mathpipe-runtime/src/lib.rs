//! # mathpipe-runtime
//!
//! Async runtime for the mathpipe solving pipeline.
//!
//! A problem travels Router → Solver → Verifier → Explainer. Every model call
//! goes through a [`ProviderPool`] that retries locally per provider and then
//! falls back to the next provider in priority order. The verifier may send a
//! solution back to the solver with structured feedback, up to
//! `max_solve_retries` times.
//!
//! Deterministic pieces (data model, completion parsing, the arithmetic
//! evaluator) live in `mathpipe-core`; this crate adds the I/O.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mathpipe_core::Problem;
//! use mathpipe_runtime::{Orchestrator, PipelineConfig};
//!
//! let orchestrator = Orchestrator::builder()
//!     .config(PipelineConfig::default())
//!     .build()?;
//!
//! let result = orchestrator.handle(Problem::new("Solve x^2 - 5x + 6 = 0")).await;
//! if let Some(solution) = result.solution() {
//!     println!("{}", solution.final_answer);
//! }
//! ```

use thiserror::Error;

pub mod config;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod resilience;
pub mod stages;
pub mod tools;

pub use config::{ConfigError, PipelineConfig};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use providers::{
    ApiCredential, CompletionOptions, CredentialSource, GeminiProvider, GroqProvider,
    ProviderClient, ProviderError, ProviderFactory, ProviderRegistry,
};
pub use resilience::{BackoffPolicy, PoolExhausted, PoolSuccess, ProviderPool};
pub use stages::{Stage, StageContext, StageError, StageRun};
pub use tools::{ArithmeticTool, MathTool, ToolError};

/// Errors from building or configuring the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Provider pool is empty")]
    EmptyPool,
}
