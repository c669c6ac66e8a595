//! Resilience patterns for mathpipe-runtime.
//!
//! This module provides:
//! - The table-driven fallback policy over (provider, attempt)
//! - Exponential backoff between retries on one provider
//! - The provider pool that applies both

mod policy;
mod pool;

pub use policy::{attempt_limit, failure_action, BackoffPolicy, Cursor, FailureAction, Transition};
pub use pool::{PoolExhausted, PoolSuccess, ProviderPool};
