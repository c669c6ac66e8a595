//! Ordered provider pool with local retry and global fallback.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use mathpipe_core::ProviderAttempt;

use super::policy::{BackoffPolicy, Cursor, Transition};
use crate::config::{ConfigError, PipelineConfig};
use crate::providers::{CompletionOptions, ProviderClient, ProviderError, ProviderRegistry};

/// Every provider in the pool exhausted its budget.
#[derive(Error, Debug, Clone)]
#[error("All providers exhausted after {} attempts (last error: {})", .attempts.len(), .last_error)]
pub struct PoolExhausted {
    /// Every attempt made, in order
    pub attempts: Vec<ProviderAttempt>,
    pub last_error: String,
}

/// A completion served by the pool.
#[derive(Debug, Clone)]
pub struct PoolSuccess {
    pub text: String,
    /// Provider that produced `text`
    pub provider: String,
    /// Every attempt made, the successful one last
    pub attempts: Vec<ProviderAttempt>,
}

#[derive(Clone)]
struct PoolEntry {
    client: Arc<dyn ProviderClient>,
    budget: u32,
    failures: Arc<AtomicU64>,
}

/// Providers in priority order, each with its own retry budget.
///
/// Cloning shares the clients and the failure counters.
#[derive(Clone)]
pub struct ProviderPool {
    entries: Vec<PoolEntry>,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for ProviderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderPool")
            .field("providers", &self.provider_names())
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl ProviderPool {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            entries: Vec::new(),
            backoff,
        }
    }

    /// Append a provider at the lowest priority.
    pub fn with_provider(mut self, client: Arc<dyn ProviderClient>, budget: u32) -> Self {
        self.entries.push(PoolEntry {
            client,
            budget: budget.max(1),
            failures: Arc::new(AtomicU64::new(0)),
        });
        self
    }

    /// Build the pool named by `config.provider_order`.
    ///
    /// A provider whose factory rejects its settings (typically a missing
    /// API key) stays in the pool as an unconfigured entry: it fails every
    /// call as an auth failure, so it costs one attempt and shows up in the
    /// attempt trail.
    pub fn from_config(
        config: &PipelineConfig,
        registry: &ProviderRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut pool = Self::new(BackoffPolicy::new(config.backoff_base, config.backoff_cap));
        for name in &config.provider_order {
            if !registry.has_provider(name) {
                return Err(ConfigError::UnknownProvider(name.clone()));
            }

            let client: Arc<dyn ProviderClient> =
                match registry.create(name, config.provider_settings(name)) {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::warn!(provider = %name, error = %e, "Provider unavailable, keeping it as unconfigured");
                        Arc::new(Unconfigured {
                            name: name.clone(),
                            reason: e.to_string(),
                        })
                    }
                };
            pool = pool.with_provider(client, config.budget_for(name));
        }

        Ok(pool)
    }

    /// A view of this pool ordered and budgeted by `config`.
    ///
    /// Every provider in `config.provider_order` must already be in the
    /// pool. Clients and failure counters are shared with `self`.
    pub fn reconfigured(&self, config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let entries = config
            .provider_order
            .iter()
            .map(|name| {
                self.entries
                    .iter()
                    .find(|e| e.client.name() == name)
                    .map(|e| PoolEntry {
                        budget: config.budget_for(name),
                        ..e.clone()
                    })
                    .ok_or_else(|| ConfigError::UnknownProvider(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            entries,
            backoff: BackoffPolicy::new(config.backoff_base, config.backoff_cap),
        })
    }

    /// Get a completion from the first provider that can serve it.
    pub async fn call(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<PoolSuccess, PoolExhausted> {
        self.call_traced(prompt, options, None).await
    }

    /// Like [`call`](Self::call), also pushing every attempt onto `trail`
    /// as soon as it completes, so a caller that cancels the call still
    /// sees the attempts made so far.
    pub async fn call_traced(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        trail: Option<&Mutex<Vec<ProviderAttempt>>>,
    ) -> Result<PoolSuccess, PoolExhausted> {
        let mut attempts = Vec::new();
        let record = |attempts: &mut Vec<ProviderAttempt>, attempt: ProviderAttempt| {
            if let Some(trail) = trail {
                trail.lock().push(attempt.clone());
            }
            attempts.push(attempt);
        };
        if self.entries.is_empty() {
            return Err(PoolExhausted {
                attempts,
                last_error: "no providers configured".to_string(),
            });
        }

        let mut cursor = Cursor::start();
        let mut delays = self.backoff.delays(self.entries[0].budget);

        loop {
            let entry = &self.entries[cursor.provider];
            let name = entry.client.name().to_string();

            let started = Instant::now();
            let result = match tokio::time::timeout(
                options.timeout,
                entry.client.complete(prompt, options),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(options.timeout)),
            };
            let latency = started.elapsed();

            let error = match result {
                Ok(text) => {
                    record(
                        &mut attempts,
                        ProviderAttempt {
                            provider: name.clone(),
                            attempt: cursor.attempt,
                            latency,
                            error: None,
                        },
                    );
                    tracing::debug!(provider = %name, attempt = cursor.attempt, latency = ?latency, "Provider call succeeded");
                    return Ok(PoolSuccess {
                        text,
                        provider: name,
                        attempts,
                    });
                }
                Err(e) => e,
            };

            let kind = error.kind();
            entry.failures.fetch_add(1, Ordering::Relaxed);
            record(
                &mut attempts,
                ProviderAttempt {
                    provider: name.clone(),
                    attempt: cursor.attempt,
                    latency,
                    error: Some(kind),
                },
            );

            match cursor.after_failure(kind, entry.budget, self.entries.len()) {
                Transition::Retry(next) => {
                    let delay = self.backoff.next_delay(&mut delays, error.retry_after());
                    tracing::warn!(provider = %name, attempt = cursor.attempt, error = %error, delay = ?delay, "Provider call failed, retrying");
                    tokio::time::sleep(delay).await;
                    cursor = next;
                }
                Transition::Advance(next) => {
                    tracing::warn!(provider = %name, attempt = cursor.attempt, error = %error, "Provider exhausted, falling back to next provider");
                    delays = self.backoff.delays(self.entries[next.provider].budget);
                    cursor = next;
                }
                Transition::Exhausted => {
                    tracing::warn!(provider = %name, attempts = attempts.len(), error = %error, "All providers exhausted");
                    return Err(PoolExhausted {
                        attempts,
                        last_error: error.to_string(),
                    });
                }
            }
        }
    }

    /// Provider names in priority order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.client.name()).collect()
    }

    /// Cumulative failed attempts per provider since construction.
    pub fn failure_counts(&self) -> BTreeMap<String, u64> {
        self.entries
            .iter()
            .map(|e| {
                (
                    e.client.name().to_string(),
                    e.failures.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    /// Run every provider's health check concurrently.
    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let checks = self.entries.iter().map(|e| async move {
            (e.client.name().to_string(), e.client.health_check().await)
        });
        join_all(checks).await
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Stand-in for a provider whose configuration could not be loaded.
struct Unconfigured {
    name: String,
    reason: String,
}

#[async_trait]
impl ProviderClient for Unconfigured {
    async fn complete(
        &self,
        _prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::NotConfigured(self.reason.clone()))
    }

    async fn health_check(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::{ScriptedProvider, StalledProvider};
    use mathpipe_core::ProviderErrorKind;
    use std::time::Duration;

    fn timeout() -> ProviderError {
        ProviderError::Timeout(Duration::from_secs(1))
    }

    fn pool_of(providers: Vec<(Arc<ScriptedProvider>, u32)>) -> ProviderPool {
        providers
            .into_iter()
            .fold(ProviderPool::new(BackoffPolicy::default()), |pool, (p, budget)| {
                pool.with_provider(p, budget)
            })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_short_circuits() {
        let a = Arc::new(ScriptedProvider::ok("a", "from a"));
        let b = Arc::new(ScriptedProvider::ok("b", "from b"));
        let pool = pool_of(vec![(a.clone(), 2), (b.clone(), 2)]);

        let served = pool.call("prompt", &CompletionOptions::default()).await.unwrap();
        assert_eq!(served.text, "from a");
        assert_eq!(served.provider, "a");
        assert_eq!(served.attempts.len(), 1);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_after_budget() {
        let a = Arc::new(ScriptedProvider::failing("a", timeout()));
        let b = Arc::new(ScriptedProvider::ok("b", "from b"));
        let pool = pool_of(vec![(a.clone(), 3), (b.clone(), 2)]);

        let served = pool.call("prompt", &CompletionOptions::default()).await.unwrap();
        assert_eq!(served.text, "from b");
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 1);

        let on_a: Vec<u32> = served
            .attempts
            .iter()
            .filter(|t| t.provider == "a")
            .map(|t| t.attempt)
            .collect();
        assert_eq!(on_a, vec![1, 2, 3]);
        assert!(served.attempts.last().unwrap().succeeded());
        assert_eq!(pool.failure_counts()["a"], 3);
        assert_eq!(pool.failure_counts()["b"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_attempted_once() {
        let a = Arc::new(ScriptedProvider::failing(
            "a",
            ProviderError::AuthFailed("bad key".into()),
        ));
        let b = Arc::new(ScriptedProvider::ok("b", "ok"));
        let pool = pool_of(vec![(a.clone(), 5), (b.clone(), 2)]);

        pool.call("prompt", &CompletionOptions::default()).await.unwrap();
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_retried_once() {
        let a = Arc::new(ScriptedProvider::failing(
            "a",
            ProviderError::MalformedResponse("garbage".into()),
        ));
        let b = Arc::new(ScriptedProvider::ok("b", "ok"));
        let pool = pool_of(vec![(a.clone(), 5), (b.clone(), 2)]);

        pool.call("prompt", &CompletionOptions::default()).await.unwrap();
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget() {
        let a = Arc::new(ScriptedProvider::new(
            "a",
            vec![
                Err(ProviderError::RateLimited {
                    retry_after: Some(Duration::from_secs(1)),
                }),
                Ok("second try".to_string()),
            ],
        ));
        let pool = pool_of(vec![(a.clone(), 2)]);

        let started = Instant::now();
        let served = pool.call("prompt", &CompletionOptions::default()).await.unwrap();
        assert_eq!(served.text, "second try");
        assert_eq!(served.attempts.len(), 2);
        assert_eq!(
            served.attempts[0].error,
            Some(ProviderErrorKind::RateLimited)
        );
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reports_every_attempt() {
        let a = Arc::new(ScriptedProvider::failing("a", timeout()));
        let b = Arc::new(ScriptedProvider::failing("b", timeout()));
        let pool = pool_of(vec![(a.clone(), 2), (b.clone(), 2)]);

        let err = pool
            .call("prompt", &CompletionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.attempts.len(), 4);
        assert!(err
            .attempts
            .iter()
            .all(|t| t.error == Some(ProviderErrorKind::Timeout)));
        assert!(err.to_string().contains("4 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_provider_hits_call_timeout() {
        let b = Arc::new(ScriptedProvider::ok("b", "ok"));
        let pool = ProviderPool::new(BackoffPolicy::default())
            .with_provider(Arc::new(StalledProvider), 1)
            .with_provider(b.clone(), 1);

        let options = CompletionOptions {
            timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let served = pool.call("prompt", &options).await.unwrap();
        assert_eq!(served.provider, "b");
        assert_eq!(served.attempts[0].error, Some(ProviderErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_empty_pool_is_exhausted() {
        let pool = ProviderPool::new(BackoffPolicy::default());
        let err = pool
            .call("prompt", &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(err.attempts.is_empty());
    }

    /// A provider type whose settings never yield a client.
    struct KeylessFactory;

    impl crate::providers::ProviderFactory for KeylessFactory {
        fn provider_type(&self) -> &'static str {
            "keyless"
        }

        fn create(&self, _config: &serde_json::Value) -> Result<Arc<dyn ProviderClient>, ProviderError> {
            Err(ProviderError::NotConfigured("API key required".to_string()))
        }

        fn validate_config(&self, _config: &serde_json::Value) -> Result<(), ProviderError> {
            Err(ProviderError::NotConfigured("API key required".to_string()))
        }
    }

    #[tokio::test]
    async fn test_from_config_keeps_unconfigured_providers() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(KeylessFactory));
        let config = PipelineConfig {
            provider_order: vec!["keyless".to_string()],
            ..Default::default()
        };

        let pool = ProviderPool::from_config(&config, &registry).unwrap();
        assert_eq!(pool.provider_names(), vec!["keyless"]);

        let err = pool
            .call("prompt", &CompletionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.attempts.len(), 1);
        assert_eq!(err.attempts[0].error, Some(ProviderErrorKind::AuthFailed));
        assert!(err.last_error.contains("API key required"));
        assert_eq!(pool.health_check_all().await, vec![("keyless".to_string(), false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trail_survives_cancelled_call() {
        let a = Arc::new(ScriptedProvider::failing(
            "a",
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(4)),
            },
        ));
        let pool = pool_of(vec![(a.clone(), 50)]);
        let trail = Mutex::new(Vec::new());

        let cancelled = tokio::time::timeout(
            Duration::from_secs(10),
            pool.call_traced("prompt", &CompletionOptions::default(), Some(&trail)),
        )
        .await;
        assert!(cancelled.is_err());

        let attempts = trail.into_inner();
        assert_eq!(attempts.len(), a.calls());
        assert_eq!(
            attempts.iter().map(|t| t.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(attempts
            .iter()
            .all(|t| t.error == Some(ProviderErrorKind::RateLimited)));
    }

    #[test]
    fn test_from_config_rejects_unknown_provider() {
        let config = PipelineConfig {
            provider_order: vec!["openai".to_string()],
            ..Default::default()
        };
        let err = ProviderPool::from_config(&config, &ProviderRegistry::with_defaults()).unwrap_err();
        assert_eq!(err, ConfigError::UnknownProvider("openai".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigured_reorders_and_shares_counters() {
        let a = Arc::new(ScriptedProvider::failing("a", timeout()));
        let b = Arc::new(ScriptedProvider::ok("b", "from b"));
        let pool = pool_of(vec![(a.clone(), 2), (b.clone(), 2)]);

        let config = PipelineConfig {
            provider_order: vec!["b".to_string(), "a".to_string()],
            ..Default::default()
        };
        let view = pool.reconfigured(&config).unwrap();
        assert_eq!(view.provider_names(), vec!["b", "a"]);
        assert_eq!(view.call("p", &CompletionOptions::default()).await.unwrap().provider, "b");

        let only_a = PipelineConfig {
            provider_order: vec!["a".to_string()],
            retry_budget_per_provider: 1,
            ..Default::default()
        };
        let view = pool.reconfigured(&only_a).unwrap();
        assert!(view.call("p", &CompletionOptions::default()).await.is_err());
        assert_eq!(a.calls(), 1);
        assert_eq!(pool.failure_counts()["a"], 1);

        let unknown = PipelineConfig {
            provider_order: vec!["c".to_string()],
            ..Default::default()
        };
        assert!(pool.reconfigured(&unknown).is_err());
    }
}
