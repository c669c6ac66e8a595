//! Scripted providers for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{CompletionOptions, ProviderClient, ProviderError};

/// Replays a fixed script of responses; the last entry repeats once the
/// script runs out.
pub(crate) struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    last: Mutex<Option<Result<String, ProviderError>>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub(crate) fn new(name: &str, script: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn ok(name: &str, text: &str) -> Self {
        Self::new(name, vec![Ok(text.to_string())])
    }

    pub(crate) fn failing(name: &str, error: ProviderError) -> Self {
        Self::new(name, vec![Err(error)])
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn complete(
        &self,
        _prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        match next {
            Some(response) => {
                *self.last.lock() = Some(response.clone());
                response
            }
            None => self
                .last
                .lock()
                .clone()
                .unwrap_or(Err(ProviderError::Unavailable {
                    status: None,
                    message: "script empty".to_string(),
                })),
        }
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Answers by stage, keyed on the task line each prompt starts with.
pub(crate) struct StageProvider {
    name: String,
    respond: Box<dyn Fn(&str) -> Result<String, ProviderError> + Send + Sync>,
    calls: AtomicUsize,
}

impl StageProvider {
    pub(crate) fn new(
        name: &str,
        respond: impl Fn(&str) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for StageProvider {
    async fn complete(
        &self,
        prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(prompt)
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Never answers within any sane timeout.
pub(crate) struct StalledProvider;

#[async_trait]
impl ProviderClient for StalledProvider {
    async fn complete(
        &self,
        _prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(ProviderError::Timeout(Duration::from_secs(3600)))
    }

    async fn health_check(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "stalled"
    }
}
