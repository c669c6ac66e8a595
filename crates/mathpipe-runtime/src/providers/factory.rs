//! Provider factories and the registry that resolves provider names.
//!
//! `provider_order` in the configuration names provider *types*; the
//! registry turns each name plus its `providers.<name>` JSON blob into a
//! client.
//!
//! ```ignore
//! let registry = ProviderRegistry::with_defaults();
//! let groq = registry.create("groq", &serde_json::json!({"model": "llama-3.3-70b-versatile"}))?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{ProviderClient, ProviderError};

/// Factory for creating providers from configuration.
pub trait ProviderFactory: Send + Sync {
    /// Unique identifier for this provider type, e.g. `"groq"`.
    fn provider_type(&self) -> &'static str;

    /// Create a provider instance from JSON configuration.
    fn create(&self, config: &JsonValue) -> Result<Arc<dyn ProviderClient>, ProviderError>;

    /// Validate configuration without creating a provider.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError>;

    /// Defaults for optional fields.
    fn default_config(&self) -> JsonValue {
        serde_json::json!({})
    }

    fn description(&self) -> &'static str {
        "Model provider"
    }
}

/// Registry of available provider factories, keyed by type name.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider factory, replacing any factory of the same type.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    /// Create a provider from type name and configuration.
    ///
    /// Fields missing from `config` are filled from the factory's defaults.
    pub fn create(
        &self,
        provider_type: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        let factory = self.factory(provider_type)?;
        factory.create(&merge_defaults(factory.default_config(), config))
    }

    /// Validate configuration for a provider type.
    pub fn validate(&self, provider_type: &str, config: &JsonValue) -> Result<(), ProviderError> {
        let factory = self.factory(provider_type)?;
        factory.validate_config(&merge_defaults(factory.default_config(), config))
    }

    /// List available provider types.
    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_provider(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }

    /// Type names with their descriptions, in name order.
    pub fn describe(&self) -> Vec<(&str, &'static str)> {
        self.factories
            .iter()
            .map(|(name, factory)| (name.as_str(), factory.description()))
            .collect()
    }

    fn factory(&self, provider_type: &str) -> Result<&Arc<dyn ProviderFactory>, ProviderError> {
        self.factories.get(provider_type).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "Unknown provider type: '{}'. Available: {:?}",
                provider_type,
                self.available_types()
            ))
        })
    }

    /// Create a registry with the built-in providers registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::GeminiProviderFactory));
        registry.register(Arc::new(super::GroqProviderFactory));
        registry
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.available_types())
            .finish()
    }
}

/// Overlay `config` onto `defaults`; non-object configs are taken as-is.
fn merge_defaults(defaults: JsonValue, config: &JsonValue) -> JsonValue {
    match (defaults, config) {
        (JsonValue::Object(mut merged), JsonValue::Object(overrides)) => {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
            JsonValue::Object(merged)
        }
        (defaults, JsonValue::Null) => defaults,
        (_, config) => config.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::ScriptedProvider;

    struct MockProviderFactory;

    impl ProviderFactory for MockProviderFactory {
        fn provider_type(&self) -> &'static str {
            "mock"
        }

        fn create(&self, config: &JsonValue) -> Result<Arc<dyn ProviderClient>, ProviderError> {
            let name = config["name"].as_str().unwrap_or("mock-provider");
            let reply = config["reply"].as_str().unwrap_or("{}");
            Ok(Arc::new(ScriptedProvider::ok(name, reply)))
        }

        fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
            if config["reply"].is_string() {
                Ok(())
            } else {
                Err(ProviderError::NotConfigured("reply required".to_string()))
            }
        }

        fn default_config(&self) -> JsonValue {
            serde_json::json!({ "reply": "default" })
        }

        fn description(&self) -> &'static str {
            "Mock provider for testing"
        }
    }

    #[test]
    fn test_registry_register_and_create() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProviderFactory));

        assert!(registry.has_provider("mock"));
        assert!(!registry.has_provider("unknown"));

        let provider = registry
            .create("mock", &serde_json::json!({"name": "test-mock"}))
            .unwrap();
        assert_eq!(provider.name(), "test-mock");
    }

    #[test]
    fn test_registry_unknown_provider() {
        let registry = ProviderRegistry::new();

        match registry.create("unknown", &serde_json::json!({})) {
            Err(ProviderError::NotConfigured(msg)) => {
                assert!(msg.contains("Unknown provider type"));
            }
            _ => panic!("Expected NotConfigured error"),
        }
    }

    #[test]
    fn test_validate_uses_defaults() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProviderFactory));

        assert!(registry.validate("mock", &JsonValue::Null).is_ok());
        assert!(registry
            .validate("mock", &serde_json::json!({"reply": 3}))
            .is_err());
    }

    #[test]
    fn test_defaults_registers_builtin_providers() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(registry.available_types(), vec!["gemini", "groq"]);
        assert_eq!(registry.describe().len(), 2);
    }
}
