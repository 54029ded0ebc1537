//! Provider registry: maps model ids (via the catalog) to the adapter
//! for their wire-format family.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use hearth_domain::catalog::{ModelCatalog, ModelDescriptor};
use hearth_domain::config::LlmConfig;
use hearth_domain::error::{Error, Result};
use hearth_domain::secret::SecretStore;

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAiProvider;
use crate::traits::LlmProvider;

pub struct ProviderRegistry {
    catalog: RwLock<ModelCatalog>,
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    /// Build adapters for each configured endpoint family, resolving
    /// API keys through the secret store.
    pub fn from_config(
        catalog: ModelCatalog,
        config: &LlmConfig,
        secrets: &dyn SecretStore,
    ) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();

        for (family, endpoint) in &config.endpoints {
            let api_key = match &endpoint.api_key_ref {
                Some(reference) => {
                    let bytes = secrets.get(reference)?;
                    String::from_utf8(bytes)
                        .map_err(|_| Error::Auth(format!("secret {reference} is not UTF-8")))?
                }
                None => String::new(),
            };

            let provider: Arc<dyn LlmProvider> = match family.as_str() {
                "openai" => Arc::new(OpenAiProvider::new(&endpoint.base_url, api_key)?),
                "anthropic" => Arc::new(AnthropicProvider::new(&endpoint.base_url, api_key)?),
                other => {
                    return Err(Error::Config(format!(
                        "unknown provider family '{other}' (expected openai or anthropic)"
                    )))
                }
            };
            providers.insert(family.clone(), provider);
        }

        Ok(Self {
            catalog: RwLock::new(catalog),
            providers,
        })
    }

    /// Build a registry from pre-constructed adapters (tests, embedding).
    pub fn with_providers(
        catalog: ModelCatalog,
        providers: HashMap<String, Arc<dyn LlmProvider>>,
    ) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            providers,
        }
    }

    /// Resolve a model id to its adapter and catalog descriptor.
    pub fn resolve(&self, model_id: &str) -> Result<(Arc<dyn LlmProvider>, ModelDescriptor)> {
        let descriptor = self
            .catalog
            .read()
            .get(model_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("model {model_id} not in catalog")))?;
        let provider = self
            .providers
            .get(&descriptor.provider)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!(
                    "no endpoint configured for provider family '{}'",
                    descriptor.provider
                ))
            })?;
        Ok((provider, descriptor))
    }

    pub fn descriptor(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.catalog.read().get(model_id).cloned()
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.catalog.read().models.iter().map(|m| m.id.clone()).collect()
    }

    /// Swap in a refreshed catalog (TTL refresh).
    pub fn replace_catalog(&self, catalog: ModelCatalog) {
        *self.catalog.write() = catalog;
    }

    pub fn family_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_domain::catalog::ModelDescriptor;
    use hearth_domain::secret::MemorySecretStore;

    fn catalog() -> ModelCatalog {
        ModelCatalog {
            models: vec![ModelDescriptor {
                id: "m1".into(),
                provider: "openai".into(),
                context_length: 4000,
                tokenizer: "cl100k".into(),
                max_completion_tokens: 1000,
                max_tools_per_request: 128,
                max_parallel_tool_calls: 4,
                max_images_per_request: 20,
                pricing_input_per_million: 1.0,
                pricing_output_per_million: 2.0,
                supports_streaming: true,
                supports_tools: true,
                supports_caching: false,
                provider_overrides: Default::default(),
            }],
        }
    }

    #[test]
    fn resolves_model_through_family() {
        let secrets = MemorySecretStore::default();
        use hearth_domain::secret::SecretStore as _;
        secrets.put("hearth/openai", b"sk-test").unwrap();

        let mut config = LlmConfig::default();
        config.endpoints.insert(
            "openai".into(),
            hearth_domain::config::LlmEndpointConfig {
                base_url: "https://api.openai.test/v1".into(),
                api_key_ref: Some("hearth/openai".into()),
            },
        );

        let registry = ProviderRegistry::from_config(catalog(), &config, &secrets).unwrap();
        let (provider, descriptor) = registry.resolve("m1").unwrap();
        assert_eq!(provider.family(), "openai");
        assert_eq!(descriptor.context_length, 4000);

        assert!(registry.resolve("missing").is_err());
    }

    #[test]
    fn missing_family_endpoint_is_config_error() {
        let registry = ProviderRegistry::with_providers(catalog(), HashMap::new());
        let err = registry.resolve("m1").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
