//! Tool registry: maps tool names to provider descriptors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use hearth_domain::error::Result;
use hearth_domain::tool::ToolDefinition;

use crate::ToolProvider;

/// How long a provider gets to answer `tools/list` at startup.
const LIST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub tool_count: usize,
    pub last_refreshed: DateTime<Utc>,
    pub last_error: Option<String>,
}

struct ToolEntry {
    provider: Arc<dyn ToolProvider>,
    definition: ToolDefinition,
}

#[derive(Default)]
pub struct ToolRegistry {
    providers: Vec<Arc<dyn ToolProvider>>,
    tools: RwLock<HashMap<String, ToolEntry>>,
    health: RwLock<HashMap<String, ProviderHealth>>,
}

impl ToolRegistry {
    pub fn new(providers: Vec<Arc<dyn ToolProvider>>) -> Self {
        Self {
            providers,
            tools: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
        }
    }

    /// Query every provider for its tool list. Failures are recorded in
    /// provider health but never block startup.
    pub async fn refresh_all(&self) {
        for provider in &self.providers {
            self.refresh_provider(provider.clone()).await;
        }
    }

    /// Re-query one provider (startup and reconnect).
    pub async fn refresh_provider(&self, provider: Arc<dyn ToolProvider>) {
        let name = provider.name().to_owned();
        let listed = tokio::time::timeout(LIST_TIMEOUT, provider.list_tools()).await;

        match listed {
            Ok(Ok(definitions)) => {
                let mut tools = self.tools.write();
                tools.retain(|_, entry| entry.provider.name() != name);
                let count = definitions.len();
                for definition in definitions {
                    if tools.contains_key(&definition.name) {
                        tracing::warn!(
                            tool = %definition.name,
                            provider = %name,
                            "tool name already registered by another provider, skipping"
                        );
                        continue;
                    }
                    tools.insert(
                        definition.name.clone(),
                        ToolEntry {
                            provider: provider.clone(),
                            definition,
                        },
                    );
                }
                self.health.write().insert(
                    name.clone(),
                    ProviderHealth {
                        healthy: true,
                        tool_count: count,
                        last_refreshed: Utc::now(),
                        last_error: None,
                    },
                );
                tracing::info!(provider = %name, tools = count, "tool provider refreshed");
            }
            Ok(Err(e)) => self.record_failure(&name, e.to_string()),
            Err(_) => self.record_failure(&name, "tools/list timed out after 5s".into()),
        }
    }

    fn record_failure(&self, name: &str, error: String) {
        tracing::warn!(provider = %name, error = %error, "tool provider listing failed");
        self.health.write().insert(
            name.to_owned(),
            ProviderHealth {
                healthy: false,
                tool_count: 0,
                last_refreshed: Utc::now(),
                last_error: Some(error),
            },
        );
    }

    pub fn lookup(&self, tool_name: &str) -> Option<(Arc<dyn ToolProvider>, ToolDefinition)> {
        let tools = self.tools.read();
        tools
            .get(tool_name)
            .map(|entry| (entry.provider.clone(), entry.definition.clone()))
    }

    /// All known tool definitions (attached to LLM requests).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .read()
            .values()
            .map(|entry| entry.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn provider_health(&self) -> HashMap<String, ProviderHealth> {
        self.health.read().clone()
    }

    pub async fn shutdown(&self) -> Result<()> {
        for provider in &self.providers {
            provider.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BuiltinProvider;
    use crate::ToolOutput;
    use hearth_domain::error::Error;

    struct NeverListsProvider;

    #[async_trait::async_trait]
    impl ToolProvider for NeverListsProvider {
        fn name(&self) -> &str {
            "dead"
        }
        async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
            Err(Error::Timeout("unreachable".into()))
        }
        async fn call(&self, _tool: &str, _args: &serde_json::Value) -> Result<ToolOutput> {
            Err(Error::Timeout("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn refresh_registers_tools_and_health() {
        let registry = ToolRegistry::new(vec![
            Arc::new(BuiltinProvider::standard()),
            Arc::new(NeverListsProvider),
        ]);
        registry.refresh_all().await;

        assert!(registry.lookup("time.now").is_some());
        assert!(registry.lookup("missing").is_none());

        let health = registry.provider_health();
        assert!(health["builtin"].healthy);
        assert!(!health["dead"].healthy);
        assert!(health["dead"].last_error.is_some());
    }

    #[tokio::test]
    async fn definitions_are_sorted_and_stable() {
        let registry = ToolRegistry::new(vec![Arc::new(BuiltinProvider::standard())]);
        registry.refresh_all().await;
        let defs = registry.definitions();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
