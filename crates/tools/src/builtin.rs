//! In-process builtin tools.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hearth_domain::error::{Error, Result};
use hearth_domain::tool::{ToolCapability, ToolDefinition};

use crate::{ToolOutput, ToolProvider};

type Handler = Arc<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send>>
        + Send
        + Sync,
>;

struct BuiltinTool {
    definition: ToolDefinition,
    handler: Handler,
}

/// A provider backed by in-process functions.
pub struct BuiltinProvider {
    name: String,
    tools: HashMap<String, BuiltinTool>,
}

impl BuiltinProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: HashMap::new(),
        }
    }

    pub fn register<F, Fut>(&mut self, definition: ToolDefinition, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| Box::pin(handler(args)));
        self.tools.insert(
            definition.name.clone(),
            BuiltinTool {
                definition,
                handler,
            },
        );
    }

    /// The builtin set shipped with the runtime.
    pub fn standard() -> Self {
        let mut provider = Self::new("builtin");
        provider.register(
            ToolDefinition {
                name: "time.now".into(),
                description: "Current UTC time in RFC 3339 form.".into(),
                parameters: serde_json::json!({ "type": "object", "properties": {} }),
                capability: ToolCapability::ReadOnly,
                critical: false,
            },
            |_args| async {
                Ok(ToolOutput::ok(
                    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                ))
            },
        );
        provider
    }
}

#[async_trait::async_trait]
impl ToolProvider for BuiltinProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        Ok(self.tools.values().map(|t| t.definition.clone()).collect())
    }

    async fn call(&self, tool: &str, arguments: &serde_json::Value) -> Result<ToolOutput> {
        let entry = self.tools.get(tool).ok_or_else(|| Error::NotFound(format!("tool {tool}")))?;
        (entry.handler)(arguments.clone()).await
    }
}
