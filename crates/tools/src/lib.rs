//! Tool registry and dispatcher.
//!
//! Providers come in three shapes: in-process builtins, stdio children
//! speaking a line-delimited JSON protocol, and HTTP remotes. The
//! dispatcher routes approved tool calls, enforces per-provider
//! concurrency and per-tool timeouts, and emits execution heartbeats.

pub mod builtin;
pub mod dispatch;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod stdio;

pub use dispatch::Dispatcher;
pub use registry::ToolRegistry;

use hearth_domain::error::Result;
use hearth_domain::tool::ToolDefinition;

/// Terminal output of one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A tool-providing endpoint: one of the three provider shapes.
#[async_trait::async_trait]
pub trait ToolProvider: Send + Sync {
    /// Stable provider name (from config).
    fn name(&self) -> &str;

    /// Advertise the provider's tools. Queried at startup (5 s budget)
    /// and again on reconnect.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    /// Execute one tool call to terminal output.
    async fn call(&self, tool: &str, arguments: &serde_json::Value) -> Result<ToolOutput>;

    /// Graceful shutdown (children get SIGTERM, then SIGKILL).
    async fn shutdown(&self) {}
}
