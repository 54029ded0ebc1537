//! Provider-agnostic request/response types and the core trait.

use hearth_domain::error::Result;
use hearth_domain::session::{ContentPart, MessageContent, Role};
use hearth_domain::stream::{BoxStream, StreamEvent, Usage};
use hearth_domain::tool::{ToolDefinition, ToolRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One wire-level conversation message. The context manager builds
/// these from the persisted rows; adapters serialize them per family.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }]),
        }
    }
}

/// The abstract request the gateway builds wire requests from.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    /// Requested maximum output tokens (already clamped by the context
    /// manager to the model's limit).
    pub max_output: Option<u64>,
    /// Mark prefix segments (system prompt, tool definitions) with
    /// cache-control hints when the model supports input caching.
    pub cache_control: bool,
}

/// A full (non-streaming) completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolRequest>,
    pub usage: Option<Usage>,
    pub model: String,
    pub finish_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every provider adapter implements. Implementations translate
/// between internal types and the wire format of one provider family.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat request and wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;

    /// Send a chat request and return a stream of events. The stream
    /// yields a bounded sequence of deltas and exactly one terminal
    /// [`StreamEvent::Done`].
    async fn chat_stream(&self, req: &ChatRequest)
        -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// Wire-format family identifier (`"openai"`, `"anthropic"`).
    fn family(&self) -> &str;
}
