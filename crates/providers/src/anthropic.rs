//! Anthropic Messages API adapter.
//!
//! The system prompt travels in a dedicated field, tool results are
//! user-role content blocks, and streaming uses typed SSE events
//! (`content_block_start` / `content_block_delta` / `message_delta`).

use serde_json::Value;

use hearth_domain::error::{Error, Result};
use hearth_domain::session::{ContentPart, MessageContent, Role};
use hearth_domain::stream::{BoxStream, StreamEvent, Usage};
use hearth_domain::tool::{ToolDefinition, ToolRequest};

use crate::traits::{ChatMessage, ChatRequest, ChatResponse, LlmProvider};
use crate::{from_reqwest, parse_retry_after, status_error};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_OUTPUT: u64 = 4096;

pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn authed_post(&self) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System | Role::Summary => {
                    system_parts.push(msg.content.extract_all_text());
                }
                Role::User => messages.push(serde_json::json!({
                    "role": "user",
                    "content": content_to_blocks(&msg.content),
                })),
                Role::Assistant => messages.push(serde_json::json!({
                    "role": "assistant",
                    "content": content_to_blocks(&msg.content),
                })),
                // Tool results are user-role blocks on this wire format.
                Role::Tool => messages.push(serde_json::json!({
                    "role": "user",
                    "content": content_to_blocks(&msg.content),
                })),
            }
        }

        let mut body = serde_json::json!({
            "model": req.model_id,
            "messages": messages,
            "max_tokens": req.max_output.unwrap_or(DEFAULT_MAX_OUTPUT),
            "stream": stream,
        });

        if !system_parts.is_empty() {
            if req.cache_control {
                // Cache marker on the system prompt prefix segment.
                body["system"] = serde_json::json!([{
                    "type": "text",
                    "text": system_parts.join("\n\n"),
                    "cache_control": {"type": "ephemeral"},
                }]);
            } else {
                body["system"] = Value::String(system_parts.join("\n\n"));
            }
        }

        if !req.tools.is_empty() {
            let mut tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            if req.cache_control {
                if let Some(last) = tools.last_mut() {
                    last["cache_control"] = serde_json::json!({"type": "ephemeral"});
                }
            }
            body["tools"] = Value::Array(tools);
        }

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn content_to_blocks(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(t) => Value::String(t.clone()),
        MessageContent::Parts(parts) => {
            let blocks: Vec<Value> = parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => {
                        serde_json::json!({"type": "text", "text": text})
                    }
                    ContentPart::ToolUse { id, name, input } => serde_json::json!({
                        "type": "tool_use", "id": id, "name": name, "input": input,
                    }),
                    ContentPart::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                    ContentPart::Image { url, media_type } => serde_json::json!({
                        "type": "image",
                        "source": {
                            "type": "url",
                            "url": url,
                            "media_type": media_type,
                        },
                    }),
                })
                .collect();
            Value::Array(blocks)
        }
    }
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        input_tokens: v.get("input_tokens")?.as_u64()?,
        output_tokens: v.get("output_tokens").and_then(|o| o.as_u64()).unwrap_or(0),
        cache_read_tokens: v
            .get("cache_read_input_tokens")
            .and_then(|c| c.as_u64())
            .unwrap_or(0),
    })
}

fn parse_message_response(body: &Value) -> Result<ChatResponse> {
    let content_arr = body
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| Error::Provider {
            provider: "anthropic".into(),
            message: "no content in response".into(),
        })?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in content_arr {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                tool_calls.push(ToolRequest {
                    call_id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    tool_name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: block.get("input").cloned().unwrap_or(Value::Null),
                });
            }
            _ => {}
        }
    }

    Ok(ChatResponse {
        content: text,
        tool_calls,
        usage: body.get("usage").and_then(parse_usage),
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        finish_reason: body
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(map_stop_reason),
    })
}

/// Normalize Anthropic stop reasons to the shared vocabulary.
fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" => "stop".into(),
        "tool_use" => "tool_calls".into(),
        "max_tokens" => "length".into(),
        other => other.into(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streaming state: open tool-use blocks keyed by content-block index,
/// plus usage accumulated across `message_start` and `message_delta`.
#[derive(Default)]
struct StreamState {
    blocks: std::collections::HashMap<u64, (String, String, String)>,
    usage: Usage,
    finish_reason: Option<String>,
}

impl StreamState {
    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        match v.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                if let Some(usage) = v
                    .get("message")
                    .and_then(|m| m.get("usage"))
                    .and_then(parse_usage)
                {
                    self.usage = usage;
                }
                Vec::new()
            }
            Some("content_block_start") => {
                let index = v.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let block = v.get("content_block").unwrap_or(&Value::Null);
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                    let id = block
                        .get("id")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.blocks
                        .insert(index, (id.clone(), name.clone(), String::new()));
                    return vec![Ok(StreamEvent::ToolCallStarted {
                        call_id: id,
                        tool_name: name,
                    })];
                }
                Vec::new()
            }
            Some("content_block_delta") => {
                let index = v.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let delta = v.get("delta").unwrap_or(&Value::Null);
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        let text = delta
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default();
                        vec![Ok(StreamEvent::Token { text: text.into() })]
                    }
                    Some("input_json_delta") => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(|p| p.as_str())
                            .unwrap_or_default();
                        if let Some((call_id, _, buffer)) = self.blocks.get_mut(&index) {
                            buffer.push_str(partial);
                            return vec![Ok(StreamEvent::ToolCallDelta {
                                call_id: call_id.clone(),
                                delta: partial.into(),
                            })];
                        }
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            Some("content_block_stop") => {
                let index = v.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                if let Some((call_id, tool_name, buffer)) = self.blocks.remove(&index) {
                    let arguments = if buffer.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&buffer)
                            .unwrap_or(Value::Object(Default::default()))
                    };
                    return vec![Ok(StreamEvent::ToolCallFinished {
                        call_id,
                        tool_name,
                        arguments,
                    })];
                }
                Vec::new()
            }
            Some("message_delta") => {
                if let Some(usage) = v.get("usage").and_then(parse_usage) {
                    self.usage.output_tokens = usage.output_tokens;
                }
                if let Some(reason) = v
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|r| r.as_str())
                {
                    self.finish_reason = Some(map_stop_reason(reason));
                }
                Vec::new()
            }
            Some("message_stop") => {
                vec![Ok(StreamEvent::Done {
                    usage: Some(self.usage.clone()),
                    finish_reason: self.finish_reason.take(),
                })]
            }
            Some("error") => {
                let message = v
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown streaming error");
                vec![Ok(StreamEvent::Error {
                    message: message.into(),
                })]
            }
            _ => Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(req, false);
        tracing::debug!(model = %req.model_id, "anthropic chat request");

        let resp = self
            .authed_post()
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error("anthropic", status, retry_after, &text));
        }

        let json: Value = resp.json().await.map_err(from_reqwest)?;
        parse_message_response(&json)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_body(req, true);
        tracing::debug!(model = %req.model_id, "anthropic stream request");

        let resp = self
            .authed_post()
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error("anthropic", status, retry_after, &text));
        }

        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            state.parse(data)
        }))
    }

    fn family(&self) -> &str {
        "anthropic"
    }
}
