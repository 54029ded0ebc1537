//! OpenAI-compatible adapter.
//!
//! Works with OpenAI and any endpoint following the chat-completions
//! contract (vLLM, Ollama, Together, …).

use serde_json::Value;

use hearth_domain::error::{Error, Result};
use hearth_domain::session::{ContentPart, MessageContent, Role};
use hearth_domain::stream::{BoxStream, StreamEvent, Usage};
use hearth_domain::tool::{ToolDefinition, ToolRequest};

use crate::traits::{ChatMessage, ChatRequest, ChatResponse, LlmProvider};
use crate::{from_reqwest, parse_retry_after, status_error};

pub struct OpenAiProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
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

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": req.model_id,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(max) = req.max_output {
            body["max_completion_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System | Role::Summary => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_openai(msg),
        Role::Assistant => assistant_to_openai(msg),
        _ => {
            if let MessageContent::Parts(parts) = &msg.content {
                if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })) {
                    return multimodal_to_openai(msg, parts);
                }
            }
            serde_json::json!({
                "role": role_to_str(msg.role),
                "content": msg.content.extract_all_text(),
            })
        }
    }
}

fn multimodal_to_openai(msg: &ChatMessage, parts: &[ContentPart]) -> Value {
    let blocks: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => {
                Some(serde_json::json!({"type": "text", "text": text}))
            }
            ContentPart::Image { url, .. } => Some(serde_json::json!({
                "type": "image_url",
                "image_url": {"url": url},
            })),
            _ => None,
        })
        .collect();
    serde_json::json!({"role": role_to_str(msg.role), "content": blocks})
}

fn assistant_to_openai(msg: &ChatMessage) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => text_parts.push(t.clone()),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                    _ => {}
                }
            }
        }
    }

    if text_parts.is_empty() {
        obj["content"] = Value::Null;
    } else {
        obj["content"] = Value::String(text_parts.join("\n"));
    }
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_openai(msg: &ChatMessage) -> Value {
    if let MessageContent::Parts(parts) = &msg.content {
        for part in parts {
            if let ContentPart::ToolResult {
                tool_use_id,
                content,
                ..
            } = part
            {
                return serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                });
            }
        }
    }
    serde_json::json!({
        "role": "tool",
        "tool_call_id": "",
        "content": msg.content.extract_all_text(),
    })
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        input_tokens: v.get("prompt_tokens")?.as_u64()?,
        output_tokens: v.get("completion_tokens")?.as_u64()?,
        cache_read_tokens: v
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|c| c.as_u64())
            .unwrap_or(0),
    })
}

fn parse_chat_response(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: "openai".into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: "openai".into(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let call_id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let tool_name = func.get("name")?.as_str()?.to_string();
                    let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
                    let arguments: Value = serde_json::from_str(args_str)
                        .unwrap_or(Value::Object(Default::default()));
                    Some(ToolRequest {
                        call_id,
                        tool_name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        tool_calls,
        usage: body.get("usage").and_then(parse_openai_usage),
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-call assembly state carried across stream chunks: the wire
/// format identifies fragments by index, not id.
#[derive(Default)]
struct StreamState {
    /// index → (call_id, tool_name, argument buffer)
    calls: std::collections::HashMap<u64, (String, String, String)>,
}

impl StreamState {
    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        if data.trim() == "[DONE]" {
            return vec![Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            })];
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        let choice = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first());

        // Usage-only chunk (stream_options.include_usage).
        let Some(choice) = choice else {
            if let Some(usage) = v.get("usage").and_then(parse_openai_usage) {
                return vec![Ok(StreamEvent::Done {
                    usage: Some(usage),
                    finish_reason: None,
                })];
            }
            return Vec::new();
        };

        let mut events = Vec::new();
        let delta = choice.get("delta").unwrap_or(&Value::Null);

        if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tc_arr {
                let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);

                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    let name = tc
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    self.calls
                        .insert(index, (id.to_string(), name.clone(), String::new()));
                    events.push(Ok(StreamEvent::ToolCallStarted {
                        call_id: id.to_string(),
                        tool_name: name,
                    }));
                }

                if let Some(args) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                {
                    if let Some((call_id, _, buffer)) = self.calls.get_mut(&index) {
                        buffer.push_str(args);
                        events.push(Ok(StreamEvent::ToolCallDelta {
                            call_id: call_id.clone(),
                            delta: args.to_string(),
                        }));
                    }
                }
            }
        }

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token {
                    text: text.to_string(),
                }));
            }
        }

        if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            // Flush assembled tool calls before the terminal event.
            let mut indices: Vec<u64> = self.calls.keys().copied().collect();
            indices.sort_unstable();
            for index in indices {
                if let Some((call_id, tool_name, buffer)) = self.calls.remove(&index) {
                    let arguments = serde_json::from_str(&buffer)
                        .unwrap_or(Value::Object(Default::default()));
                    events.push(Ok(StreamEvent::ToolCallFinished {
                        call_id,
                        tool_name,
                        arguments,
                    }));
                }
            }
            events.push(Ok(StreamEvent::Done {
                usage: v.get("usage").and_then(parse_openai_usage),
                finish_reason: Some(fr.to_string()),
            }));
        }

        events
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(req, false);
        tracing::debug!(model = %req.model_id, "openai chat request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error("openai", status, retry_after, &text));
        }

        let json: Value = resp.json().await.map_err(from_reqwest)?;
        parse_chat_response(&json)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(req, true);
        tracing::debug!(model = %req.model_id, "openai stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error("openai", status, retry_after, &text));
        }

        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            state.parse(data)
        }))
    }

    fn family(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_assembles_tool_call_across_chunks() {
        let mut state = StreamState::default();

        let started = state.parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"shell.exec"}}]}}]}"#,
        );
        assert!(matches!(
            started[0].as_ref().unwrap(),
            StreamEvent::ToolCallStarted { call_id, tool_name }
                if call_id == "call_1" && tool_name == "shell.exec"
        ));

        state.parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"command\":"}}]}}]}"#,
        );
        state.parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"ls\"}"}}]}}]}"#,
        );

        let done = state.parse(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        assert_eq!(done.len(), 2);
        match done[0].as_ref().unwrap() {
            StreamEvent::ToolCallFinished { arguments, .. } => {
                assert_eq!(arguments["command"], "ls");
            }
            other => panic!("expected ToolCallFinished, got {other:?}"),
        }
        assert!(matches!(
            done[1].as_ref().unwrap(),
            StreamEvent::Done { finish_reason: Some(fr), .. } if fr == "tool_calls"
        ));
    }

    #[test]
    fn usage_only_chunk_reports_cache_reads() {
        let mut state = StreamState::default();
        let events = state.parse(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":4,"prompt_tokens_details":{"cached_tokens":6}}}"#,
        );
        match events[0].as_ref().unwrap() {
            StreamEvent::Done { usage: Some(u), .. } => {
                assert_eq!(u.input_tokens, 10);
                assert_eq!(u.output_tokens, 4);
                assert_eq!(u.cache_read_tokens, 6);
            }
            other => panic!("expected Done with usage, got {other:?}"),
        }
    }

    #[test]
    fn assistant_message_with_tools_serializes() {
        let msg = ChatMessage {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "checking".into() },
                ContentPart::ToolUse {
                    id: "c1".into(),
                    name: "fs.read".into(),
                    input: serde_json::json!({"path": "/a"}),
                },
            ]),
        };
        let v = msg_to_openai(&msg);
        assert_eq!(v["content"], "checking");
        assert_eq!(v["tool_calls"][0]["function"]["name"], "fs.read");
    }

    #[test]
    fn non_streaming_response_parses() {
        let body = serde_json::json!({
            "model": "m1",
            "choices": [{
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        });
        let resp = parse_chat_response(&body).unwrap();
        assert_eq!(resp.content, "hi");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.unwrap().total(), 2);
    }
}
