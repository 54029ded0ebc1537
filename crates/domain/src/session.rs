//! Sessions and messages — the conversational spine of the runtime.
//!
//! A session is created on the first inbound message routed to a new
//! conversation and mutated only by its orchestrator worker. Messages
//! are append-only; summary messages logically cover a prefix of older
//! rows via `covered_by` without deleting them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Archived,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub workspace_id: String,
    pub title: String,
    pub model_id: String,
    /// Per-turn fallback chain consulted when the primary model is
    /// rate-limited. Fixed at session creation.
    #[serde(default)]
    pub fallback_models: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub status: SessionStatus,
    /// Strictly monotonic; every bus event for this session carries the
    /// next value.
    pub sequence_counter: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
    Summary,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
            Self::Summary => "summary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            "system" => Some(Self::System),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// Message content: plain text or structured parts (tool use, tool
/// results, images). Providers translate to/from their wire formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "image")]
    Image {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_summary: bool,
    /// Set to the covering summary's message id when this row is
    /// logically excluded from the context view.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub covered_by: Option<String>,
}

impl Message {
    /// Token count attributed to this message for session accounting.
    pub fn token_total(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }

    /// Whether the content carries any image block.
    pub fn has_image(&self) -> bool {
        match &self.content {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => {
                parts.iter().any(|p| matches!(p, ContentPart::Image { .. }))
            }
        }
    }
}

impl MessageContent {
    /// Extract and join all text content, skipping non-text parts.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Byte length of the serialized content, used by token estimators.
    pub fn byte_len(&self) -> usize {
        match self {
            MessageContent::Text(t) => t.len(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::ToolUse { input, .. } => input.to_string().len(),
                    ContentPart::ToolResult { content, .. } => content.len(),
                    ContentPart::Image { .. } => 0,
                })
                .sum(),
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            MessageContent::Text(_) => 0,
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| matches!(p, ContentPart::Image { .. }))
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_all_text_joins_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "one".into() },
            ContentPart::ToolUse {
                id: "c1".into(),
                name: "exec".into(),
                input: serde_json::json!({}),
            },
            ContentPart::Text { text: "two".into() },
        ]);
        assert_eq!(content.extract_all_text(), "one\ntwo");
    }

    #[test]
    fn image_detection() {
        let msg = Message {
            id: "msg_1".into(),
            session_id: "ses_1".into(),
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::Image {
                url: "data:...".into(),
                media_type: Some("image/png".into()),
            }]),
            tool_call_id: None,
            tokens_in: 0,
            tokens_out: 0,
            created_at: Utc::now(),
            is_summary: false,
            covered_by: None,
        };
        assert!(msg.has_image());
        assert_eq!(msg.content.image_count(), 1);
    }
}
