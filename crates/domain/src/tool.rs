//! Tool types: definitions exposed to the model, invocation requests
//! emitted by the model, and the persisted ToolCall record with its
//! monotonic state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definitions & requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capability class used by the policy engine's no-match default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCapability {
    ReadOnly,
    #[default]
    Write,
    Privileged,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub capability: ToolCapability,
    /// Critical tools abort the turn on failure instead of feeding the
    /// error back to the model.
    #[serde(default)]
    pub critical: bool,
}

/// A tool invocation as emitted by the model (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolCall record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    PendingPolicy,
    PendingApproval,
    Approved,
    Denied,
    Executing,
    Completed,
    Failed,
}

impl ToolCallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingPolicy => "pending_policy",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_policy" => Some(Self::PendingPolicy),
            "pending_approval" => Some(Self::PendingApproval),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "executing" => Some(Self::Executing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Denied)
    }

    /// The legal forward edges of the state graph. `Failed` is reachable
    /// from any non-terminal state (timeouts, cancellation, crash sweep).
    pub fn may_advance_to(self, next: ToolCallStatus) -> bool {
        use ToolCallStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (PendingPolicy, PendingApproval | Approved | Denied) => true,
            (PendingApproval, Approved | Denied) => true,
            (Approved, Executing) => true,
            (Executing, Completed) => true,
            (_, Failed) => true,
            _ => false,
        }
    }
}

/// Breadth of an approval decision: this request, the rest of the
/// session, or indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalScope {
    #[default]
    Once,
    Session,
    Forever,
}

impl ApprovalScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Session => "session",
            Self::Forever => "forever",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "once" => Some(Self::Once),
            "session" => Some(Self::Session),
            "forever" => Some(Self::Forever),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub status: ToolCallStatus,
    #[serde(default)]
    pub approval_scope: ApprovalScope,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCall {
    pub fn new(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        request: &ToolRequest,
    ) -> Self {
        Self {
            id: crate::id::new_id(crate::id::TOOL_CALL),
            session_id: session_id.into(),
            message_id: message_id.into(),
            tool_name: request.tool_name.clone(),
            arguments: request.arguments.clone(),
            result: None,
            status: ToolCallStatus::PendingPolicy,
            approval_scope: ApprovalScope::Once,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_advance() {
        for s in [
            ToolCallStatus::Completed,
            ToolCallStatus::Failed,
            ToolCallStatus::Denied,
        ] {
            assert!(!s.may_advance_to(ToolCallStatus::Executing));
            assert!(!s.may_advance_to(ToolCallStatus::Failed));
        }
    }

    #[test]
    fn happy_path_edges() {
        use ToolCallStatus::*;
        assert!(PendingPolicy.may_advance_to(Approved));
        assert!(PendingPolicy.may_advance_to(PendingApproval));
        assert!(PendingApproval.may_advance_to(Approved));
        assert!(Approved.may_advance_to(Executing));
        assert!(Executing.may_advance_to(Completed));
    }

    #[test]
    fn no_backward_edges() {
        use ToolCallStatus::*;
        assert!(!Executing.may_advance_to(Approved));
        assert!(!Approved.may_advance_to(PendingApproval));
        assert!(!PendingApproval.may_advance_to(PendingPolicy));
    }

    #[test]
    fn failed_reachable_from_any_live_state() {
        use ToolCallStatus::*;
        for s in [PendingPolicy, PendingApproval, Approved, Executing] {
            assert!(s.may_advance_to(Failed), "{s:?} should be able to fail");
        }
    }
}
