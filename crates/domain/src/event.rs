//! Bus event types and topics.
//!
//! Events are read-visible snapshots: the bus never carries live
//! references into mutable state. Per-session ordering is expressed by
//! the `sequence` field, assigned from the session's counter at publish
//! time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Topics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    SessionMessage,
    SessionTokens,
    ToolRequest,
    ToolExecuting,
    ToolComplete,
    ApprovalNeeded,
    ApprovalResolved,
    TraceEvent,
    ErrorOccurred,
    TaskFired,
    TaskCompleted,
}

impl Topic {
    pub const ALL: [Topic; 11] = [
        Topic::SessionMessage,
        Topic::SessionTokens,
        Topic::ToolRequest,
        Topic::ToolExecuting,
        Topic::ToolComplete,
        Topic::ApprovalNeeded,
        Topic::ApprovalResolved,
        Topic::TraceEvent,
        Topic::ErrorOccurred,
        Topic::TaskFired,
        Topic::TaskCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionMessage => "session.message",
            Self::SessionTokens => "session.tokens",
            Self::ToolRequest => "tool.request",
            Self::ToolExecuting => "tool.executing",
            Self::ToolComplete => "tool.complete",
            Self::ApprovalNeeded => "approval.needed",
            Self::ApprovalResolved => "approval.resolved",
            Self::TraceEvent => "trace.event",
            Self::ErrorOccurred => "error.occurred",
            Self::TaskFired => "task.fired",
            Self::TaskCompleted => "task.completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Ephemeral topics are never persisted for replay and may be
    /// dropped or coalesced under backpressure.
    pub fn is_ephemeral(self) -> bool {
        matches!(
            self,
            Self::SessionTokens | Self::ToolExecuting | Self::TraceEvent
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Assigned from the session counter when `session_id` is set and
    /// the publisher did not supply one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: Topic, payload: serde_json::Value) -> Self {
        Self {
            topic,
            session_id: None,
            sequence: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn for_session(
        topic: Topic,
        session_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            topic,
            session_id: Some(session_id.into()),
            sequence: None,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Topic filter carried by a subscription.
#[derive(Debug, Clone, Default)]
pub enum TopicFilter {
    #[default]
    All,
    Only(Vec<Topic>),
}

impl TopicFilter {
    pub fn matches(&self, topic: Topic) -> bool {
        match self {
            Self::All => true,
            Self::Only(topics) => topics.contains(&topic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_round_trip() {
        for t in Topic::ALL {
            assert_eq!(Topic::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn ephemeral_topics() {
        assert!(Topic::SessionTokens.is_ephemeral());
        assert!(Topic::ToolExecuting.is_ephemeral());
        assert!(!Topic::SessionMessage.is_ephemeral());
        assert!(!Topic::ApprovalNeeded.is_ephemeral());
    }

    #[test]
    fn filter_matches() {
        let f = TopicFilter::Only(vec![Topic::SessionMessage]);
        assert!(f.matches(Topic::SessionMessage));
        assert!(!f.matches(Topic::ToolComplete));
        assert!(TopicFilter::All.matches(Topic::TraceEvent));
    }
}
