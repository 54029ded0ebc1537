//! Audit entries — the append-only, never-mutated record of every
//! policy decision, approval resolution, tool state transition, task
//! failure, and provider retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Ok,
    Denied,
    Failed,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Denied => "denied",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "denied" => Some(Self::Denied),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Who acted: `"orchestrator"`, `"policy"`, `"scheduler"`,
    /// `"api:<identity>"`, `"channel:<name>"`.
    pub actor: String,
    /// Dotted verb, e.g. `"tool_call.approved"`, `"provider.retry"`.
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub outcome: AuditOutcome,
    /// Names of detail fields that were redacted before storage.
    #[serde(default)]
    pub redaction_flags: Vec<String>,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        outcome: AuditOutcome,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: crate::id::new_id(crate::id::AUDIT),
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            details,
            outcome,
            redaction_flags: Vec::new(),
        }
    }
}
