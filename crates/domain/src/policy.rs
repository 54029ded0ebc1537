//! Policy entities and decisions.
//!
//! Policies are mutated only through the admin API; evaluation is
//! read-only. A selector is either an exact tool name (`shell.exec`), a
//! category wildcard (`shell.*`), or the global wildcard (`*`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::ApprovalScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Deny,
    Ask,
}

impl PolicyAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Ask => "ask",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            "ask" => Some(Self::Ask),
            _ => None,
        }
    }
}

/// Constraints evaluated against the invocation arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgumentConstraints {
    /// Path arguments (by field name) must canonicalize under the
    /// workspace root.
    #[serde(default)]
    pub path_fields: Vec<String>,
    /// Network-target arguments (by field name) must match `domains`.
    #[serde(default)]
    pub host_fields: Vec<String>,
}

impl ArgumentConstraints {
    pub fn is_empty(&self) -> bool {
        self.path_fields.is_empty() && self.host_fields.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub workspace_id: String,
    /// Tool pattern: exact name, `category.*`, or `*`.
    pub selector: String,
    pub action: PolicyAction,
    /// Scope granted when the action is `allow` (pre-approved breadth).
    #[serde(default)]
    pub scope: ApprovalScope,
    /// Hostname allowlist for network-target arguments. Wildcard entries
    /// (`*.example.com`) match exactly one label.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_constraints: Option<ArgumentConstraints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Policy {
    /// Specificity rank for first-match ordering: higher wins.
    /// Exact + constraints > exact > category + constraints > category >
    /// global wildcard.
    pub fn specificity(&self) -> u8 {
        let constrained = self
            .argument_constraints
            .as_ref()
            .is_some_and(|c| !c.is_empty());
        match (self.selector.as_str(), constrained) {
            ("*", _) => 0,
            (s, true) if s.ends_with(".*") => 3,
            (s, false) if s.ends_with(".*") => 2,
            (_, true) => 5,
            (_, false) => 4,
        }
    }

    /// Whether the selector covers the given tool name.
    pub fn matches_tool(&self, tool_name: &str) -> bool {
        if self.selector == "*" {
            return true;
        }
        if let Some(category) = self.selector.strip_suffix(".*") {
            return tool_name
                .strip_prefix(category)
                .is_some_and(|rest| rest.starts_with('.'));
        }
        self.selector == tool_name
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// A cached approval: a human's `session`- or `forever`-scoped decision,
/// re-consulted before re-prompting for the same (tool, fingerprint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedApproval {
    pub id: String,
    pub workspace_id: String,
    /// Set for `session`-scoped approvals; `None` for `forever`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub tool_name: String,
    /// SHA-256 over the canonical JSON of the arguments.
    pub fingerprint: String,
    pub scope: ApprovalScope,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedApproval {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// The outcome of a policy evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub scope: ApprovalScope,
    /// Identifier of the deciding rule, or a builtin reason
    /// (`"default"`, `"rate_limited"`, `"cached_approval"`).
    pub rule: String,
    pub reason: String,
    /// How long an `ask` decision stays answerable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_ttl_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(selector: &str, constrained: bool) -> Policy {
        Policy {
            id: "pol_1".into(),
            workspace_id: "ws".into(),
            selector: selector.into(),
            action: PolicyAction::Allow,
            scope: ApprovalScope::Once,
            domains: vec![],
            argument_constraints: constrained.then(|| ArgumentConstraints {
                path_fields: vec!["path".into()],
                host_fields: vec![],
            }),
            expires_at: None,
        }
    }

    #[test]
    fn specificity_ordering() {
        assert!(policy("shell.exec", true).specificity() > policy("shell.exec", false).specificity());
        assert!(policy("shell.exec", false).specificity() > policy("shell.*", true).specificity());
        assert!(policy("shell.*", true).specificity() > policy("shell.*", false).specificity());
        assert!(policy("shell.*", false).specificity() > policy("*", false).specificity());
    }

    #[test]
    fn category_wildcard_needs_dot_boundary() {
        let p = policy("shell.*", false);
        assert!(p.matches_tool("shell.exec"));
        assert!(p.matches_tool("shell.read.file"));
        assert!(!p.matches_tool("shellexec"));
        assert!(!p.matches_tool("fs.read"));
    }

    #[test]
    fn exact_and_global_match() {
        assert!(policy("fs.read", false).matches_tool("fs.read"));
        assert!(!policy("fs.read", false).matches_tool("fs.write"));
        assert!(policy("*", false).matches_tool("anything.at.all"));
    }
}
