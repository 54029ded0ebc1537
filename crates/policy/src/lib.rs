//! Policy engine — evaluates proposed tool invocations against
//! workspace rules and emits {allow, deny, ask} decisions.
//!
//! Evaluation is read-only and synchronous: when the answer is `ask`,
//! the engine returns immediately — waiting for the human is the
//! orchestrator's job. Every decision writes one audit entry.

mod hosts;
mod paths;
mod rate;

pub use hosts::host_matches;
pub use paths::canonicalize_within;
pub use rate::RateLimiter;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};

use hearth_domain::audit::{AuditEntry, AuditOutcome};
use hearth_domain::error::Result;
use hearth_domain::id;
use hearth_domain::policy::{CachedApproval, Policy, PolicyAction, PolicyDecision};
use hearth_domain::tool::{ApprovalScope, ToolCapability};
use hearth_store::Store;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A proposed tool invocation, as seen by the engine.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub session_id: String,
    pub workspace_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub caller_identity: String,
    /// Resolved from the tool registry; drives the no-match default.
    pub capability: ToolCapability,
}

/// SHA-256 over the canonical JSON of the arguments (serde_json keeps
/// object keys sorted, so equal values fingerprint equally).
pub fn argument_fingerprint(arguments: &serde_json::Value) -> String {
    let canonical = arguments.to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PolicyEngine {
    store: Arc<Store>,
    workspace_root: PathBuf,
    rate: RateLimiter,
    requests_per_minute: u32,
    tool_calls_per_minute: u32,
    approval_ttl_secs: u64,
}

impl PolicyEngine {
    pub fn new(
        store: Arc<Store>,
        workspace_root: PathBuf,
        requests_per_minute: u32,
        tool_calls_per_minute: u32,
        approval_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            workspace_root,
            rate: RateLimiter::new(),
            requests_per_minute,
            tool_calls_per_minute,
            approval_ttl_secs,
        }
    }

    /// Count one inbound request against the workspace window.
    /// Returns `false` when the limit is exhausted.
    pub fn admit_request(&self, workspace_id: &str) -> bool {
        self.rate
            .check_and_count(workspace_id, "requests", self.requests_per_minute)
    }

    /// Evaluate one proposed invocation. First matching rule wins;
    /// rules are ordered by specificity (exact name beats category
    /// wildcard, argument-constrained beats unconstrained).
    pub fn evaluate(&self, invocation: &ToolInvocation) -> Result<PolicyDecision> {
        let decision = self.evaluate_inner(invocation)?;

        self.store.append_audit(&AuditEntry::new(
            "policy",
            "policy.decision",
            "tool_call",
            invocation.session_id.clone(),
            match decision.action {
                PolicyAction::Deny => AuditOutcome::Denied,
                _ => AuditOutcome::Ok,
            },
            serde_json::json!({
                "session_id": invocation.session_id,
                "tool_name": invocation.tool_name,
                "caller": invocation.caller_identity,
                "action": decision.action.as_str(),
                "rule": decision.rule,
                "reason": decision.reason,
            }),
        ))?;

        Ok(decision)
    }

    fn evaluate_inner(&self, invocation: &ToolInvocation) -> Result<PolicyDecision> {
        // Rate limit converts any decision into a deny.
        if !self.rate.check_and_count(
            &invocation.workspace_id,
            "tool_calls",
            self.tool_calls_per_minute,
        ) {
            return Ok(PolicyDecision {
                action: PolicyAction::Deny,
                scope: ApprovalScope::Once,
                rule: "rate_limited".into(),
                reason: format!(
                    "workspace exceeded {} tool calls/minute",
                    self.tool_calls_per_minute
                ),
                approval_ttl_secs: None,
            });
        }

        // Cached approvals skip re-prompting for the same
        // (tool, argument-fingerprint) pair.
        let fingerprint = argument_fingerprint(&invocation.arguments);
        if let Some(approval) = self.store.find_approval(
            &invocation.workspace_id,
            &invocation.session_id,
            &invocation.tool_name,
            &fingerprint,
            Utc::now(),
        )? {
            return Ok(PolicyDecision {
                action: PolicyAction::Allow,
                scope: approval.scope,
                rule: "cached_approval".into(),
                reason: format!("approved earlier with scope {}", approval.scope.as_str()),
                approval_ttl_secs: None,
            });
        }

        let mut policies: Vec<Policy> = self
            .store
            .policies_for_workspace(&invocation.workspace_id)?
            .into_iter()
            .filter(|p| p.matches_tool(&invocation.tool_name))
            .collect();
        policies.sort_by(|a, b| b.specificity().cmp(&a.specificity()));

        if let Some(policy) = policies.first() {
            if let Some(violation) = self.check_constraints(policy, &invocation.arguments) {
                return Ok(PolicyDecision {
                    action: PolicyAction::Deny,
                    scope: ApprovalScope::Once,
                    rule: policy.id.clone(),
                    reason: violation,
                    approval_ttl_secs: None,
                });
            }
            return Ok(PolicyDecision {
                action: policy.action,
                scope: policy.scope,
                rule: policy.id.clone(),
                reason: format!("matched selector {}", policy.selector),
                approval_ttl_secs: (policy.action == PolicyAction::Ask)
                    .then_some(self.approval_ttl_secs),
            });
        }

        // No policy matched: default by capability class.
        let (action, reason) = match invocation.capability {
            ToolCapability::ReadOnly => (PolicyAction::Allow, "read-only tool, no rule matched"),
            ToolCapability::Write => (PolicyAction::Ask, "write-capable tool, no rule matched"),
            ToolCapability::Privileged => {
                (PolicyAction::Deny, "privileged-by-default tool, no rule matched")
            }
        };
        Ok(PolicyDecision {
            action,
            scope: ApprovalScope::Once,
            rule: "default".into(),
            reason: reason.into(),
            approval_ttl_secs: (action == PolicyAction::Ask).then_some(self.approval_ttl_secs),
        })
    }

    /// Validate path and network-target constraints. Returns the
    /// violation message on failure.
    fn check_constraints(&self, policy: &Policy, arguments: &serde_json::Value) -> Option<String> {
        let constraints = policy.argument_constraints.as_ref()?;

        for field in &constraints.path_fields {
            let Some(raw) = arguments.get(field).and_then(|v| v.as_str()) else {
                continue;
            };
            match canonicalize_within(&self.workspace_root, raw) {
                Ok(_) => {}
                Err(reason) => {
                    return Some(format!("path argument '{field}' rejected: {reason}"));
                }
            }
        }

        for field in &constraints.host_fields {
            let Some(raw) = arguments.get(field).and_then(|v| v.as_str()) else {
                continue;
            };
            let host = hosts::extract_host(raw);
            if !policy.domains.iter().any(|d| host_matches(d, &host)) {
                return Some(format!(
                    "host '{host}' is not in the allowlist for '{field}'"
                ));
            }
        }

        None
    }

    /// Persist a human approval with `session` or `forever` scope so the
    /// same (tool, fingerprint) pair is not re-prompted. `once` is not
    /// cached.
    pub fn record_approval(
        &self,
        workspace_id: &str,
        session_id: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
        scope: ApprovalScope,
    ) -> Result<()> {
        if scope == ApprovalScope::Once {
            return Ok(());
        }
        let approval = CachedApproval {
            id: id::new_id(id::APPROVAL),
            workspace_id: workspace_id.to_owned(),
            session_id: (scope == ApprovalScope::Session).then(|| session_id.to_owned()),
            tool_name: tool_name.to_owned(),
            fingerprint: argument_fingerprint(arguments),
            scope,
            created_at: Utc::now(),
            expires_at: None,
        };
        self.store.insert_approval(&approval)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_domain::policy::ArgumentConstraints;

    fn engine(root: PathBuf) -> (Arc<Store>, PolicyEngine) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = PolicyEngine::new(store.clone(), root, 100, 100, 300);
        (store, engine)
    }

    fn invocation(tool: &str, capability: ToolCapability) -> ToolInvocation {
        ToolInvocation {
            session_id: "ses_1".into(),
            workspace_id: "ws1".into(),
            tool_name: tool.into(),
            arguments: serde_json::json!({"command": "ls"}),
            caller_identity: "api:test".into(),
            capability,
        }
    }

    fn rule(selector: &str, action: PolicyAction) -> Policy {
        Policy {
            id: id::new_id(id::POLICY),
            workspace_id: "ws1".into(),
            selector: selector.into(),
            action,
            scope: ApprovalScope::Once,
            domains: vec![],
            argument_constraints: None,
            expires_at: None,
        }
    }

    #[test]
    fn defaults_by_capability() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, engine) = engine(dir.path().to_path_buf());

        let d = engine.evaluate(&invocation("fs.read", ToolCapability::ReadOnly)).unwrap();
        assert_eq!(d.action, PolicyAction::Allow);
        assert_eq!(d.rule, "default");

        let d = engine.evaluate(&invocation("fs.write", ToolCapability::Write)).unwrap();
        assert_eq!(d.action, PolicyAction::Ask);
        assert_eq!(d.approval_ttl_secs, Some(300));

        let d = engine
            .evaluate(&invocation("system.root", ToolCapability::Privileged))
            .unwrap();
        assert_eq!(d.action, PolicyAction::Deny);
    }

    #[test]
    fn exact_beats_category_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        let (store, engine) = engine(dir.path().to_path_buf());
        store.upsert_policy(&rule("shell.*", PolicyAction::Deny)).unwrap();
        let exact = rule("shell.exec", PolicyAction::Allow);
        store.upsert_policy(&exact).unwrap();

        let d = engine.evaluate(&invocation("shell.exec", ToolCapability::Write)).unwrap();
        assert_eq!(d.action, PolicyAction::Allow);
        assert_eq!(d.rule, exact.id);

        // Other tools in the category still hit the wildcard.
        let d = engine.evaluate(&invocation("shell.kill", ToolCapability::Write)).unwrap();
        assert_eq!(d.action, PolicyAction::Deny);
    }

    #[test]
    fn rate_limit_converts_to_deny() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = PolicyEngine::new(store, dir.path().to_path_buf(), 100, 2, 300);

        let inv = invocation("fs.read", ToolCapability::ReadOnly);
        assert_eq!(engine.evaluate(&inv).unwrap().action, PolicyAction::Allow);
        assert_eq!(engine.evaluate(&inv).unwrap().action, PolicyAction::Allow);
        let d = engine.evaluate(&inv).unwrap();
        assert_eq!(d.action, PolicyAction::Deny);
        assert_eq!(d.rule, "rate_limited");
    }

    #[test]
    fn cached_approval_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, engine) = engine(dir.path().to_path_buf());
        let inv = invocation("fs.write", ToolCapability::Write);

        assert_eq!(engine.evaluate(&inv).unwrap().action, PolicyAction::Ask);

        engine
            .record_approval("ws1", "ses_1", "fs.write", &inv.arguments, ApprovalScope::Session)
            .unwrap();
        let d = engine.evaluate(&inv).unwrap();
        assert_eq!(d.action, PolicyAction::Allow);
        assert_eq!(d.rule, "cached_approval");

        // Different arguments fingerprint differently — ask again.
        let mut other = inv.clone();
        other.arguments = serde_json::json!({"command": "rm"});
        assert_eq!(engine.evaluate(&other).unwrap().action, PolicyAction::Ask);
    }

    #[test]
    fn once_scope_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, engine) = engine(dir.path().to_path_buf());
        let inv = invocation("fs.write", ToolCapability::Write);
        engine
            .record_approval("ws1", "ses_1", "fs.write", &inv.arguments, ApprovalScope::Once)
            .unwrap();
        assert_eq!(engine.evaluate(&inv).unwrap().action, PolicyAction::Ask);
    }

    #[test]
    fn path_constraint_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let (store, engine) = engine(dir.path().to_path_buf());

        let mut p = rule("fs.write", PolicyAction::Allow);
        p.argument_constraints = Some(ArgumentConstraints {
            path_fields: vec!["path".into()],
            host_fields: vec![],
        });
        store.upsert_policy(&p).unwrap();

        let mut inv = invocation("fs.write", ToolCapability::Write);
        inv.arguments = serde_json::json!({"path": dir.path().join("ok.txt")});
        assert_eq!(engine.evaluate(&inv).unwrap().action, PolicyAction::Allow);

        inv.arguments = serde_json::json!({"path": "/etc/passwd"});
        let d = engine.evaluate(&inv).unwrap();
        assert_eq!(d.action, PolicyAction::Deny);
        assert!(d.reason.contains("path argument"));
    }

    #[test]
    fn host_constraint_checks_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let (store, engine) = engine(dir.path().to_path_buf());

        let mut p = rule("http.fetch", PolicyAction::Allow);
        p.domains = vec!["api.example.com".into(), "*.internal.dev".into()];
        p.argument_constraints = Some(ArgumentConstraints {
            path_fields: vec![],
            host_fields: vec!["url".into()],
        });
        store.upsert_policy(&p).unwrap();

        let mut inv = invocation("http.fetch", ToolCapability::Write);
        inv.arguments = serde_json::json!({"url": "https://API.example.com/v1"});
        assert_eq!(engine.evaluate(&inv).unwrap().action, PolicyAction::Allow);

        inv.arguments = serde_json::json!({"url": "https://evil.com/"});
        assert_eq!(engine.evaluate(&inv).unwrap().action, PolicyAction::Deny);
    }

    #[test]
    fn every_decision_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let (store, engine) = engine(dir.path().to_path_buf());
        engine
            .evaluate(&invocation("fs.read", ToolCapability::ReadOnly))
            .unwrap();
        engine
            .evaluate(&invocation("system.root", ToolCapability::Privileged))
            .unwrap();
        assert_eq!(store.count_audit().unwrap(), 2);
    }
}
