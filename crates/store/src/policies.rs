//! Policy rows and cached approvals.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use hearth_domain::error::Result;
use hearth_domain::policy::{ArgumentConstraints, CachedApproval, Policy, PolicyAction};
use hearth_domain::tool::ApprovalScope;

use crate::{micros_to_ts, ts_to_micros, Store};

fn row_to_policy(row: &Row<'_>) -> rusqlite::Result<Policy> {
    let action: String = row.get("action")?;
    let scope: String = row.get("scope")?;
    let domains: String = row.get("domains")?;
    let constraints: Option<String> = row.get("argument_constraints")?;
    Ok(Policy {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        selector: row.get("selector")?,
        action: PolicyAction::parse(&action).unwrap_or(PolicyAction::Ask),
        scope: ApprovalScope::parse(&scope).unwrap_or_default(),
        domains: serde_json::from_str(&domains).unwrap_or_default(),
        argument_constraints: constraints
            .and_then(|c| serde_json::from_str::<ArgumentConstraints>(&c).ok()),
        expires_at: row.get::<_, Option<i64>>("expires_at")?.map(micros_to_ts),
    })
}

fn row_to_approval(row: &Row<'_>) -> rusqlite::Result<CachedApproval> {
    let scope: String = row.get("scope")?;
    Ok(CachedApproval {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        session_id: row.get("session_id")?,
        tool_name: row.get("tool_name")?,
        fingerprint: row.get("fingerprint")?,
        scope: ApprovalScope::parse(&scope).unwrap_or_default(),
        created_at: micros_to_ts(row.get("created_at")?),
        expires_at: row.get::<_, Option<i64>>("expires_at")?.map(micros_to_ts),
    })
}

impl Store {
    pub fn upsert_policy(&self, policy: &Policy) -> Result<()> {
        let domains = serde_json::to_string(&policy.domains)?;
        let constraints = policy
            .argument_constraints
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO policies (id, workspace_id, selector, action, scope, domains,
                     argument_constraints, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                     selector = excluded.selector,
                     action = excluded.action,
                     scope = excluded.scope,
                     domains = excluded.domains,
                     argument_constraints = excluded.argument_constraints,
                     expires_at = excluded.expires_at",
                params![
                    policy.id,
                    policy.workspace_id,
                    policy.selector,
                    policy.action.as_str(),
                    policy.scope.as_str(),
                    domains,
                    constraints,
                    policy.expires_at.map(ts_to_micros),
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_policy(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM policies WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    /// Unexpired policies for a workspace.
    pub fn policies_for_workspace(&self, workspace_id: &str) -> Result<Vec<Policy>> {
        let now = ts_to_micros(Utc::now());
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM policies
                 WHERE workspace_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            )?;
            let rows = stmt.query_map(params![workspace_id, now], row_to_policy)?;
            rows.collect()
        })
    }

    // ── Cached approvals ─────────────────────────────────────────────

    pub fn insert_approval(&self, approval: &CachedApproval) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO approvals (id, workspace_id, session_id, tool_name,
                     fingerprint, scope, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    approval.id,
                    approval.workspace_id,
                    approval.session_id,
                    approval.tool_name,
                    approval.fingerprint,
                    approval.scope.as_str(),
                    ts_to_micros(approval.created_at),
                    approval.expires_at.map(ts_to_micros),
                ],
            )?;
            Ok(())
        })
    }

    /// Look for a live cached approval covering (tool, fingerprint):
    /// a `forever` row for the workspace, or a `session` row for this
    /// session.
    pub fn find_approval(
        &self,
        workspace_id: &str,
        session_id: &str,
        tool_name: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedApproval>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM approvals
                 WHERE workspace_id = ?1 AND tool_name = ?2 AND fingerprint = ?3
                   AND (session_id IS NULL OR session_id = ?4)
                   AND (expires_at IS NULL OR expires_at > ?5)
                 ORDER BY created_at DESC LIMIT 1",
                params![workspace_id, tool_name, fingerprint, session_id, ts_to_micros(now)],
                row_to_approval,
            )
            .optional()
        })
    }

    pub fn purge_expired_approvals(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM approvals WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![ts_to_micros(now)],
            )?;
            Ok(n)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_domain::id;

    #[test]
    fn policy_round_trip_and_expiry() {
        let store = Store::open_in_memory().unwrap();
        let mut p = Policy {
            id: id::new_id(id::POLICY),
            workspace_id: "ws1".into(),
            selector: "shell.*".into(),
            action: PolicyAction::Ask,
            scope: ApprovalScope::Once,
            domains: vec!["example.com".into()],
            argument_constraints: None,
            expires_at: None,
        };
        store.upsert_policy(&p).unwrap();
        assert_eq!(store.policies_for_workspace("ws1").unwrap().len(), 1);

        // Expired policies are filtered on read.
        p.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.upsert_policy(&p).unwrap();
        assert!(store.policies_for_workspace("ws1").unwrap().is_empty());
    }

    #[test]
    fn approval_scopes_resolve() {
        let store = Store::open_in_memory().unwrap();
        let session = crate::sessions::tests::make_session(&store);
        let now = Utc::now();

        store
            .insert_approval(&CachedApproval {
                id: id::new_id(id::APPROVAL),
                workspace_id: "ws1".into(),
                session_id: Some(session.id.clone()),
                tool_name: "shell.exec".into(),
                fingerprint: "fp1".into(),
                scope: ApprovalScope::Session,
                created_at: now,
                expires_at: None,
            })
            .unwrap();

        // Hits within the same session.
        assert!(store
            .find_approval("ws1", &session.id, "shell.exec", "fp1", now)
            .unwrap()
            .is_some());
        // Misses from another session.
        assert!(store
            .find_approval("ws1", "ses_other", "shell.exec", "fp1", now)
            .unwrap()
            .is_none());
        // Misses with a different fingerprint.
        assert!(store
            .find_approval("ws1", &session.id, "shell.exec", "fp2", now)
            .unwrap()
            .is_none());

        // Session deletion cascades session-scoped approvals.
        store.delete_session(&session.id).unwrap();
        assert!(store
            .find_approval("ws1", &session.id, "shell.exec", "fp1", now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn forever_approvals_survive_any_session() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_approval(&CachedApproval {
                id: id::new_id(id::APPROVAL),
                workspace_id: "ws1".into(),
                session_id: None,
                tool_name: "fs.read".into(),
                fingerprint: "fp".into(),
                scope: ApprovalScope::Forever,
                created_at: now,
                expires_at: Some(now + chrono::Duration::days(30)),
            })
            .unwrap();
        assert!(store
            .find_approval("ws1", "ses_whatever", "fs.read", "fp", now)
            .unwrap()
            .is_some());

        // And expire on schedule.
        let later = now + chrono::Duration::days(31);
        assert!(store
            .find_approval("ws1", "ses_whatever", "fs.read", "fp", later)
            .unwrap()
            .is_none());
        assert_eq!(store.purge_expired_approvals(later).unwrap(), 1);
    }
}
