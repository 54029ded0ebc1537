//! Audit rows: append-only, queried by time range and resource.

use rusqlite::{params, Row};

use hearth_domain::audit::{AuditEntry, AuditOutcome};
use hearth_domain::error::Result;

use crate::{micros_to_ts, ts_to_micros, Store};

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let outcome: String = row.get("outcome")?;
    let details: String = row.get("details")?;
    let flags: String = row.get("redaction_flags")?;
    Ok(AuditEntry {
        id: row.get("id")?,
        timestamp: micros_to_ts(row.get("ts")?),
        actor: row.get("actor")?,
        action: row.get("action")?,
        resource_type: row.get("resource_type")?,
        resource_id: row.get("resource_id")?,
        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
        outcome: AuditOutcome::parse(&outcome).unwrap_or(AuditOutcome::Failed),
        redaction_flags: serde_json::from_str(&flags).unwrap_or_default(),
    })
}

/// Query filters for the audit surface (`GET /audit`).
#[derive(Debug, Default)]
pub struct AuditQuery<'a> {
    /// Matches `resource_id` or a `session_id` field inside `details`.
    pub session: Option<&'a str>,
    /// Matches a `tool_name` field inside `details`.
    pub tool: Option<&'a str>,
    pub limit: usize,
    /// Return entries strictly older than this id (paging cursor).
    pub before: Option<&'a str>,
}

impl Store {
    pub fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let details = serde_json::to_string(&entry.details)?;
        let flags = serde_json::to_string(&entry.redaction_flags)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit (id, ts, actor, action, resource_type, resource_id,
                     details, outcome, redaction_flags)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.id,
                    ts_to_micros(entry.timestamp),
                    entry.actor,
                    entry.action,
                    entry.resource_type,
                    entry.resource_id,
                    details,
                    entry.outcome.as_str(),
                    flags,
                ],
            )?;
            Ok(())
        })
    }

    /// Newest-first page of audit entries.
    pub fn query_audit(&self, query: AuditQuery<'_>) -> Result<Vec<AuditEntry>> {
        let limit = if query.limit == 0 { 100 } else { query.limit };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM audit
                 WHERE (?1 IS NULL OR resource_id = ?1
                        OR json_extract(details, '$.session_id') = ?1)
                   AND (?2 IS NULL OR json_extract(details, '$.tool_name') = ?2)
                   AND (?3 IS NULL OR id < ?3)
                 ORDER BY id DESC LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![query.session, query.tool, query.before, limit as i64],
                row_to_audit,
            )?;
            rows.collect()
        })
    }

    pub fn count_audit(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM audit", [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: &str, details: serde_json::Value) -> AuditEntry {
        AuditEntry::new("orchestrator", action, "tool_call", "tc_1", AuditOutcome::Ok, details)
    }

    #[test]
    fn append_and_query() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_audit(&entry(
                "tool_call.approved",
                serde_json::json!({"session_id": "ses_a", "tool_name": "shell.exec"}),
            ))
            .unwrap();
        store
            .append_audit(&entry(
                "tool_call.completed",
                serde_json::json!({"session_id": "ses_b", "tool_name": "fs.read"}),
            ))
            .unwrap();

        let all = store.query_audit(AuditQuery::default()).unwrap();
        assert_eq!(all.len(), 2);

        let by_session = store
            .query_audit(AuditQuery {
                session: Some("ses_a"),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_session.len(), 1);
        assert_eq!(by_session[0].action, "tool_call.approved");

        let by_tool = store
            .query_audit(AuditQuery {
                tool: Some("fs.read"),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_tool.len(), 1);
    }

    #[test]
    fn paging_cursor_pages_backwards() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .append_audit(&entry("tick", serde_json::json!({"i": i})))
                .unwrap();
        }
        let first = store
            .query_audit(AuditQuery {
                limit: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(first.len(), 2);
        let next = store
            .query_audit(AuditQuery {
                limit: 10,
                before: Some(&first[1].id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(next.len(), 3);
        assert!(next.iter().all(|e| e.id < first[1].id));
    }
}
