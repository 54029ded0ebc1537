//! Session rows: creation, token/cost accounting, sequence assignment,
//! cascade deletion.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use hearth_domain::error::{Error, Result};
use hearth_domain::session::{Session, SessionStatus};

use crate::{micros_to_ts, ts_to_micros, Store};

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get("status")?;
    let fallback_json: String = row.get("fallback_models")?;
    Ok(Session {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        title: row.get("title")?,
        model_id: row.get("model_id")?,
        fallback_models: serde_json::from_str(&fallback_json).unwrap_or_default(),
        created_at: micros_to_ts(row.get("created_at")?),
        updated_at: micros_to_ts(row.get("updated_at")?),
        total_tokens: row.get::<_, i64>("total_tokens")? as u64,
        total_cost: row.get("total_cost")?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Failed),
        sequence_counter: row.get::<_, i64>("sequence_counter")? as u64,
    })
}

impl Store {
    pub fn create_session(&self, session: &Session) -> Result<()> {
        let fallback = serde_json::to_string(&session.fallback_models)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, workspace_id, title, model_id, fallback_models,
                     created_at, updated_at, total_tokens, total_cost, status, sequence_counter)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    session.id,
                    session.workspace_id,
                    session.title,
                    session.model_id,
                    fallback,
                    ts_to_micros(session.created_at),
                    ts_to_micros(session.updated_at),
                    session.total_tokens as i64,
                    session.total_cost,
                    session.status.as_str(),
                    session.sequence_counter as i64,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM sessions WHERE id = ?1",
                params![id],
                row_to_session,
            )
            .optional()
        })
    }

    pub fn require_session(&self, id: &str) -> Result<Session> {
        self.get_session(id)?
            .ok_or_else(|| Error::NotFound(format!("session {id}")))
    }

    pub fn list_sessions(&self, workspace_id: Option<&str>) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut out = Vec::new();
            match workspace_id {
                Some(ws) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM sessions WHERE workspace_id = ?1
                         ORDER BY updated_at DESC",
                    )?;
                    let rows = stmt.query_map(params![ws], row_to_session)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT * FROM sessions ORDER BY updated_at DESC")?;
                    let rows = stmt.query_map([], row_to_session)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
    }

    pub fn count_sessions(&self, status: SessionStatus) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE status = ?1",
                params![status.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
        })
    }

    /// Atomically claim the next sequence number for a session.
    pub fn next_sequence(&self, session_id: &str) -> Result<u64> {
        let now = ts_to_micros(self.now());
        self.with_conn(|conn| {
            conn.query_row(
                "UPDATE sessions
                 SET sequence_counter = sequence_counter + 1, updated_at = ?2
                 WHERE id = ?1
                 RETURNING sequence_counter",
                params![session_id, now],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        })
        .map_err(|e| match e {
            Error::Storage(msg) if msg.contains("no rows") => {
                Error::NotFound(format!("session {session_id}"))
            }
            other => other,
        })
    }

    /// Accrue usage from one completed model interaction.
    pub fn record_session_usage(&self, session_id: &str, tokens: u64, cost: f64) -> Result<()> {
        let now = ts_to_micros(self.now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions
                 SET total_tokens = total_tokens + ?2, total_cost = total_cost + ?3,
                     updated_at = ?4
                 WHERE id = ?1",
                params![session_id, tokens as i64, cost, now],
            )?;
            Ok(())
        })
    }

    /// Accrue cost only (summarization calls pay their own way; their
    /// token effect lands through coverage sync instead).
    pub fn add_session_cost(&self, session_id: &str, cost: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET total_cost = total_cost + ?2 WHERE id = ?1",
                params![session_id, cost],
            )?;
            Ok(())
        })
    }

    /// Subtract tokens when messages rotate out of accounting.
    pub fn deduct_session_tokens(&self, session_id: &str, tokens: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions
                 SET total_tokens = MAX(0, total_tokens - ?2)
                 WHERE id = ?1",
                params![session_id, tokens as i64],
            )?;
            Ok(())
        })
    }

    pub fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let now = ts_to_micros(self.now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![session_id, status.as_str(), now],
            )?;
            Ok(())
        })
    }

    pub fn set_session_title(&self, session_id: &str, title: &str) -> Result<()> {
        let now = ts_to_micros(self.now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET title = ?2, updated_at = ?3 WHERE id = ?1",
                params![session_id, title, now],
            )?;
            Ok(())
        })
    }

    /// Archive active sessions whose `updated_at` is older than the
    /// cutoff. Returns the archived ids.
    pub fn archive_idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "UPDATE sessions SET status = 'archived'
                 WHERE status = 'active' AND updated_at < ?1
                 RETURNING id",
            )?;
            let rows = stmt.query_map(params![ts_to_micros(cutoff)], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Delete a session, cascading to messages, tool calls, session-key
    /// bindings, replay events, and session-scoped approvals. Audit rows
    /// are never deleted.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM events WHERE session_id = ?1", params![session_id])?;
            tx.execute(
                "DELETE FROM approvals WHERE session_id = ?1",
                params![session_id],
            )?;
            let n = tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
            tx.commit()?;
            Ok(n > 0)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use hearth_domain::id;

    pub(crate) fn make_session(store: &Store) -> Session {
        let now = Utc::now();
        let session = Session {
            id: id::new_id(id::SESSION),
            workspace_id: "ws1".into(),
            title: "untitled".into(),
            model_id: "m1".into(),
            fallback_models: vec!["m3".into()],
            created_at: now,
            updated_at: now,
            total_tokens: 0,
            total_cost: 0.0,
            status: SessionStatus::Active,
            sequence_counter: 0,
        };
        store.create_session(&session).unwrap();
        session
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let session = make_session(&store);
        let got = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(got.model_id, "m1");
        assert_eq!(got.fallback_models, vec!["m3".to_string()]);
        assert_eq!(got.status, SessionStatus::Active);
    }

    #[test]
    fn sequence_is_strictly_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let session = make_session(&store);
        let a = store.next_sequence(&session.id).unwrap();
        let b = store.next_sequence(&session.id).unwrap();
        let c = store.next_sequence(&session.id).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn next_sequence_unknown_session_errors() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.next_sequence("ses_missing").is_err());
    }

    #[test]
    fn usage_accrues() {
        let store = Store::open_in_memory().unwrap();
        let session = make_session(&store);
        store.record_session_usage(&session.id, 2, 3e-6).unwrap();
        store.record_session_usage(&session.id, 5, 1e-6).unwrap();
        let got = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(got.total_tokens, 7);
        assert!((got.total_cost - 4e-6).abs() < 1e-12);
    }

    #[test]
    fn delete_cascades() {
        let store = Store::open_in_memory().unwrap();
        let session = make_session(&store);
        assert!(store.delete_session(&session.id).unwrap());
        assert!(store.get_session(&session.id).unwrap().is_none());
        assert!(!store.delete_session(&session.id).unwrap());
    }

    #[test]
    fn list_filters_by_workspace() {
        let store = Store::open_in_memory().unwrap();
        let _s = make_session(&store);
        assert_eq!(store.list_sessions(Some("ws1")).unwrap().len(), 1);
        assert_eq!(store.list_sessions(Some("other")).unwrap().len(), 0);
        assert_eq!(store.list_sessions(None).unwrap().len(), 1);
    }
}
