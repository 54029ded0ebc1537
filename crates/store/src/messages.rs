//! Message rows: append-only within a session, ordered range reads,
//! summary coverage marking, rotation at the per-session cap.

use rusqlite::{params, OptionalExtension, Row};

use hearth_domain::error::Result;
use hearth_domain::session::{Message, MessageContent, Role};

use crate::{micros_to_ts, ts_to_micros, Store};

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get("role")?;
    let content_json: String = row.get("content")?;
    let content: MessageContent = serde_json::from_str(&content_json)
        .unwrap_or_else(|_| MessageContent::Text(content_json.clone()));
    Ok(Message {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        role: Role::parse(&role).unwrap_or(Role::System),
        content,
        tool_call_id: row.get("tool_call_id")?,
        tokens_in: row.get::<_, i64>("tokens_in")? as u64,
        tokens_out: row.get::<_, i64>("tokens_out")? as u64,
        created_at: micros_to_ts(row.get("created_at")?),
        is_summary: row.get::<_, i64>("is_summary")? != 0,
        covered_by: row.get("covered_by")?,
    })
}

impl Store {
    /// Append a message. When the session exceeds the message cap, the
    /// oldest non-summary rows rotate out and their tokens are deducted
    /// from the session total.
    pub fn append_message(&self, message: &Message) -> Result<()> {
        let content = serde_json::to_string(&message.content)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, session_id, role, content, tool_call_id,
                     tokens_in, tokens_out, created_at, is_summary, covered_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    message.id,
                    message.session_id,
                    message.role.as_str(),
                    content,
                    message.tool_call_id,
                    message.tokens_in as i64,
                    message.tokens_out as i64,
                    ts_to_micros(message.created_at),
                    message.is_summary as i64,
                    message.covered_by,
                ],
            )?;
            Ok(())
        })?;

        self.rotate_messages(&message.session_id)
    }

    fn rotate_messages(&self, session_id: &str) -> Result<()> {
        let cap = self.max_messages_per_session;
        let rotated: Vec<(String, i64)> = self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            let excess = count - cap as i64;
            if excess <= 0 {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare(
                "SELECT id, tokens_in + tokens_out FROM messages
                 WHERE session_id = ?1 AND is_summary = 0
                 ORDER BY created_at ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![session_id, excess], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect()
        })?;

        if rotated.is_empty() {
            return Ok(());
        }

        let mut tokens = 0i64;
        self.with_conn(|conn| {
            for (id, t) in &rotated {
                conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
                tokens += t;
            }
            Ok(())
        })?;
        tracing::debug!(
            session_id,
            rotated = rotated.len(),
            "rotated messages past per-session cap"
        );
        self.deduct_session_tokens(session_id, tokens.max(0) as u64)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM messages WHERE id = ?1",
                params![id],
                row_to_message,
            )
            .optional()
        })
    }

    /// All messages for a session ordered by creation time.
    pub fn messages_by_session(&self, session_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], row_to_message)?;
            rows.collect()
        })
    }

    /// The context view: rows not covered by a later summary.
    pub fn visible_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages
                 WHERE session_id = ?1 AND covered_by IS NULL
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], row_to_message)?;
            rows.collect()
        })
    }

    /// Record the token counts measured for an existing message.
    pub fn set_message_tokens(&self, id: &str, tokens_in: u64, tokens_out: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET tokens_in = ?2, tokens_out = ?3 WHERE id = ?1",
                params![id, tokens_in as i64, tokens_out as i64],
            )?;
            Ok(())
        })
    }

    /// Update assistant content as the stream progresses.
    pub fn set_message_content(&self, id: &str, content: &MessageContent) -> Result<()> {
        let json = serde_json::to_string(content)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET content = ?2 WHERE id = ?1",
                params![id, json],
            )?;
            Ok(())
        })
    }

    /// Mark a set of messages as covered by a summary. Originals stay in
    /// the store for audit; the context view skips them.
    pub fn mark_covered(&self, message_ids: &[String], summary_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            for id in message_ids {
                conn.execute(
                    "UPDATE messages SET covered_by = ?2 WHERE id = ?1 AND covered_by IS NULL",
                    params![id, summary_id],
                )?;
            }
            Ok(())
        })
    }

    /// Re-derive `session.total_tokens` from the non-covered rows.
    /// Called after summarization or truncation changes coverage.
    pub fn sync_session_tokens(&self, session_id: &str) -> Result<u64> {
        let sum = self.visible_token_sum(session_id)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET total_tokens = ?2 WHERE id = ?1",
                params![session_id, sum as i64],
            )?;
            Ok(())
        })?;
        Ok(sum)
    }

    /// Sum of token counts over non-covered messages — the invariant
    /// `session.total_tokens` must equal.
    pub fn visible_token_sum(&self, session_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(tokens_in + tokens_out), 0) FROM messages
                 WHERE session_id = ?1 AND covered_by IS NULL",
                params![session_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hearth_domain::id;

    fn msg(store: &Store, session_id: &str, role: Role, text: &str, tokens: u64) -> Message {
        let m = Message {
            id: id::new_id(id::MESSAGE),
            session_id: session_id.into(),
            role,
            content: MessageContent::Text(text.into()),
            tool_call_id: None,
            tokens_in: tokens,
            tokens_out: 0,
            created_at: store.now(),
            is_summary: role == Role::Summary,
            covered_by: None,
        };
        store.append_message(&m).unwrap();
        m
    }

    fn session(store: &Store) -> String {
        crate::sessions::tests::make_session(store).id
    }

    #[test]
    fn ordered_range_read() {
        let store = Store::open_in_memory().unwrap();
        let sid = session(&store);
        msg(&store, &sid, Role::User, "first", 1);
        msg(&store, &sid, Role::Assistant, "second", 1);
        msg(&store, &sid, Role::User, "third", 1);

        let all = store.messages_by_session(&sid).unwrap();
        let texts: Vec<_> = all.iter().map(|m| m.content.extract_all_text()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn coverage_excludes_from_view_but_not_from_store() {
        let store = Store::open_in_memory().unwrap();
        let sid = session(&store);
        let old = msg(&store, &sid, Role::User, "old", 5);
        let summary = msg(&store, &sid, Role::Summary, "summary of old", 2);
        msg(&store, &sid, Role::User, "new", 3);

        store.mark_covered(&[old.id.clone()], &summary.id).unwrap();

        let visible = store.visible_messages(&sid).unwrap();
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|m| m.id != old.id));

        // Audit surface still sees the original.
        assert_eq!(store.messages_by_session(&sid).unwrap().len(), 3);
        // Covered tokens drop out of the visible sum.
        assert_eq!(store.visible_token_sum(&sid).unwrap(), 5);
    }

    #[test]
    fn rotation_prefers_oldest_non_summary() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), 3).unwrap();
        let sid = session(&store);
        msg(&store, &sid, Role::Summary, "keep me", 1);
        msg(&store, &sid, Role::User, "a", 1);
        msg(&store, &sid, Role::User, "b", 1);
        msg(&store, &sid, Role::User, "c", 1);

        let all = store.messages_by_session(&sid).unwrap();
        assert_eq!(all.len(), 3);
        // The summary survived; the oldest user row rotated.
        assert!(all.iter().any(|m| m.is_summary));
        assert!(all.iter().all(|m| m.content.extract_all_text() != "a"));
    }
}
