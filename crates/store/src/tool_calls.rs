//! ToolCall rows with the monotonic state machine enforced at the
//! storage boundary: a backward or terminal-to-anything transition is a
//! `Conflict`, not a silent overwrite.

use rusqlite::{params, OptionalExtension, Row};

use hearth_domain::error::{Error, Result};
use hearth_domain::tool::{ApprovalScope, ToolCall, ToolCallStatus};

use crate::{micros_to_ts, ts_to_micros, Store};

fn row_to_tool_call(row: &Row<'_>) -> rusqlite::Result<ToolCall> {
    let status: String = row.get("status")?;
    let scope: String = row.get("approval_scope")?;
    let arguments: String = row.get("arguments")?;
    Ok(ToolCall {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        message_id: row.get("message_id")?,
        tool_name: row.get("tool_name")?,
        arguments: serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null),
        result: row.get("result")?,
        status: ToolCallStatus::parse(&status).unwrap_or(ToolCallStatus::Failed),
        approval_scope: ApprovalScope::parse(&scope).unwrap_or_default(),
        started_at: micros_to_ts(row.get("started_at")?),
        completed_at: row
            .get::<_, Option<i64>>("completed_at")?
            .map(micros_to_ts),
        duration_ms: row.get::<_, Option<i64>>("duration_ms")?.map(|n| n as u64),
        error: row.get("error")?,
    })
}

/// Mutations applied alongside a status advance.
#[derive(Debug, Default)]
pub struct ToolCallUpdate {
    pub result: Option<String>,
    pub error: Option<String>,
    pub approval_scope: Option<ApprovalScope>,
}

impl Store {
    pub fn insert_tool_call(&self, call: &ToolCall) -> Result<()> {
        let arguments = serde_json::to_string(&call.arguments)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_calls (id, session_id, message_id, tool_name, arguments,
                     result, status, approval_scope, started_at, completed_at, duration_ms, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    call.id,
                    call.session_id,
                    call.message_id,
                    call.tool_name,
                    arguments,
                    call.result,
                    call.status.as_str(),
                    call.approval_scope.as_str(),
                    ts_to_micros(call.started_at),
                    call.completed_at.map(ts_to_micros),
                    call.duration_ms.map(|n| n as i64),
                    call.error,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_tool_call(&self, id: &str) -> Result<Option<ToolCall>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM tool_calls WHERE id = ?1",
                params![id],
                row_to_tool_call,
            )
            .optional()
        })
    }

    pub fn tool_calls_by_session(&self, session_id: &str) -> Result<Vec<ToolCall>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tool_calls WHERE session_id = ?1 ORDER BY started_at ASC",
            )?;
            let rows = stmt.query_map(params![session_id], row_to_tool_call)?;
            rows.collect()
        })
    }

    /// Advance a tool call through its state graph. Terminal states set
    /// `completed_at` and `duration_ms`.
    pub fn advance_tool_call(
        &self,
        id: &str,
        next: ToolCallStatus,
        update: ToolCallUpdate,
    ) -> Result<ToolCall> {
        let current = self
            .get_tool_call(id)?
            .ok_or_else(|| Error::NotFound(format!("tool call {id}")))?;

        if !current.status.may_advance_to(next) {
            return Err(Error::Conflict(format!(
                "tool call {id}: illegal transition {} -> {}",
                current.status.as_str(),
                next.as_str()
            )));
        }

        let now = self.now();
        let (completed_at, duration_ms) = if next.is_terminal() {
            let dur = (now - current.started_at).num_milliseconds().max(0) as i64;
            (Some(ts_to_micros(now)), Some(dur))
        } else {
            (None, None)
        };

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tool_calls SET
                     status = ?2,
                     result = COALESCE(?3, result),
                     error = COALESCE(?4, error),
                     approval_scope = COALESCE(?5, approval_scope),
                     completed_at = COALESCE(?6, completed_at),
                     duration_ms = COALESCE(?7, duration_ms)
                 WHERE id = ?1",
                params![
                    id,
                    next.as_str(),
                    update.result,
                    update.error,
                    update.approval_scope.map(|s| s.as_str()),
                    completed_at,
                    duration_ms,
                ],
            )?;
            Ok(())
        })?;

        self.get_tool_call(id)?
            .ok_or_else(|| Error::NotFound(format!("tool call {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_domain::tool::ToolRequest;

    fn setup() -> (Store, ToolCall) {
        let store = Store::open_in_memory().unwrap();
        let session = crate::sessions::tests::make_session(&store);
        let request = ToolRequest {
            call_id: "prov_1".into(),
            tool_name: "shell.exec".into(),
            arguments: serde_json::json!({"command": "ls"}),
        };
        let call = ToolCall::new(&session.id, "msg_x", &request);
        store.insert_tool_call(&call).unwrap();
        (store, call)
    }

    #[test]
    fn happy_path_advances() {
        let (store, call) = setup();
        store
            .advance_tool_call(&call.id, ToolCallStatus::Approved, ToolCallUpdate::default())
            .unwrap();
        store
            .advance_tool_call(&call.id, ToolCallStatus::Executing, ToolCallUpdate::default())
            .unwrap();
        let done = store
            .advance_tool_call(
                &call.id,
                ToolCallStatus::Completed,
                ToolCallUpdate {
                    result: Some("ok".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(done.status, ToolCallStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("ok"));
        assert!(done.completed_at.is_some());
        assert!(done.duration_ms.is_some());
    }

    #[test]
    fn backward_transition_is_conflict() {
        let (store, call) = setup();
        store
            .advance_tool_call(&call.id, ToolCallStatus::Approved, ToolCallUpdate::default())
            .unwrap();
        let err = store
            .advance_tool_call(
                &call.id,
                ToolCallStatus::PendingApproval,
                ToolCallUpdate::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn terminal_is_frozen() {
        let (store, call) = setup();
        store
            .advance_tool_call(&call.id, ToolCallStatus::Denied, ToolCallUpdate::default())
            .unwrap();
        for next in [
            ToolCallStatus::Approved,
            ToolCallStatus::Executing,
            ToolCallStatus::Failed,
        ] {
            assert!(store
                .advance_tool_call(&call.id, next, ToolCallUpdate::default())
                .is_err());
        }
    }
}
