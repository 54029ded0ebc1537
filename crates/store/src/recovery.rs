//! Startup crash-recovery sweep.
//!
//! After an unclean shutdown, tool calls and task runs can be stranded
//! in non-terminal execution states. The sweep marks them `failed` with
//! reason "interrupted", fails the owning sessions, and audits every
//! action — restart must never leave a record mid-flight.

use rusqlite::params;

use hearth_domain::audit::{AuditEntry, AuditOutcome};
use hearth_domain::error::Result;
use hearth_domain::session::SessionStatus;

use crate::{ts_to_micros, Store};

/// What the sweep found and repaired.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub interrupted_tool_calls: Vec<String>,
    pub interrupted_task_runs: Vec<String>,
    pub failed_sessions: Vec<String>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.interrupted_tool_calls.is_empty() && self.interrupted_task_runs.is_empty()
    }
}

const LIVE_TOOL_STATES: &str = "('pending_policy', 'pending_approval', 'approved', 'executing')";

impl Store {
    /// Run the sweep. Called once, immediately after `open`.
    pub fn recover_interrupted(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = ts_to_micros(self.now());

        // Tool calls stranded in live states.
        let stranded: Vec<(String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, session_id FROM tool_calls WHERE status IN {LIVE_TOOL_STATES}"
            ))?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;

        for (id, session_id) in &stranded {
            self.with_conn(|conn| {
                conn.execute(
                    "UPDATE tool_calls SET status = 'failed', error = 'interrupted',
                         completed_at = ?2
                     WHERE id = ?1",
                    params![id, now],
                )?;
                Ok(())
            })?;
            self.append_audit(&AuditEntry::new(
                "recovery",
                "tool_call.interrupted",
                "tool_call",
                id.clone(),
                AuditOutcome::Failed,
                serde_json::json!({ "session_id": session_id, "reason": "interrupted" }),
            ))?;
            report.interrupted_tool_calls.push(id.clone());

            if !report.failed_sessions.contains(session_id) {
                self.set_session_status(session_id, SessionStatus::Failed)?;
                self.append_audit(&AuditEntry::new(
                    "recovery",
                    "session.failed",
                    "session",
                    session_id.clone(),
                    AuditOutcome::Failed,
                    serde_json::json!({ "reason": "interrupted tool call" }),
                ))?;
                report.failed_sessions.push(session_id.clone());
            }
        }

        // Task runs left running.
        let running: Vec<String> = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM task_runs WHERE status = 'running'")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })?;

        for id in &running {
            self.with_conn(|conn| {
                conn.execute(
                    "UPDATE task_runs SET status = 'failed', error = 'interrupted',
                         completed_at = ?2
                     WHERE id = ?1",
                    params![id, now],
                )?;
                Ok(())
            })?;
            self.append_audit(&AuditEntry::new(
                "recovery",
                "task_run.interrupted",
                "task_run",
                id.clone(),
                AuditOutcome::Failed,
                serde_json::json!({ "reason": "interrupted" }),
            ))?;
            report.interrupted_task_runs.push(id.clone());
        }

        if !report.is_clean() {
            tracing::warn!(
                tool_calls = report.interrupted_tool_calls.len(),
                task_runs = report.interrupted_task_runs.len(),
                sessions = report.failed_sessions.len(),
                "recovered interrupted work from previous run"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hearth_domain::id;
    use hearth_domain::task::{TaskRun, TaskRunStatus};
    use hearth_domain::tool::{ToolCall, ToolCallStatus, ToolRequest};

    #[test]
    fn sweep_fails_stranded_tool_calls_and_sessions() {
        let store = Store::open_in_memory().unwrap();
        let session = crate::sessions::tests::make_session(&store);

        let request = ToolRequest {
            call_id: "c1".into(),
            tool_name: "shell.exec".into(),
            arguments: serde_json::json!({}),
        };
        let mut call = ToolCall::new(&session.id, "msg_1", &request);
        call.status = ToolCallStatus::Executing;
        store.insert_tool_call(&call).unwrap();

        let report = store.recover_interrupted().unwrap();
        assert_eq!(report.interrupted_tool_calls, vec![call.id.clone()]);
        assert_eq!(report.failed_sessions, vec![session.id.clone()]);

        let got = store.get_tool_call(&call.id).unwrap().unwrap();
        assert_eq!(got.status, ToolCallStatus::Failed);
        assert_eq!(got.error.as_deref(), Some("interrupted"));

        let s = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Failed);

        // Every repair is audited.
        assert!(store.count_audit().unwrap() >= 2);
    }

    #[test]
    fn sweep_fails_running_task_runs() {
        let store = Store::open_in_memory().unwrap();
        let task = crate::tasks::tests::make_task(&store, None);
        let run = TaskRun {
            id: id::new_id(id::TASK_RUN),
            task_id: task.id.clone(),
            run_number: 1,
            attempt_number: 1,
            started_at: Utc::now(),
            completed_at: None,
            status: TaskRunStatus::Running,
            tokens_used: 0,
            cost: 0.0,
            error: None,
            result: None,
        };
        store.insert_task_run(&run).unwrap();

        let report = store.recover_interrupted().unwrap();
        assert_eq!(report.interrupted_task_runs, vec![run.id.clone()]);

        let runs = store.runs_for_task(&task.id).unwrap();
        assert_eq!(runs[0].status, TaskRunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn clean_store_reports_clean() {
        let store = Store::open_in_memory().unwrap();
        let report = store.recover_interrupted().unwrap();
        assert!(report.is_clean());
        assert!(report.failed_sessions.is_empty());
    }
}
