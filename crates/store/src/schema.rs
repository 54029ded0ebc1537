//! Versioned schema migrations.
//!
//! `PRAGMA user_version` records the applied version; migrations run in
//! order inside a transaction each. A store whose version exceeds the
//! runtime's known set refuses to open — downgrade is not supported.

use rusqlite::Connection;

use hearth_domain::error::{Error, Result};

use crate::sql_err;

/// Migration N lives at index N-1.
const MIGRATIONS: &[&str] = &[
    // v1 — initial schema.
    r#"
    CREATE TABLE sessions (
        id               TEXT PRIMARY KEY,
        workspace_id     TEXT NOT NULL,
        title            TEXT NOT NULL,
        model_id         TEXT NOT NULL,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL,
        total_tokens     INTEGER NOT NULL DEFAULT 0,
        total_cost       REAL NOT NULL DEFAULT 0,
        status           TEXT NOT NULL DEFAULT 'active',
        sequence_counter INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX idx_sessions_workspace ON sessions(workspace_id, updated_at DESC);

    CREATE TABLE messages (
        id           TEXT PRIMARY KEY,
        session_id   TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        role         TEXT NOT NULL,
        content      TEXT NOT NULL,
        tool_call_id TEXT,
        tokens_in    INTEGER NOT NULL DEFAULT 0,
        tokens_out   INTEGER NOT NULL DEFAULT 0,
        created_at   INTEGER NOT NULL,
        is_summary   INTEGER NOT NULL DEFAULT 0,
        covered_by   TEXT
    );
    CREATE INDEX idx_messages_session ON messages(session_id, created_at);

    CREATE TABLE tool_calls (
        id             TEXT PRIMARY KEY,
        session_id     TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        message_id     TEXT NOT NULL,
        tool_name      TEXT NOT NULL,
        arguments      TEXT NOT NULL,
        result         TEXT,
        status         TEXT NOT NULL,
        approval_scope TEXT NOT NULL DEFAULT 'once',
        started_at     INTEGER NOT NULL,
        completed_at   INTEGER,
        duration_ms    INTEGER,
        error          TEXT
    );
    CREATE INDEX idx_tool_calls_session ON tool_calls(session_id, started_at);
    CREATE INDEX idx_tool_calls_status ON tool_calls(status);

    CREATE TABLE audit (
        id              TEXT PRIMARY KEY,
        ts              INTEGER NOT NULL,
        actor           TEXT NOT NULL,
        action          TEXT NOT NULL,
        resource_type   TEXT NOT NULL,
        resource_id     TEXT NOT NULL,
        details         TEXT NOT NULL,
        outcome         TEXT NOT NULL,
        redaction_flags TEXT NOT NULL DEFAULT '[]'
    );
    CREATE INDEX idx_audit_ts ON audit(ts);
    CREATE INDEX idx_audit_resource ON audit(resource_type, resource_id);

    CREATE TABLE policies (
        id                   TEXT PRIMARY KEY,
        workspace_id         TEXT NOT NULL,
        selector             TEXT NOT NULL,
        action               TEXT NOT NULL,
        scope                TEXT NOT NULL DEFAULT 'once',
        domains              TEXT NOT NULL DEFAULT '[]',
        argument_constraints TEXT,
        expires_at           INTEGER
    );
    CREATE INDEX idx_policies_workspace ON policies(workspace_id);

    CREATE TABLE approvals (
        id           TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        session_id   TEXT,
        tool_name    TEXT NOT NULL,
        fingerprint  TEXT NOT NULL,
        scope        TEXT NOT NULL,
        created_at   INTEGER NOT NULL,
        expires_at   INTEGER
    );
    CREATE INDEX idx_approvals_lookup ON approvals(workspace_id, tool_name, fingerprint);

    CREATE TABLE tasks (
        id            TEXT PRIMARY KEY,
        name          TEXT NOT NULL,
        workspace_id  TEXT NOT NULL,
        trigger       TEXT NOT NULL,
        action        TEXT NOT NULL,
        target_device TEXT,
        retry_policy  TEXT NOT NULL,
        budget        TEXT,
        status        TEXT NOT NULL DEFAULT 'active',
        next_fire_at  INTEGER,
        last_fire_at  INTEGER,
        attempts      INTEGER NOT NULL DEFAULT 0,
        created_at    INTEGER NOT NULL,
        updated_at    INTEGER NOT NULL
    );
    CREATE INDEX idx_tasks_next_fire ON tasks(status, next_fire_at);

    CREATE TABLE task_runs (
        id             TEXT PRIMARY KEY,
        task_id        TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        run_number     INTEGER NOT NULL,
        attempt_number INTEGER NOT NULL,
        started_at     INTEGER NOT NULL,
        completed_at   INTEGER,
        status         TEXT NOT NULL,
        tokens_used    INTEGER NOT NULL DEFAULT 0,
        cost           REAL NOT NULL DEFAULT 0,
        error          TEXT,
        result         TEXT
    );
    CREATE INDEX idx_task_runs_task ON task_runs(task_id, started_at);
    CREATE INDEX idx_task_runs_status ON task_runs(status);

    CREATE TABLE integrations (
        id                TEXT PRIMARY KEY,
        kind              TEXT NOT NULL,
        name              TEXT NOT NULL,
        config            TEXT NOT NULL,
        enabled           INTEGER NOT NULL DEFAULT 1,
        workspace_id      TEXT NOT NULL,
        last_connected_at INTEGER,
        status            TEXT NOT NULL DEFAULT 'disconnected'
    );

    CREATE TABLE session_keys (
        channel_id         TEXT NOT NULL,
        external_thread_id TEXT NOT NULL,
        session_id         TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        PRIMARY KEY (channel_id, external_thread_id)
    );

    CREATE TABLE events (
        session_id TEXT NOT NULL,
        sequence   INTEGER NOT NULL,
        topic      TEXT NOT NULL,
        payload    TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (session_id, sequence)
    );
    "#,
    // v2 — per-session fallback chains (fixed at session creation).
    r#"
    ALTER TABLE sessions ADD COLUMN fallback_models TEXT NOT NULL DEFAULT '[]';
    "#,
];

pub fn migrate(conn: &Connection) -> Result<()> {
    let current: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(sql_err)?;
    let known = MIGRATIONS.len() as i64;

    if current > known {
        return Err(Error::Storage(format!(
            "schema version {current} is newer than this runtime supports ({known})"
        )));
    }

    for version in current..known {
        let sql = MIGRATIONS[version as usize];
        conn.execute_batch(&format!("BEGIN;\n{sql}\nPRAGMA user_version = {};\nCOMMIT;", version + 1))
            .map_err(|e| {
                Error::Storage(format!("migration to v{} failed: {e}", version + 1))
            })?;
        tracing::info!(version = version + 1, "applied store migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_db_migrates_to_latest() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let v: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(v, MIGRATIONS.len() as i64);
    }

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }

    #[test]
    fn refuses_future_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 99").unwrap();
        let err = migrate(&conn).unwrap_err();
        assert!(err.to_string().contains("newer than this runtime"));
    }
}
