//! The single durable store (SQLite) behind the runtime.
//!
//! One writer connection guarded by a mutex gives per-row atomicity;
//! cross-row consistency for a session is the orchestrator's job (it
//! confines session writes to that session's worker). Timestamps are
//! monotonic: if the wall clock regresses, the store substitutes
//! `last + 1 µs`.

mod audit;
mod events;
mod integrations;
mod messages;
mod policies;
mod recovery;
mod schema;
mod sessions;
mod tasks;
mod tool_calls;

pub use audit::AuditQuery;
pub use recovery::RecoveryReport;
pub use tool_calls::ToolCallUpdate;

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

use hearth_domain::error::{Error, Result};

/// Database file name inside the data directory.
pub const DB_FILE: &str = "hearth.db";

pub struct Store {
    conn: Mutex<Connection>,
    /// Last issued timestamp in microseconds, for monotonicity.
    last_ts_micros: Mutex<i64>,
    /// Oldest non-summary messages beyond this cap are rotated out.
    max_messages_per_session: usize,
}

impl Store {
    /// Open (or create) the store at `data_dir/hearth.db` and run
    /// pending migrations. Refuses stores written by a newer runtime.
    pub fn open(data_dir: &Path, max_messages_per_session: usize) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("creating {}: {e}", data_dir.display())))?;
        let path = data_dir.join(DB_FILE);
        let conn = Connection::open(&path)
            .map_err(|e| Error::Storage(format!("opening {}: {e}", path.display())))?;
        Self::from_connection(conn, max_messages_per_session)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("opening in-memory db: {e}")))?;
        Self::from_connection(conn, 10_000)
    }

    fn from_connection(conn: Connection, max_messages_per_session: usize) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(sql_err)?;

        schema::migrate(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            last_ts_micros: Mutex::new(0),
            max_messages_per_session,
        };
        Ok(store)
    }

    /// Current time, guaranteed strictly later than any previously
    /// issued store timestamp.
    pub fn now(&self) -> DateTime<Utc> {
        let mut last = self.last_ts_micros.lock();
        let wall = Utc::now().timestamp_micros();
        let issued = if wall > *last { wall } else { *last + 1 };
        *last = issued;
        Utc.timestamp_micros(issued)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Run `f` with the connection lock held.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(sql_err)
    }

    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        f(&mut conn).map_err(sql_err)
    }
}

pub(crate) fn sql_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Store micros since epoch; read back as `DateTime<Utc>`.
pub(crate) fn ts_to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub(crate) fn micros_to_ts(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_strictly_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let mut prev = store.now();
        for _ in 0..100 {
            let next = store.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn open_creates_db_file() {
        let dir = tempfile::tempdir().unwrap();
        let _store = Store::open(dir.path(), 100).unwrap();
        assert!(dir.path().join(DB_FILE).exists());
    }

    #[test]
    fn reopen_preserves_schema() {
        let dir = tempfile::tempdir().unwrap();
        drop(Store::open(dir.path(), 100).unwrap());
        // Second open applies zero migrations and succeeds.
        let _again = Store::open(dir.path(), 100).unwrap();
    }
}
