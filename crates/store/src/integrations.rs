//! Channel integration rows and the session-key binding table that maps
//! (channel, external thread) to a stable session.

use rusqlite::{params, OptionalExtension, Row};

use hearth_domain::error::Result;
use hearth_domain::integration::{ChannelIntegration, IntegrationStatus};

use crate::{micros_to_ts, ts_to_micros, Store};

fn row_to_integration(row: &Row<'_>) -> rusqlite::Result<ChannelIntegration> {
    let status: String = row.get("status")?;
    let config: String = row.get("config")?;
    Ok(ChannelIntegration {
        id: row.get("id")?,
        kind: row.get("kind")?,
        name: row.get("name")?,
        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
        enabled: row.get::<_, i64>("enabled")? != 0,
        workspace_id: row.get("workspace_id")?,
        last_connected_at: row
            .get::<_, Option<i64>>("last_connected_at")?
            .map(micros_to_ts),
        status: IntegrationStatus::parse(&status).unwrap_or(IntegrationStatus::Disconnected),
    })
}

impl Store {
    pub fn upsert_integration(&self, integration: &ChannelIntegration) -> Result<()> {
        let config = serde_json::to_string(&integration.config)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO integrations (id, kind, name, config, enabled, workspace_id,
                     last_connected_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     config = excluded.config,
                     enabled = excluded.enabled,
                     last_connected_at = excluded.last_connected_at,
                     status = excluded.status",
                params![
                    integration.id,
                    integration.kind,
                    integration.name,
                    config,
                    integration.enabled as i64,
                    integration.workspace_id,
                    integration.last_connected_at.map(ts_to_micros),
                    integration.status.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_integration(&self, id: &str) -> Result<Option<ChannelIntegration>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM integrations WHERE id = ?1",
                params![id],
                row_to_integration,
            )
            .optional()
        })
    }

    pub fn list_integrations(&self) -> Result<Vec<ChannelIntegration>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM integrations ORDER BY name ASC")?;
            let rows = stmt.query_map([], row_to_integration)?;
            rows.collect()
        })
    }

    pub fn delete_integration(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM integrations WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    pub fn set_integration_status(&self, id: &str, status: IntegrationStatus) -> Result<()> {
        let now = ts_to_micros(self.now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE integrations SET status = ?2,
                     last_connected_at = CASE WHEN ?2 = 'connected' THEN ?3
                                              ELSE last_connected_at END
                 WHERE id = ?1",
                params![id, status.as_str(), now],
            )?;
            Ok(())
        })
    }

    // ── Session-key bindings ─────────────────────────────────────────

    pub fn bind_session_key(
        &self,
        channel_id: &str,
        external_thread_id: &str,
        session_id: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_keys (channel_id, external_thread_id, session_id)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(channel_id, external_thread_id)
                 DO UPDATE SET session_id = excluded.session_id",
                params![channel_id, external_thread_id, session_id],
            )?;
            Ok(())
        })
    }

    /// Reverse lookup: the channel threads bound to a session (used for
    /// outbound delivery).
    pub fn bindings_for_session(&self, session_id: &str) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT channel_id, external_thread_id FROM session_keys WHERE session_id = ?1",
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect()
        })
    }

    pub fn lookup_session_key(
        &self,
        channel_id: &str,
        external_thread_id: &str,
    ) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT session_id FROM session_keys
                 WHERE channel_id = ?1 AND external_thread_id = ?2",
                params![channel_id, external_thread_id],
                |row| row.get(0),
            )
            .optional()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_domain::id;

    #[test]
    fn integration_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let integ = ChannelIntegration {
            id: id::new_id(id::INTEGRATION),
            kind: "webhook".into(),
            name: "ops hook".into(),
            config: serde_json::json!({"secret_ref": "hearth/hook", "reply_url": "http://x"}),
            enabled: true,
            workspace_id: "ws1".into(),
            last_connected_at: None,
            status: IntegrationStatus::Disconnected,
        };
        store.upsert_integration(&integ).unwrap();

        store
            .set_integration_status(&integ.id, IntegrationStatus::Connected)
            .unwrap();
        let got = store.get_integration(&integ.id).unwrap().unwrap();
        assert_eq!(got.status, IntegrationStatus::Connected);
        assert!(got.last_connected_at.is_some());
    }

    #[test]
    fn binding_survives_and_cascades_with_session() {
        let store = Store::open_in_memory().unwrap();
        let session = crate::sessions::tests::make_session(&store);

        store
            .bind_session_key("chn_1", "thread-42", &session.id)
            .unwrap();
        assert_eq!(
            store.lookup_session_key("chn_1", "thread-42").unwrap(),
            Some(session.id.clone())
        );
        assert_eq!(store.lookup_session_key("chn_1", "other").unwrap(), None);

        store.delete_session(&session.id).unwrap();
        assert_eq!(store.lookup_session_key("chn_1", "thread-42").unwrap(), None);
    }
}
