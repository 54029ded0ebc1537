//! Replayable event rows.
//!
//! Only events on non-ephemeral topics are persisted. The bus reads
//! them back when a subscriber reconnects with a sequence checkpoint.

use rusqlite::{params, Row};

use hearth_domain::error::Result;
use hearth_domain::event::{Event, Topic};

use crate::{micros_to_ts, ts_to_micros, Store};

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let topic: String = row.get("topic")?;
    let payload: String = row.get("payload")?;
    Ok(Event {
        topic: Topic::parse(&topic).unwrap_or(Topic::TraceEvent),
        session_id: Some(row.get("session_id")?),
        sequence: Some(row.get::<_, i64>("sequence")? as u64),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        timestamp: micros_to_ts(row.get("created_at")?),
    })
}

impl Store {
    /// Persist an event for replay. The caller guarantees `session_id`
    /// and `sequence` are set and the topic is not ephemeral.
    pub fn persist_event(&self, event: &Event) -> Result<()> {
        let (Some(session_id), Some(sequence)) = (&event.session_id, event.sequence) else {
            return Ok(());
        };
        let payload = serde_json::to_string(&event.payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO events (session_id, sequence, topic, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_id,
                    sequence as i64,
                    event.topic.as_str(),
                    payload,
                    ts_to_micros(event.timestamp),
                ],
            )?;
            Ok(())
        })
    }

    /// Events for a session with sequence strictly greater than `after`.
    pub fn events_after(&self, session_id: &str, after: u64) -> Result<Vec<Event>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM events WHERE session_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC",
            )?;
            let rows = stmt.query_map(params![session_id, after as i64], row_to_event)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_returns_strictly_after_checkpoint() {
        let store = Store::open_in_memory().unwrap();
        let session = crate::sessions::tests::make_session(&store);

        for i in 1..=3u64 {
            let mut event = Event::for_session(
                Topic::SessionMessage,
                session.id.clone(),
                serde_json::json!({"n": i}),
            );
            event.sequence = Some(i);
            store.persist_event(&event).unwrap();
        }

        let replayed = store.events_after(&session.id, 1).unwrap();
        let seqs: Vec<_> = replayed.iter().filter_map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn duplicate_sequence_is_ignored() {
        let store = Store::open_in_memory().unwrap();
        let session = crate::sessions::tests::make_session(&store);

        let mut event = Event::for_session(
            Topic::SessionMessage,
            session.id.clone(),
            serde_json::json!({"v": 1}),
        );
        event.sequence = Some(7);
        store.persist_event(&event).unwrap();
        event.payload = serde_json::json!({"v": 2});
        store.persist_event(&event).unwrap();

        let replayed = store.events_after(&session.id, 6).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].payload, serde_json::json!({"v": 1}));
    }

    #[test]
    fn events_without_session_are_not_persisted() {
        let store = Store::open_in_memory().unwrap();
        let event = Event::new(Topic::TaskFired, serde_json::json!({}));
        store.persist_event(&event).unwrap();
        // Nothing to read back; no panic, no row.
    }
}
