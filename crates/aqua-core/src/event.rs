//! Append-only audit trail.
//!
//! Every state transition the kernel performs is recorded as an event row.
//! Events are never updated or deleted; the tail query is how operators and
//! agents reconstruct what happened.

use rusqlite::{Connection, params};
use serde::Serialize;

use crate::error::Result;
use crate::util;

/// An audit log record.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Monotonic row id.
    pub id: i64,
    /// When the event was recorded.
    pub timestamp: String,
    /// Event type, e.g. `leader_elected`, `task_claimed`, `agent_died`.
    pub event_type: String,
    /// Agent involved, if any.
    pub agent_id: Option<String>,
    /// Task involved, if any.
    pub task_id: Option<String>,
    /// Free-form JSON detail blob.
    pub details: Option<serde_json::Value>,
}

/// Filters for the tail query. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to one event type.
    pub event_type: Option<String>,
    /// Restrict to one agent.
    pub agent_id: Option<String>,
    /// Restrict to one task.
    pub task_id: Option<String>,
}

/// Appends an event. Callers pass `details` as a JSON value; `None` stores
/// NULL.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn log(
    conn: &Connection,
    event_type: &str,
    agent_id: Option<&str>,
    task_id: Option<&str>,
    details: Option<serde_json::Value>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO events (timestamp, event_type, agent_id, task_id, details)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            util::now_rfc3339(),
            event_type,
            agent_id,
            task_id,
            details.map(|d| d.to_string()),
        ],
    )?;
    Ok(())
}

/// Returns the newest events first, bounded by `limit`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn tail(conn: &Connection, filter: &EventFilter, limit: u32) -> Result<Vec<Event>> {
    let mut sql = String::from(
        "SELECT id, timestamp, event_type, agent_id, task_id, details
         FROM events WHERE 1=1",
    );
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(event_type) = &filter.event_type {
        sql.push_str(" AND event_type = ?");
        params.push(Box::new(event_type.clone()));
    }
    if let Some(agent_id) = &filter.agent_id {
        sql.push_str(" AND agent_id = ?");
        params.push(Box::new(agent_id.clone()));
    }
    if let Some(task_id) = &filter.task_id {
        sql.push_str(" AND task_id = ?");
        params.push(Box::new(task_id.clone()));
    }
    sql.push_str(" ORDER BY id DESC LIMIT ?");
    params.push(Box::new(i64::from(limit)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), row_to_event)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Timestamp of the newest event of one type, if any exist.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn latest_of_type(conn: &Connection, event_type: &str) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;

    Ok(conn
        .query_row(
            "SELECT timestamp FROM events WHERE event_type = ?1 ORDER BY id DESC LIMIT 1",
            params![event_type],
            |row| row.get(0),
        )
        .optional()?)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let details: Option<String> = row.get(5)?;
    Ok(Event {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        event_type: row.get(2)?,
        agent_id: row.get(3)?,
        task_id: row.get(4)?,
        details: details.and_then(|text| serde_json::from_str(&text).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn log_and_tail() {
        let store = Store::in_memory().unwrap();
        log(
            store.conn(),
            "agent_joined",
            Some("abcd1234"),
            None,
            Some(serde_json::json!({"name": "brave-falcon"})),
        )
        .unwrap();
        log(store.conn(), "task_created", None, Some("ef567890"), None).unwrap();

        let events = tail(store.conn(), &EventFilter::default(), 10).unwrap();
        assert_eq!(events.len(), 2);
        // Newest first.
        assert_eq!(events[0].event_type, "task_created");
        assert_eq!(events[1].details.as_ref().unwrap()["name"], "brave-falcon");
    }

    #[test]
    fn tail_filters_compose() {
        let store = Store::in_memory().unwrap();
        log(store.conn(), "task_claimed", Some("a1"), Some("t1"), None).unwrap();
        log(store.conn(), "task_claimed", Some("a2"), Some("t2"), None).unwrap();
        log(store.conn(), "task_completed", Some("a1"), Some("t1"), None).unwrap();

        let filter = EventFilter {
            event_type: Some("task_claimed".into()),
            agent_id: Some("a1".into()),
            ..Default::default()
        };
        let events = tail(store.conn(), &filter, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id.as_deref(), Some("t1"));
    }

    #[test]
    fn latest_of_type_picks_newest() {
        let store = Store::in_memory().unwrap();
        assert!(latest_of_type(store.conn(), "recovery_sweep")
            .unwrap()
            .is_none());

        log(store.conn(), "recovery_sweep", None, None, None).unwrap();
        log(store.conn(), "recovery_sweep", None, None, None).unwrap();

        let latest = latest_of_type(store.conn(), "recovery_sweep").unwrap();
        assert!(latest.is_some());
    }
}
