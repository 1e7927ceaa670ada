//! Lease-based leader election.
//!
//! The leader row is a singleton. Leadership is a time-bounded lease plus a
//! monotonic term; the term doubles as a fencing token. Take-over of an
//! expired lease is a conditional update guarded by `WHERE term = ?`, so
//! when two candidates race on the same observed term at most one write
//! lands.
//!
//! Callers are expected to invoke these functions inside a store
//! transaction; the read-modify-write in [`try_acquire`] is only atomic
//! under `BEGIN IMMEDIATE`.

use chrono::{Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::{event, util};

/// The current leader row.
#[derive(Debug, Clone, Serialize)]
pub struct Leader {
    /// Agent currently holding the lease.
    pub agent_id: String,
    /// Monotonic leadership epoch.
    pub term: i64,
    /// When the lease runs out.
    pub lease_expires_at: String,
    /// When this leader was elected.
    pub elected_at: String,
}

impl Leader {
    /// Whether the lease has already run out.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        util::parse_rfc3339(&self.lease_expires_at) <= Utc::now()
    }
}

/// Outcome of a leadership attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquire {
    /// Whether the caller holds the lease after the attempt.
    pub is_leader: bool,
    /// The term held; 0 when the attempt failed.
    pub term: i64,
}

/// Reads the leader row, if one exists.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(conn: &Connection) -> Result<Option<Leader>> {
    Ok(conn
        .query_row(
            "SELECT agent_id, term, lease_expires_at, elected_at FROM leader WHERE id = 1",
            [],
            |row| {
                Ok(Leader {
                    agent_id: row.get(0)?,
                    term: row.get(1)?,
                    lease_expires_at: row.get(2)?,
                    elected_at: row.get(3)?,
                })
            },
        )
        .optional()?)
}

/// The current term, or 0 when no leader has ever been elected.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn current_term(conn: &Connection) -> Result<i64> {
    Ok(get(conn)?.map_or(0, |leader| leader.term))
}

/// Whether `agent_id` currently holds an unexpired lease.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn is_leader(conn: &Connection, agent_id: &str) -> Result<bool> {
    Ok(get(conn)?.is_some_and(|leader| leader.agent_id == agent_id && !leader.is_expired()))
}

/// Attempts to become or remain leader.
///
/// - No row: insert with term 1.
/// - Valid lease held by caller: renew, same term.
/// - Valid lease held by someone else: failure.
/// - Expired lease: take over at term + 1, fenced by the observed term.
///
/// # Errors
///
/// Returns an error if the store rejects a statement.
pub fn try_acquire(conn: &Connection, agent_id: &str, lease_seconds: u64) -> Result<Acquire> {
    let now = Utc::now();
    let now_text = util::to_rfc3339(now);
    let expires_text = util::to_rfc3339(now + Duration::seconds(lease_seconds as i64));

    let Some(current) = get(conn)? else {
        conn.execute(
            "INSERT INTO leader (id, agent_id, term, lease_expires_at, elected_at)
             VALUES (1, ?1, 1, ?2, ?3)",
            params![agent_id, expires_text, now_text],
        )?;
        info!(agent_id, term = 1, "first leader elected");
        event::log(
            conn,
            "leader_elected",
            Some(agent_id),
            None,
            Some(serde_json::json!({ "term": 1, "reason": "first_leader" })),
        )?;
        return Ok(Acquire {
            is_leader: true,
            term: 1,
        });
    };

    if util::parse_rfc3339(&current.lease_expires_at) > now {
        if current.agent_id == agent_id {
            conn.execute(
                "UPDATE leader SET lease_expires_at = ?1 WHERE id = 1",
                params![expires_text],
            )?;
            return Ok(Acquire {
                is_leader: true,
                term: current.term,
            });
        }
        return Ok(Acquire {
            is_leader: false,
            term: 0,
        });
    }

    // Lease expired: take over, fenced on the term we read.
    let new_term = current.term + 1;
    let updated = conn.execute(
        "UPDATE leader
         SET agent_id = ?1, term = ?2, lease_expires_at = ?3, elected_at = ?4
         WHERE id = 1 AND term = ?5",
        params![agent_id, new_term, expires_text, now_text, current.term],
    )?;

    if updated == 1 {
        info!(agent_id, term = new_term, "leadership taken over");
        event::log(
            conn,
            "leader_elected",
            Some(agent_id),
            None,
            Some(serde_json::json!({
                "term": new_term,
                "reason": "lease_expired",
                "previous_leader": current.agent_id,
            })),
        )?;
        return Ok(Acquire {
            is_leader: true,
            term: new_term,
        });
    }

    Ok(Acquire {
        is_leader: false,
        term: 0,
    })
}

/// Leader-guarded lease renewal: the fencing primitive.
///
/// The update carries `AND agent_id = ? AND term = ?`; a deposed leader
/// writes zero rows and learns it lost leadership. Administrative writes
/// that require leadership call this first and abort when it fails.
///
/// # Errors
///
/// Returns an error if the store rejects the statement.
pub fn renew_fenced(conn: &Connection, agent_id: &str, term: i64, lease_seconds: u64) -> Result<bool> {
    let expires_text = util::to_rfc3339(Utc::now() + Duration::seconds(lease_seconds as i64));
    let updated = conn.execute(
        "UPDATE leader SET lease_expires_at = ?1
         WHERE id = 1 AND agent_id = ?2 AND term = ?3",
        params![expires_text, agent_id, term],
    )?;
    Ok(updated == 1)
}

/// Voluntary step-down: expires the caller's own lease in place.
///
/// The term is preserved so the next take-over still increments it.
/// Returns `false` when the caller was not the leader.
///
/// # Errors
///
/// Returns an error if the store rejects the statement.
pub fn step_down(conn: &Connection, agent_id: &str) -> Result<bool> {
    let now_text = util::now_rfc3339();
    let updated = conn.execute(
        "UPDATE leader SET lease_expires_at = ?1 WHERE id = 1 AND agent_id = ?2",
        params![now_text, agent_id],
    )?;
    if updated == 1 {
        info!(agent_id, "leader stepped down");
        event::log(conn, "leader_stepped_down", Some(agent_id), None, None)?;
    }
    Ok(updated == 1)
}
