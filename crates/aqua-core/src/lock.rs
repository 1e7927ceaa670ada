//! Exclusive file locks.
//!
//! A lock is a row keyed by path: insertion either succeeds or collides
//! with the current owner, so acquisition is atomic without any
//! read-then-write window. Locks are advisory between agents; nothing
//! touches the filesystem.

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::{event, util};

/// An exclusive lock on a path.
#[derive(Debug, Clone, Serialize)]
pub struct FileLock {
    /// The locked path, as given by the owner.
    pub file_path: String,
    /// Agent id of the owner.
    pub agent_id: String,
    /// When the lock was taken.
    pub locked_at: String,
}

/// Acquires an exclusive lock on `path` for `agent_id`.
///
/// # Errors
///
/// Returns [`Error::LockHeld`] with the current owner if the path is
/// already locked (including by the caller).
pub fn acquire(conn: &Connection, path: &str, agent_id: &str) -> Result<FileLock> {
    let now = util::now_rfc3339();
    let inserted = conn.execute(
        "INSERT INTO file_locks (file_path, agent_id, locked_at) VALUES (?1, ?2, ?3)",
        params![path, agent_id, now],
    );

    match inserted {
        Ok(_) => {},
        Err(cause)
            if matches!(
                cause.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) =>
        {
            let owner = get(conn, path)?.map_or_else(|| "unknown".to_string(), |l| l.agent_id);
            return Err(Error::LockHeld {
                path: path.into(),
                owner,
            });
        },
        Err(cause) => return Err(cause.into()),
    }

    event::log(
        conn,
        "file_locked",
        Some(agent_id),
        None,
        Some(serde_json::json!({ "file": path })),
    )?;

    Ok(FileLock {
        file_path: path.to_string(),
        agent_id: agent_id.to_string(),
        locked_at: now,
    })
}

/// Releases a lock the caller owns.
///
/// # Errors
///
/// Returns [`Error::PermissionDenied`] when the lock belongs to another
/// agent or the path is not locked at all; the reason names the owner.
pub fn release(conn: &Connection, path: &str, agent_id: &str) -> Result<()> {
    let deleted = conn.execute(
        "DELETE FROM file_locks WHERE file_path = ?1 AND agent_id = ?2",
        params![path, agent_id],
    )?;

    if deleted == 0 {
        let reason = match get(conn, path)? {
            Some(lock) => format!("{path} is locked by {}, not by you", lock.agent_id),
            None => format!("{path} is not locked"),
        };
        return Err(Error::PermissionDenied { reason });
    }

    event::log(
        conn,
        "file_unlocked",
        Some(agent_id),
        None,
        Some(serde_json::json!({ "file": path })),
    )?;
    Ok(())
}

/// Releases every lock an agent holds, unconditionally. Used on leave and
/// by the recovery sweep. Returns how many locks were released.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn release_all(conn: &Connection, agent_id: &str) -> Result<usize> {
    let released = conn.execute(
        "DELETE FROM file_locks WHERE agent_id = ?1",
        params![agent_id],
    )?;
    Ok(released)
}

/// Lock info for one path.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(conn: &Connection, path: &str) -> Result<Option<FileLock>> {
    Ok(conn
        .query_row(
            "SELECT file_path, agent_id, locked_at FROM file_locks WHERE file_path = ?1",
            params![path],
            row_to_lock,
        )
        .optional()?)
}

/// Every lock, newest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn all(conn: &Connection) -> Result<Vec<FileLock>> {
    let mut stmt = conn.prepare(
        "SELECT file_path, agent_id, locked_at FROM file_locks ORDER BY locked_at DESC",
    )?;
    let rows = stmt
        .query_map([], row_to_lock)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Locks held by one agent, newest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn held_by(conn: &Connection, agent_id: &str) -> Result<Vec<FileLock>> {
    let mut stmt = conn.prepare(
        "SELECT file_path, agent_id, locked_at FROM file_locks
         WHERE agent_id = ?1 ORDER BY locked_at DESC",
    )?;
    let rows = stmt
        .query_map(params![agent_id], row_to_lock)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileLock> {
    Ok(FileLock {
        file_path: row.get(0)?,
        agent_id: row.get(1)?,
        locked_at: row.get(2)?,
    })
}
