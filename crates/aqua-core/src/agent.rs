//! Agent registry.
//!
//! An agent is one registered participant in a project's quorum. Agents own
//! their own row: every kernel operation they perform refreshes the
//! heartbeat, and only the recovery sweep writes to rows it does not own.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{event, util};

/// Liveness status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Participating and heartbeating.
    Active,
    /// Registered but intentionally dormant.
    Idle,
    /// Declared dead by the recovery sweep.
    Dead,
}

impl AgentStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Dead => "dead",
        }
    }

    fn parse(text: &str) -> Self {
        match text {
            "idle" => Self::Idle,
            "dead" => Self::Dead,
            _ => Self::Active,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which AI tool drives the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Claude Code.
    Claude,
    /// Codex CLI.
    Codex,
    /// Gemini CLI.
    Gemini,
    /// Anything else.
    #[default]
    Generic,
}

impl AgentKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Generic => "generic",
        }
    }

    /// Parses a kind name, defaulting unknown values to `Generic`.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text {
            "claude" => Self::Claude,
            "codex" => Self::Codex,
            "gemini" => Self::Gemini,
            _ => Self::Generic,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered participant.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    /// Stable 8-hex identifier.
    pub id: String,
    /// Unique human-readable name.
    pub name: String,
    /// Driving tool.
    pub kind: AgentKind,
    /// OS process id; absent for AI sessions without a stable process.
    pub pid: Option<i64>,
    /// Liveness status.
    pub status: AgentStatus,
    /// Refreshed by every operation the agent performs.
    pub last_heartbeat_at: String,
    /// When the agent joined.
    pub registered_at: String,
    /// The task this agent currently holds, if any.
    pub current_task_id: Option<String>,
    /// Capability labels.
    pub capabilities: Vec<String>,
    /// Role label steering task preference.
    pub role: Option<String>,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
    /// Last progress note, restored by `refresh`.
    pub last_progress: Option<String>,
}

/// Parameters for registering a new agent.
#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    /// Unique name; the CLI generates one when absent.
    pub name: String,
    /// Driving tool.
    pub kind: AgentKind,
    /// OS process id of the joining client.
    pub pid: Option<i64>,
    /// Capability labels.
    pub capabilities: Vec<String>,
    /// Role label.
    pub role: Option<String>,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
}

/// Creates an agent row and logs `agent_joined`.
///
/// # Errors
///
/// Returns [`Error::RaceLost`] if the name is already taken, or the
/// underlying store error otherwise.
pub fn create(conn: &Connection, spec: &NewAgent) -> Result<Agent> {
    let id = util::short_id();
    let now = util::now_rfc3339();

    let inserted = conn.execute(
        "INSERT INTO agents (id, name, kind, pid, status, last_heartbeat_at, registered_at,
                             capabilities, role, metadata)
         VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5, ?6, ?7, ?8)",
        params![
            id,
            spec.name,
            spec.kind.as_str(),
            spec.pid,
            now,
            serde_json::to_string(&spec.capabilities).unwrap_or_else(|_| "[]".into()),
            spec.role,
            spec.metadata.to_string(),
        ],
    );

    match inserted {
        Ok(_) => {},
        Err(cause) if is_unique_violation(&cause) => {
            return Err(Error::RaceLost {
                entity: "agent name",
                id: spec.name.clone(),
            });
        },
        Err(cause) => return Err(cause.into()),
    }

    event::log(
        conn,
        "agent_joined",
        Some(&id),
        None,
        Some(serde_json::json!({ "name": spec.name })),
    )?;

    get(conn, &id)?.ok_or(Error::AgentNotFound { agent_id: id })
}

/// Looks up an agent by id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(conn: &Connection, agent_id: &str) -> Result<Option<Agent>> {
    let mut stmt = conn.prepare(&format!("{SELECT_AGENT} WHERE id = ?1"))?;
    Ok(stmt.query_row(params![agent_id], row_to_agent).optional()?)
}

/// Looks up an agent by name.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<Agent>> {
    let mut stmt = conn.prepare(&format!("{SELECT_AGENT} WHERE name = ?1"))?;
    Ok(stmt.query_row(params![name], row_to_agent).optional()?)
}

/// All agents, optionally filtered by status, oldest registration first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn all(conn: &Connection, status: Option<AgentStatus>) -> Result<Vec<Agent>> {
    let (sql, params) = match status {
        Some(status) => (
            format!("{SELECT_AGENT} WHERE status = ?1 ORDER BY registered_at"),
            vec![status.as_str().to_string()],
        ),
        None => (format!("{SELECT_AGENT} ORDER BY registered_at"), vec![]),
    };

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), row_to_agent)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Stamps `last_heartbeat_at` with the current time.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn heartbeat(conn: &Connection, agent_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE agents SET last_heartbeat_at = ?1 WHERE id = ?2",
        params![util::now_rfc3339(), agent_id],
    )?;
    Ok(())
}

/// Sets the agent's status.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn set_status(conn: &Connection, agent_id: &str, status: AgentStatus) -> Result<()> {
    conn.execute(
        "UPDATE agents SET status = ?1 WHERE id = ?2",
        params![status.as_str(), agent_id],
    )?;
    Ok(())
}

/// Sets or clears the agent's role label.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn set_role(conn: &Connection, agent_id: &str, role: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE agents SET role = ?1 WHERE id = ?2",
        params![role, agent_id],
    )?;
    Ok(())
}

/// Records the agent's latest progress note.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn set_last_progress(conn: &Connection, agent_id: &str, note: &str) -> Result<()> {
    conn.execute(
        "UPDATE agents SET last_progress = ?1 WHERE id = ?2",
        params![note, agent_id],
    )?;
    Ok(())
}

/// Deletes the agent row and logs `agent_left`.
///
/// Historical messages and events keep referencing the id; readers render
/// unknown senders from the id prefix.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn delete(conn: &Connection, agent_id: &str) -> Result<()> {
    conn.execute("DELETE FROM agents WHERE id = ?1", params![agent_id])?;
    event::log(conn, "agent_left", Some(agent_id), None, None)?;
    Ok(())
}

const SELECT_AGENT: &str = "SELECT id, name, kind, pid, status, last_heartbeat_at, registered_at,
        current_task_id, capabilities, role, metadata, last_progress
 FROM agents";

pub(crate) fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let kind: String = row.get(2)?;
    let status: String = row.get(4)?;
    let capabilities: Option<String> = row.get(8)?;
    let metadata: Option<String> = row.get(10)?;

    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: AgentKind::parse(&kind),
        pid: row.get(3)?,
        status: AgentStatus::parse(&status),
        last_heartbeat_at: row.get(5)?,
        registered_at: row.get(6)?,
        current_task_id: row.get(7)?,
        capabilities: capabilities
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default(),
        role: row.get(9)?,
        metadata: metadata
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(serde_json::Value::Null),
        last_progress: row.get(11)?,
    })
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}
