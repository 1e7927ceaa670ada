//! Task scheduling.
//!
//! Tasks move through `pending -> claimed -> done | failed`, with
//! `abandoned` as the holding state for work whose owner died or timed out.
//! Dependency satisfaction is pushed into the claim query itself as an
//! anti-join against unsatisfied parents, so picking the next task does not
//! scale with queue depth. The claim writes the task row and the claimer's
//! `current_task_id` in the same transaction; the two updates commit or
//! roll back together.

mod serialize;

pub use serialize::{SerializeOutcome, serialize_pending};

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::{event, util};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Exclusively held by one agent.
    Claimed,
    /// Finished successfully.
    Done,
    /// Finished unsuccessfully.
    Failed,
    /// Returned to the queue after its owner died or timed out.
    Abandoned,
}

impl TaskStatus {
    /// Column representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Parses a column value; unknown values read as `Pending`.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text {
            "claimed" => Self::Claimed,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "abandoned" => Self::Abandoned,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Stable 8-hex identifier.
    pub id: String,
    /// One-line summary.
    pub title: String,
    /// Longer description.
    pub description: Option<String>,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// 1..=10, higher first.
    pub priority: i64,
    /// Agent that created the task.
    pub created_by: Option<String>,
    /// Agent currently or last holding the task.
    pub claimed_by: Option<String>,
    /// Leader term observed at claim time (audit record).
    pub claim_term: Option<i64>,
    /// Creation time.
    pub created_at: String,
    /// Last modification time.
    pub updated_at: String,
    /// When the current claim started.
    pub claimed_at: Option<String>,
    /// When the task reached done or failed.
    pub completed_at: Option<String>,
    /// Result summary on done.
    pub result: Option<String>,
    /// Failure or abandonment reason.
    pub error: Option<String>,
    /// How many times the task has been retried.
    pub retry_count: i64,
    /// Retry ceiling.
    pub max_retries: i64,
    /// Tag labels.
    pub tags: Vec<String>,
    /// Free-form working context.
    pub context: Option<String>,
    /// Monotonic version for optimistic concurrency.
    pub version: i64,
    /// Whether this is a synthetic checkpoint inserted by serialize.
    pub is_checkpoint: bool,
    /// Ids of tasks this one waits on.
    pub depends_on: Vec<String>,
}

/// Parameters for creating a task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    /// One-line summary.
    pub title: String,
    /// Longer description.
    pub description: Option<String>,
    /// Clamped into 1..=10 on insert.
    pub priority: i64,
    /// Tag labels.
    pub tags: Vec<String>,
    /// Free-form working context.
    pub context: Option<String>,
    /// Creating agent, if joined.
    pub created_by: Option<String>,
    /// Retry ceiling.
    pub max_retries: i64,
    /// Parent task ids this task waits on.
    pub depends_on: Vec<String>,
    /// Marks synthetic checkpoint tasks.
    pub is_checkpoint: bool,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskCounts {
    /// Tasks waiting to be claimed.
    pub pending: i64,
    /// Tasks currently held.
    pub claimed: i64,
    /// Tasks finished successfully.
    pub done: i64,
    /// Tasks finished unsuccessfully.
    pub failed: i64,
    /// Tasks returned to the queue by recovery.
    pub abandoned: i64,
}

/// Filters for [`list`]. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to one status.
    pub status: Option<TaskStatus>,
    /// Restrict to one claimer.
    pub claimed_by: Option<String>,
    /// Restrict to tasks carrying one tag.
    pub tag: Option<String>,
}

/// Predefined role labels and the tags that satisfy them.
const ROLE_SYNONYMS: &[(&str, &[&str])] = &[
    ("reviewer", &["review", "reviews", "qa"]),
    ("frontend", &["ui", "web", "css"]),
    ("backend", &["api", "server", "db"]),
    ("testing", &["test", "tests", "qa"]),
    ("devops", &["infra", "ci", "deploy"]),
];

/// A pending task is claimable when no dependency row points at a parent
/// that is missing or not yet done.
const CLAIMABLE: &str = "t.status = 'pending'
     AND NOT EXISTS (
         SELECT 1 FROM task_deps d
         LEFT JOIN tasks p ON p.id = d.depends_on_id
         WHERE d.task_id = t.id
           AND (p.id IS NULL OR p.status <> 'done')
     )";

/// Creates a task with its dependency edges, rejecting cycles before any
/// row is written.
///
/// # Errors
///
/// Returns [`Error::TaskNotFound`] for an unknown parent and
/// [`Error::CycleDetected`] when an edge would close a cycle.
pub fn add(conn: &Connection, spec: &NewTask) -> Result<Task> {
    let id = util::short_id();
    let now = util::now_rfc3339();
    let priority = spec.priority.clamp(1, 10);

    // Validate parents and check for cycles before touching the store.
    for parent in &spec.depends_on {
        if get(conn, parent)?.is_none() {
            return Err(Error::TaskNotFound {
                task_id: parent.clone(),
            });
        }
        if parent == &id || reaches(conn, parent, &id)? {
            return Err(Error::CycleDetected {
                task_id: id,
                depends_on: parent.clone(),
            });
        }
    }

    conn.execute(
        "INSERT INTO tasks (id, title, description, status, priority, created_by,
                            created_at, updated_at, retry_count, max_retries, tags,
                            context, version, is_checkpoint)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?6, 0, ?7, ?8, ?9, 1, ?10)",
        params![
            id,
            spec.title,
            spec.description,
            priority,
            spec.created_by,
            now,
            spec.max_retries,
            serde_json::to_string(&spec.tags).unwrap_or_else(|_| "[]".into()),
            spec.context,
            spec.is_checkpoint,
        ],
    )?;

    for parent in &spec.depends_on {
        conn.execute(
            "INSERT OR IGNORE INTO task_deps (task_id, depends_on_id) VALUES (?1, ?2)",
            params![id, parent],
        )?;
    }

    event::log(
        conn,
        "task_created",
        spec.created_by.as_deref(),
        Some(&id),
        Some(serde_json::json!({ "title": spec.title })),
    )?;

    get(conn, &id)?.ok_or(Error::TaskNotFound { task_id: id })
}

/// Adds a dependency edge `task_id -> depends_on_id` to an existing task.
///
/// # Errors
///
/// Returns [`Error::CycleDetected`] when the edge would close a cycle, and
/// [`Error::TaskNotFound`] when either end does not exist.
pub fn add_dependency(conn: &Connection, task_id: &str, depends_on_id: &str) -> Result<()> {
    for end in [task_id, depends_on_id] {
        if get(conn, end)?.is_none() {
            return Err(Error::TaskNotFound {
                task_id: end.to_string(),
            });
        }
    }
    if task_id == depends_on_id || reaches(conn, depends_on_id, task_id)? {
        return Err(Error::CycleDetected {
            task_id: task_id.to_string(),
            depends_on: depends_on_id.to_string(),
        });
    }
    conn.execute(
        "INSERT OR IGNORE INTO task_deps (task_id, depends_on_id) VALUES (?1, ?2)",
        params![task_id, depends_on_id],
    )?;
    Ok(())
}

/// Depth-first reachability: can `from` reach `target` following
/// depends-on edges?
fn reaches(conn: &Connection, from: &str, target: &str) -> Result<bool> {
    let mut stack = vec![from.to_string()];
    let mut visited = std::collections::HashSet::new();

    let mut stmt = conn.prepare("SELECT depends_on_id FROM task_deps WHERE task_id = ?1")?;
    while let Some(current) = stack.pop() {
        if current == target {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        let parents = stmt
            .query_map(params![current], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        stack.extend(parents);
    }
    Ok(false)
}

/// Resolves a parent reference: an exact task id, or a fuzzy title match
/// choosing the most recently created candidate.
///
/// # Errors
///
/// Returns [`Error::TaskNotFound`] when nothing matches.
pub fn resolve_parent(conn: &Connection, reference: &str) -> Result<Task> {
    if let Some(task) = get(conn, reference)? {
        return Ok(task);
    }

    let pattern = format!("%{reference}%");
    let mut stmt = conn.prepare(&format!(
        "{SELECT_TASK} WHERE title LIKE ?1 ORDER BY created_at DESC LIMIT 1"
    ))?;
    let found = stmt
        .query_row(params![pattern], row_to_task)
        .optional()?
        .ok_or_else(|| Error::TaskNotFound {
            task_id: reference.to_string(),
        })?;
    load_deps(conn, found)
}

/// Looks up a task by id, dependency edges included.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let mut stmt = conn.prepare(&format!("{SELECT_TASK} WHERE id = ?1"))?;
    match stmt.query_row(params![task_id], row_to_task).optional()? {
        Some(task) => Ok(Some(load_deps(conn, task)?)),
        None => Ok(None),
    }
}

/// Lists tasks by filter, highest priority then oldest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list(conn: &Connection, filter: &TaskFilter) -> Result<Vec<Task>> {
    let mut sql = format!("{SELECT_TASK} WHERE 1=1");
    let mut params: Vec<String> = Vec::new();

    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        params.push(status.as_str().to_string());
    }
    if let Some(claimed_by) = &filter.claimed_by {
        sql.push_str(" AND claimed_by = ?");
        params.push(claimed_by.clone());
    }
    if let Some(tag) = &filter.tag {
        sql.push_str(" AND tags LIKE ?");
        params.push(format!("%\"{tag}\"%"));
    }
    sql.push_str(" ORDER BY priority DESC, created_at ASC");

    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), row_to_task)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    tasks
        .into_iter()
        .map(|task| load_deps(conn, task))
        .collect()
}

/// Task counts by status.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn counts(conn: &Connection) -> Result<TaskCounts> {
    let mut counts = TaskCounts::default();
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (status, count) = row?;
        match TaskStatus::parse(&status) {
            TaskStatus::Pending => counts.pending = count,
            TaskStatus::Claimed => counts.claimed = count,
            TaskStatus::Done => counts.done = count,
            TaskStatus::Failed => counts.failed = count,
            TaskStatus::Abandoned => counts.abandoned = count,
        }
    }
    Ok(counts)
}

/// Claims the best available task for an agent. Must run inside an
/// immediate transaction: the task row and the agent's `current_task_id`
/// are written together.
///
/// Candidate order is priority descending then age. When the agent carries
/// a role, a first pass restricts candidates to tasks tagged with the role
/// or one of its synonyms, falling back to any claimable task.
///
/// Returns `Ok(None)` when nothing is claimable.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn claim_next(conn: &Connection, agent_id: &str, role: Option<&str>, term: i64) -> Result<Option<Task>> {
    if let Some(role) = role.filter(|r| !r.is_empty()) {
        if let Some(task) = next_candidate(conn, Some(role))? {
            if try_claim(conn, &task.id, agent_id, term)? {
                return Ok(get(conn, &task.id)?);
            }
        }
    }

    let Some(task) = next_candidate(conn, None)? else {
        return Ok(None);
    };
    if try_claim(conn, &task.id, agent_id, term)? {
        return Ok(get(conn, &task.id)?);
    }
    // Lost the race inside our own transaction window; report no task.
    Ok(None)
}

/// Claims one specific task.
///
/// # Errors
///
/// Returns [`Error::TaskNotFound`] for an unknown id, [`Error::TaskClaimed`]
/// when another agent holds it, and [`Error::RaceLost`] when the
/// conditional update loses to a concurrent writer.
pub fn claim_specific(conn: &Connection, task_id: &str, agent_id: &str, term: i64) -> Result<Task> {
    let task = get(conn, task_id)?.ok_or_else(|| Error::TaskNotFound {
        task_id: task_id.to_string(),
    })?;

    if task.status == TaskStatus::Claimed {
        return Err(Error::TaskClaimed {
            task_id: task.id,
            owner: task.claimed_by.unwrap_or_else(|| "unknown".into()),
        });
    }

    if try_claim(conn, task_id, agent_id, term)? {
        return get(conn, task_id)?.ok_or_else(|| Error::TaskNotFound {
            task_id: task_id.to_string(),
        });
    }
    Err(Error::RaceLost {
        entity: "task",
        id: task_id.to_string(),
    })
}

/// Highest-priority oldest claimable task, optionally restricted to a role.
fn next_candidate(conn: &Connection, role: Option<&str>) -> Result<Option<Task>> {
    let mut sql = format!("SELECT t.id FROM tasks t WHERE {CLAIMABLE}");
    let mut params: Vec<String> = Vec::new();

    if let Some(role) = role {
        let mut tags: Vec<&str> = vec![role];
        if let Some((_, synonyms)) = ROLE_SYNONYMS.iter().find(|(name, _)| *name == role) {
            tags.extend(*synonyms);
        }
        let clauses: Vec<&str> = tags.iter().map(|_| "t.tags LIKE ?").collect();
        sql.push_str(&format!(" AND ({})", clauses.join(" OR ")));
        params.extend(tags.iter().map(|tag| format!("%\"{tag}\"%")));
    }

    sql.push_str(" ORDER BY t.priority DESC, t.created_at ASC LIMIT 1");

    let mut stmt = conn.prepare(&sql)?;
    let id: Option<String> = stmt
        .query_row(rusqlite::params_from_iter(params.iter()), |row| row.get(0))
        .optional()?;

    match id {
        Some(id) => get(conn, &id),
        None => Ok(None),
    }
}

/// The conditional claim update plus the agent assignment, together.
fn try_claim(conn: &Connection, task_id: &str, agent_id: &str, term: i64) -> Result<bool> {
    let now = util::now_rfc3339();
    let updated = conn.execute(
        "UPDATE tasks
         SET status = 'claimed', claimed_by = ?1, claimed_at = ?2, claim_term = ?3,
             updated_at = ?2, version = version + 1
         WHERE id = ?4 AND status = 'pending'",
        params![agent_id, now, term, task_id],
    )?;
    if updated != 1 {
        return Ok(false);
    }

    conn.execute(
        "UPDATE agents SET current_task_id = ?1 WHERE id = ?2",
        params![task_id, agent_id],
    )?;
    event::log(conn, "task_claimed", Some(agent_id), Some(task_id), None)?;
    Ok(true)
}

/// Marks a claimed task done and clears the claimer's assignment.
///
/// # Errors
///
/// Returns [`Error::TaskNotFound`] for an unknown id and
/// [`Error::PermissionDenied`] when the caller is not the claimer.
pub fn complete(
    conn: &Connection,
    task_id: &str,
    agent_id: &str,
    result: Option<&str>,
) -> Result<Task> {
    let now = util::now_rfc3339();
    let updated = conn.execute(
        "UPDATE tasks
         SET status = 'done', completed_at = ?1, result = ?2, updated_at = ?1,
             version = version + 1
         WHERE id = ?3 AND claimed_by = ?4 AND status = 'claimed'",
        params![now, result, task_id, agent_id],
    )?;

    if updated != 1 {
        return Err(report_ownership_failure(conn, task_id, agent_id)?);
    }

    conn.execute(
        "UPDATE agents SET current_task_id = NULL WHERE id = ?1",
        params![agent_id],
    )?;
    event::log(
        conn,
        "task_completed",
        Some(agent_id),
        Some(task_id),
        result.map(|r| serde_json::json!({ "result": r })),
    )?;

    get(conn, task_id)?.ok_or_else(|| Error::TaskNotFound {
        task_id: task_id.to_string(),
    })
}

/// Marks a claimed task failed and clears the claimer's assignment.
///
/// # Errors
///
/// Returns [`Error::TaskNotFound`] for an unknown id and
/// [`Error::PermissionDenied`] when the caller is not the claimer.
pub fn fail(conn: &Connection, task_id: &str, agent_id: &str, reason: &str) -> Result<Task> {
    let now = util::now_rfc3339();
    let updated = conn.execute(
        "UPDATE tasks
         SET status = 'failed', error = ?1, completed_at = ?2, updated_at = ?2,
             retry_count = retry_count + 1, version = version + 1
         WHERE id = ?3 AND claimed_by = ?4 AND status = 'claimed'",
        params![reason, now, task_id, agent_id],
    )?;

    if updated != 1 {
        return Err(report_ownership_failure(conn, task_id, agent_id)?);
    }

    conn.execute(
        "UPDATE agents SET current_task_id = NULL WHERE id = ?1",
        params![agent_id],
    )?;
    event::log(
        conn,
        "task_failed",
        Some(agent_id),
        Some(task_id),
        Some(serde_json::json!({ "error": reason })),
    )?;

    get(conn, task_id)?.ok_or_else(|| Error::TaskNotFound {
        task_id: task_id.to_string(),
    })
}

/// Updates the working context of a claimed task under optimistic
/// concurrency.
///
/// # Errors
///
/// Returns [`Error::PermissionDenied`] when the caller is not the claimer
/// and [`Error::StaleVersion`] when `expected_version` no longer matches.
pub fn progress(
    conn: &Connection,
    task_id: &str,
    agent_id: &str,
    context: &str,
    expected_version: i64,
) -> Result<Task> {
    let now = util::now_rfc3339();
    let updated = conn.execute(
        "UPDATE tasks
         SET context = ?1, updated_at = ?2, version = version + 1
         WHERE id = ?3 AND claimed_by = ?4 AND status = 'claimed' AND version = ?5",
        params![context, now, task_id, agent_id, expected_version],
    )?;

    if updated != 1 {
        let current = get(conn, task_id)?.ok_or_else(|| Error::TaskNotFound {
            task_id: task_id.to_string(),
        })?;
        if current.claimed_by.as_deref() != Some(agent_id) || current.status != TaskStatus::Claimed
        {
            return Err(Error::PermissionDenied {
                reason: format!("task {task_id} is not claimed by you"),
            });
        }
        return Err(Error::StaleVersion {
            task_id: task_id.to_string(),
            expected: expected_version,
            found: current.version,
        });
    }

    get(conn, task_id)?.ok_or_else(|| Error::TaskNotFound {
        task_id: task_id.to_string(),
    })
}

/// Returns a claimed task to the queue as abandoned, incrementing its
/// retry count. Does not touch the former claimer's agent row.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn abandon(conn: &Connection, task_id: &str, reason: &str) -> Result<bool> {
    let now = util::now_rfc3339();
    let updated = conn.execute(
        "UPDATE tasks
         SET status = 'abandoned', claimed_by = NULL, error = ?1, updated_at = ?2,
             retry_count = retry_count + 1, version = version + 1
         WHERE id = ?3 AND status = 'claimed'",
        params![reason, now, task_id],
    )?;

    if updated == 1 {
        event::log(
            conn,
            "task_abandoned",
            None,
            Some(task_id),
            Some(serde_json::json!({ "reason": reason })),
        )?;
    }
    Ok(updated == 1)
}

/// Moves abandoned and failed tasks with retries left back to pending.
/// Returns how many tasks were requeued.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn requeue_retryable(conn: &Connection) -> Result<usize> {
    let now = util::now_rfc3339();
    let requeued = conn.execute(
        "UPDATE tasks
         SET status = 'pending', updated_at = ?1, version = version + 1
         WHERE status IN ('abandoned', 'failed') AND retry_count < max_retries",
        params![now],
    )?;
    Ok(requeued)
}

/// Claimed tasks held by one agent.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn claimed_by(conn: &Connection, agent_id: &str) -> Result<Vec<Task>> {
    list(
        conn,
        &TaskFilter {
            status: Some(TaskStatus::Claimed),
            claimed_by: Some(agent_id.to_string()),
            tag: None,
        },
    )
}

/// Claimed tasks whose claim started before `cutoff` (RFC 3339 text).
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn stale_claims(conn: &Connection, cutoff: &str) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_TASK} WHERE status = 'claimed' AND claimed_at IS NOT NULL AND claimed_at < ?1"
    ))?;
    let tasks = stmt
        .query_map(params![cutoff], row_to_task)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    tasks
        .into_iter()
        .map(|task| load_deps(conn, task))
        .collect()
}

fn report_ownership_failure(conn: &Connection, task_id: &str, agent_id: &str) -> Result<Error> {
    let Some(task) = get(conn, task_id)? else {
        return Ok(Error::TaskNotFound {
            task_id: task_id.to_string(),
        });
    };
    let reason = match (&task.claimed_by, task.status) {
        (Some(owner), TaskStatus::Claimed) if owner != agent_id => {
            format!("task {task_id} is claimed by {owner}, not by you")
        },
        _ => format!("task {task_id} is {}, not claimed by you", task.status),
    };
    Ok(Error::PermissionDenied { reason })
}

const SELECT_TASK: &str = "SELECT id, title, description, status, priority, created_by, claimed_by,
        claim_term, created_at, updated_at, claimed_at, completed_at, result,
        error, retry_count, max_retries, tags, context, version, is_checkpoint
 FROM tasks t";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    let tags: Option<String> = row.get(16)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: TaskStatus::parse(&status),
        priority: row.get(4)?,
        created_by: row.get(5)?,
        claimed_by: row.get(6)?,
        claim_term: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        claimed_at: row.get(10)?,
        completed_at: row.get(11)?,
        result: row.get(12)?,
        error: row.get(13)?,
        retry_count: row.get(14)?,
        max_retries: row.get(15)?,
        tags: tags
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default(),
        context: row.get(17)?,
        version: row.get(18)?,
        is_checkpoint: row.get(19)?,
        depends_on: Vec::new(),
    })
}

fn load_deps(conn: &Connection, mut task: Task) -> Result<Task> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_id FROM task_deps WHERE task_id = ?1 ORDER BY depends_on_id",
    )?;
    task.depends_on = stmt
        .query_map(params![task.id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn new_task(title: &str, priority: i64) -> NewTask {
        NewTask {
            title: title.into(),
            priority,
            max_retries: 3,
            ..Default::default()
        }
    }

    fn add_agent(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO agents (id, name, last_heartbeat_at, registered_at)
             VALUES (?1, ?1, ?2, ?2)",
            params![id, util::now_rfc3339()],
        )
        .unwrap();
    }

    #[test]
    fn add_clamps_priority() {
        let store = Store::in_memory().unwrap();
        let low = add(store.conn(), &new_task("low", -3)).unwrap();
        let high = add(store.conn(), &new_task("high", 99)).unwrap();
        assert_eq!(low.priority, 1);
        assert_eq!(high.priority, 10);
    }

    #[test]
    fn claim_prefers_priority_then_age() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        add(store.conn(), &new_task("low", 1)).unwrap();
        let high = add(store.conn(), &new_task("high", 10)).unwrap();

        let claimed = claim_next(store.conn(), "a1", None, 0).unwrap().unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.claimed_by.as_deref(), Some("a1"));
        assert_eq!(claimed.claim_term, Some(0));
    }

    #[test]
    fn claim_sets_agent_assignment_in_same_transaction() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        let task = add(store.conn(), &new_task("work", 5)).unwrap();

        claim_next(store.conn(), "a1", None, 3).unwrap().unwrap();

        let assigned: Option<String> = store
            .conn()
            .query_row(
                "SELECT current_task_id FROM agents WHERE id = 'a1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(assigned.as_deref(), Some(task.id.as_str()));
    }

    #[test]
    fn claim_skips_tasks_with_unfinished_parents() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        let parent = add(store.conn(), &new_task("parent", 5)).unwrap();
        let child = {
            let mut spec = new_task("child", 9);
            spec.depends_on = vec![parent.id.clone()];
            add(store.conn(), &spec).unwrap()
        };

        // The child has higher priority but its parent is still pending.
        let first = claim_next(store.conn(), "a1", None, 0).unwrap().unwrap();
        assert_eq!(first.id, parent.id);

        complete(store.conn(), &parent.id, "a1", None).unwrap();

        let second = claim_next(store.conn(), "a1", None, 0).unwrap().unwrap();
        assert_eq!(second.id, child.id);
    }

    #[test]
    fn missing_parent_blocks_claim() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        let task = add(store.conn(), &new_task("orphaned child", 5)).unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO task_deps (task_id, depends_on_id) VALUES (?1, 'gone0000')",
                params![task.id],
            )
            .unwrap();

        assert!(claim_next(store.conn(), "a1", None, 0).unwrap().is_none());
    }

    #[test]
    fn claim_specific_reports_owner() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        add_agent(store.conn(), "a2");
        let task = add(store.conn(), &new_task("contested", 5)).unwrap();

        claim_specific(store.conn(), &task.id, "a1", 0).unwrap();

        match claim_specific(store.conn(), &task.id, "a2", 0) {
            Err(Error::TaskClaimed { owner, .. }) => assert_eq!(owner, "a1"),
            other => panic!("expected TaskClaimed, got {other:?}"),
        }
    }

    #[test]
    fn role_preference_with_fallback() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        add(store.conn(), &new_task("untagged urgent", 10)).unwrap();
        let tagged = {
            let mut spec = new_task("write tests", 4);
            spec.tags = vec!["tests".into()];
            add(store.conn(), &spec).unwrap()
        };

        // Role pass wins despite the lower priority.
        let claimed = claim_next(store.conn(), "a1", Some("testing"), 0)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, tagged.id);

        // No tagged work left: the role falls back to anything claimable.
        let fallback = claim_next(store.conn(), "a1", Some("testing"), 0)
            .unwrap()
            .unwrap();
        assert_eq!(fallback.title, "untagged urgent");
    }

    #[test]
    fn cycle_is_rejected_without_writes() {
        let store = Store::in_memory().unwrap();
        let a = add(store.conn(), &new_task("a", 5)).unwrap();
        let b = {
            let mut spec = new_task("b", 5);
            spec.depends_on = vec![a.id.clone()];
            add(store.conn(), &spec).unwrap()
        };

        // a -> b would close b -> a -> b.
        assert!(matches!(
            add_dependency(store.conn(), &a.id, &b.id),
            Err(Error::CycleDetected { .. })
        ));

        // No edge was persisted.
        let a_after = get(store.conn(), &a.id).unwrap().unwrap();
        assert!(a_after.depends_on.is_empty());

        assert!(matches!(
            add_dependency(store.conn(), &a.id, &a.id),
            Err(Error::CycleDetected { .. })
        ));
    }

    #[test]
    fn complete_requires_ownership() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        add_agent(store.conn(), "a2");
        let task = add(store.conn(), &new_task("mine", 5)).unwrap();
        claim_specific(store.conn(), &task.id, "a1", 0).unwrap();

        assert!(matches!(
            complete(store.conn(), &task.id, "a2", None),
            Err(Error::PermissionDenied { .. })
        ));

        let done = complete(store.conn(), &task.id, "a1", Some("shipped")).unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.result.as_deref(), Some("shipped"));
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn pending_task_cannot_be_completed_directly() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        let task = add(store.conn(), &new_task("untouched", 5)).unwrap();

        assert!(matches!(
            complete(store.conn(), &task.id, "a1", None),
            Err(Error::PermissionDenied { .. })
        ));
    }

    #[test]
    fn fail_increments_retry_count() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        let task = add(store.conn(), &new_task("fragile", 5)).unwrap();
        claim_specific(store.conn(), &task.id, "a1", 0).unwrap();

        let failed = fail(store.conn(), &task.id, "a1", "it broke").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error.as_deref(), Some("it broke"));
    }

    #[test]
    fn progress_detects_stale_versions() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        let task = add(store.conn(), &new_task("long haul", 5)).unwrap();
        let claimed = claim_specific(store.conn(), &task.id, "a1", 0).unwrap();

        let updated = progress(
            store.conn(),
            &task.id,
            "a1",
            "halfway",
            claimed.version,
        )
        .unwrap();
        assert_eq!(updated.version, claimed.version + 1);

        // Reusing the old version is a stale write.
        assert!(matches!(
            progress(store.conn(), &task.id, "a1", "again", claimed.version),
            Err(Error::StaleVersion { .. })
        ));
    }

    #[test]
    fn abandon_and_requeue_respect_retry_ceiling() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        let task = {
            let mut spec = new_task("flaky", 5);
            spec.max_retries = 1;
            add(store.conn(), &spec).unwrap()
        };

        claim_specific(store.conn(), &task.id, "a1", 0).unwrap();
        assert!(abandon(store.conn(), &task.id, "agent died").unwrap());

        // retry_count 1 == max_retries: no longer retryable.
        assert_eq!(requeue_retryable(store.conn()).unwrap(), 0);
        let stuck = get(store.conn(), &task.id).unwrap().unwrap();
        assert_eq!(stuck.status, TaskStatus::Abandoned);
        assert_eq!(stuck.error.as_deref(), Some("agent died"));
    }

    #[test]
    fn requeue_returns_abandoned_and_failed_tasks() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");

        let abandoned = add(store.conn(), &new_task("abandoned one", 5)).unwrap();
        claim_specific(store.conn(), &abandoned.id, "a1", 0).unwrap();
        abandon(store.conn(), &abandoned.id, "timeout").unwrap();

        let failed = add(store.conn(), &new_task("failed one", 5)).unwrap();
        claim_specific(store.conn(), &failed.id, "a1", 0).unwrap();
        fail(store.conn(), &failed.id, "a1", "broke").unwrap();

        assert_eq!(requeue_retryable(store.conn()).unwrap(), 2);
        for id in [&abandoned.id, &failed.id] {
            let task = get(store.conn(), id).unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Pending);
        }
    }

    #[test]
    fn resolve_parent_prefers_id_then_recent_title() {
        let store = Store::in_memory().unwrap();
        let old = add(store.conn(), &new_task("build the parser", 5)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let recent = add(store.conn(), &new_task("test the parser", 5)).unwrap();

        assert_eq!(resolve_parent(store.conn(), &old.id).unwrap().id, old.id);
        assert_eq!(
            resolve_parent(store.conn(), "parser").unwrap().id,
            recent.id
        );
        assert!(resolve_parent(store.conn(), "no such thing").is_err());
    }

    #[test]
    fn counts_by_status() {
        let store = Store::in_memory().unwrap();
        add_agent(store.conn(), "a1");
        add(store.conn(), &new_task("one", 5)).unwrap();
        let two = add(store.conn(), &new_task("two", 5)).unwrap();
        claim_specific(store.conn(), &two.id, "a1", 0).unwrap();

        let counts = counts(store.conn()).unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.claimed, 1);
        assert_eq!(counts.done, 0);
    }
}
