//! Checkpoint serialization.
//!
//! Threads the pending queue into a single linear chain so an external loop
//! can run agents one task at a time: after finishing a task the agent
//! claims the next checkpoint, exits, and a fresh agent is relaunched with
//! restored context. A checkpoint is a synthetic task that depends on the
//! work task before it and is depended on by the work task after it.
//!
//! The operation is deterministic for a given queue (topological order with
//! priority-then-age tie-breaks) and idempotent: a checkpoint already
//! sitting between two work tasks is never duplicated.

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use super::{NewTask, Task, TaskFilter, TaskStatus, add, add_dependency, list};
use crate::error::Result;
use crate::event;

/// What a serialize pass changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SerializeOutcome {
    /// Checkpoint tasks inserted.
    pub checkpoints_added: usize,
    /// Direct dependency edges inserted between work tasks.
    pub edges_added: usize,
    /// The resulting chain, work tasks and checkpoints in order.
    pub chain: Vec<String>,
}

/// Serializes the pending queue with a checkpoint after every `stride`-th
/// work task (and a direct dependency edge between the pairs in between).
///
/// A queue with fewer than two pending work tasks is left untouched.
///
/// # Errors
///
/// Returns an error if a statement fails; checkpoint inserts go through the
/// same cycle-gated path as ordinary task creation.
pub fn serialize_pending(
    conn: &Connection,
    created_by: Option<&str>,
    stride: usize,
) -> Result<SerializeOutcome> {
    let stride = stride.max(1);
    let pending = list(
        conn,
        &TaskFilter {
            status: Some(TaskStatus::Pending),
            ..Default::default()
        },
    )?;

    let order = topo_order(&pending);
    let work: Vec<&Task> = order.into_iter().filter(|t| !t.is_checkpoint).collect();

    let mut outcome = SerializeOutcome::default();
    if work.len() < 2 {
        return Ok(outcome);
    }

    outcome.chain.push(work[0].id.clone());
    for (index, pair) in work.windows(2).enumerate() {
        let (prev, next) = (pair[0], pair[1]);
        let position = index + 1;

        if position % stride == 0 {
            let checkpoint = match existing_checkpoint_between(conn, &prev.id, &next.id)? {
                Some(id) => id,
                None => {
                    let checkpoint = add(
                        conn,
                        &NewTask {
                            title: format!("Checkpoint {}", position / stride),
                            priority: prev.priority,
                            created_by: created_by.map(ToOwned::to_owned),
                            max_retries: prev.max_retries,
                            depends_on: vec![prev.id.clone()],
                            is_checkpoint: true,
                            ..Default::default()
                        },
                    )?;
                    add_dependency(conn, &next.id, &checkpoint.id)?;
                    outcome.checkpoints_added += 1;
                    checkpoint.id
                },
            };
            outcome.chain.push(checkpoint);
        } else if !edge_exists(conn, &next.id, &prev.id)? {
            // Inside a stride window the chain is held together by a
            // direct edge instead of a checkpoint.
            add_dependency(conn, &next.id, &prev.id)?;
            outcome.edges_added += 1;
        }

        outcome.chain.push(next.id.clone());
    }

    if outcome.checkpoints_added > 0 || outcome.edges_added > 0 {
        event::log(
            conn,
            "tasks_serialized",
            created_by,
            None,
            Some(serde_json::json!({
                "checkpoints": outcome.checkpoints_added,
                "edges": outcome.edges_added,
                "stride": stride,
            })),
        )?;
    }

    Ok(outcome)
}

/// Kahn's algorithm over the pending subgraph, popping the highest
/// priority then oldest then smallest id among the available tasks so the
/// order is total and reproducible.
fn topo_order(pending: &[Task]) -> Vec<&Task> {
    let by_id: HashMap<&str, &Task> = pending.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in pending {
        indegree.entry(task.id.as_str()).or_insert(0);
        for parent in &task.depends_on {
            // Edges to tasks outside the pending set do not order the chain.
            if by_id.contains_key(parent.as_str()) {
                *indegree.entry(task.id.as_str()).or_insert(0) += 1;
                children
                    .entry(parent.as_str())
                    .or_default()
                    .push(task.id.as_str());
            }
        }
    }

    let mut available: Vec<&Task> = pending
        .iter()
        .filter(|t| indegree[t.id.as_str()] == 0)
        .collect();
    let mut order: Vec<&Task> = Vec::with_capacity(pending.len());
    let mut placed: HashSet<&str> = HashSet::new();

    while !available.is_empty() {
        available.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let next = available.remove(0);
        order.push(next);
        placed.insert(next.id.as_str());

        for child in children.get(next.id.as_str()).into_iter().flatten() {
            let remaining = indegree.get_mut(child).expect("child was indexed");
            *remaining -= 1;
            if *remaining == 0 {
                available.push(by_id[child]);
            }
        }
    }

    // Inserts are cycle-gated, so everything should have been placed; any
    // leftover is appended deterministically rather than dropped.
    debug_assert_eq!(order.len(), pending.len());
    let mut leftover: Vec<&Task> = pending
        .iter()
        .filter(|t| !placed.contains(t.id.as_str()))
        .collect();
    leftover.sort_by(|a, b| a.id.cmp(&b.id));
    order.extend(leftover);

    order
}

/// A pending checkpoint already wired between `prev` and `next`, if any.
fn existing_checkpoint_between(
    conn: &Connection,
    prev_id: &str,
    next_id: &str,
) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT c.id FROM tasks c
             JOIN task_deps up ON up.task_id = c.id AND up.depends_on_id = ?1
             JOIN task_deps down ON down.task_id = ?2 AND down.depends_on_id = c.id
             WHERE c.is_checkpoint = 1 AND c.status = 'pending'
             LIMIT 1",
            params![prev_id, next_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn edge_exists(conn: &Connection, task_id: &str, depends_on_id: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM task_deps WHERE task_id = ?1 AND depends_on_id = ?2",
            params![task_id, depends_on_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}
