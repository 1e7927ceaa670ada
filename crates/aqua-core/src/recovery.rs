//! Crash detection and recovery.
//!
//! There is no background thread: liveness is a heartbeat column refreshed
//! by every operation, and the sweep below runs opportunistically inside
//! ordinary invocations. The leader sweeps at most once per heartbeat
//! interval; any other agent steps in if the last recorded sweep is more
//! than twice the dead threshold old, so recovery survives the leader
//! dying too.

use chrono::{Duration, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::{agent, event, lock, task, util};

/// Event type recording a completed sweep.
const SWEEP_EVENT: &str = "recovery_sweep";

/// Summary of one recovery sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Agents declared dead.
    pub dead_agents: Vec<String>,
    /// Agents with stale heartbeats whose process is still alive.
    pub unresponsive_agents: Vec<String>,
    /// Claimed tasks reclaimed for exceeding the claim timeout.
    pub stale_tasks: usize,
    /// Abandoned or failed tasks returned to pending.
    pub requeued_tasks: usize,
}

impl SweepReport {
    /// Whether the sweep changed anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dead_agents.is_empty()
            && self.unresponsive_agents.is_empty()
            && self.stale_tasks == 0
            && self.requeued_tasks == 0
    }
}

/// Best-effort probe for process existence that does not signal it.
///
/// Pid reuse can produce a false positive; the heartbeat will either
/// resume or time out again on a later sweep, so that is acceptable.
#[must_use]
pub fn process_exists(pid: i64) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Whether enough wall time has passed for this caller to sweep.
///
/// # Errors
///
/// Returns an error if the event log cannot be read.
pub fn sweep_due(conn: &Connection, config: &Config, is_leader: bool) -> Result<bool> {
    let Some(last) = event::latest_of_type(conn, SWEEP_EVENT)? else {
        return Ok(true);
    };

    let elapsed = Utc::now() - util::parse_rfc3339(&last);
    let spacing = if is_leader {
        Duration::seconds(config.heartbeat_interval_seconds as i64)
    } else {
        Duration::seconds(2 * config.agent_dead_threshold_seconds as i64)
    };
    Ok(elapsed >= spacing)
}

/// Runs one full recovery sweep. Callers wrap this in an immediate
/// transaction so each recovered agent's row, tasks, and locks change
/// together.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn sweep(conn: &Connection, config: &Config) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let cutoff = util::to_rfc3339(
        Utc::now() - Duration::seconds(config.agent_dead_threshold_seconds as i64),
    );

    for candidate in stale_agents(conn, &cutoff)? {
        if candidate.pid.is_some_and(process_exists) {
            // Alive but silent: flag it, leave it alone.
            warn!(agent = %candidate.name, "agent has a stale heartbeat but its process is alive");
            event::log(
                conn,
                "agent_unresponsive",
                Some(&candidate.id),
                None,
                Some(serde_json::json!({
                    "pid": candidate.pid,
                    "last_heartbeat": candidate.last_heartbeat_at,
                })),
            )?;
            report.unresponsive_agents.push(candidate.id);
            continue;
        }

        recover_dead_agent(conn, &candidate)?;
        report.dead_agents.push(candidate.id);
    }

    // Claims that outlived the timeout are reclaimed without touching the
    // agent row: the agent may still be healthy, just stuck.
    let stale_cutoff =
        util::to_rfc3339(Utc::now() - Duration::seconds(config.task_claim_timeout_seconds as i64));
    for stuck in task::stale_claims(conn, &stale_cutoff)? {
        let reason = format!(
            "claim timed out after {}s",
            config.task_claim_timeout_seconds
        );
        if task::abandon(conn, &stuck.id, &reason)? {
            if let Some(owner) = &stuck.claimed_by {
                conn.execute(
                    "UPDATE agents SET current_task_id = NULL
                     WHERE id = ?1 AND current_task_id = ?2",
                    params![owner, stuck.id],
                )?;
            }
            report.stale_tasks += 1;
        }
    }

    report.requeued_tasks = task::requeue_retryable(conn)?;

    event::log(
        conn,
        SWEEP_EVENT,
        None,
        None,
        Some(serde_json::json!({
            "dead_agents": report.dead_agents.len(),
            "unresponsive_agents": report.unresponsive_agents.len(),
            "stale_tasks": report.stale_tasks,
            "requeued_tasks": report.requeued_tasks,
        })),
    )?;

    Ok(report)
}

/// Active agents whose heartbeat predates `cutoff`.
fn stale_agents(conn: &Connection, cutoff: &str) -> Result<Vec<agent::Agent>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, kind, pid, status, last_heartbeat_at, registered_at,
                current_task_id, capabilities, role, metadata, last_progress
         FROM agents
         WHERE status = 'active' AND last_heartbeat_at < ?1",
    )?;
    let rows = stmt
        .query_map(params![cutoff], agent::row_to_agent)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Marks one agent dead and releases everything it held.
fn recover_dead_agent(conn: &Connection, dead: &agent::Agent) -> Result<()> {
    info!(agent = %dead.name, "declaring agent dead");

    conn.execute(
        "UPDATE agents SET status = 'dead', current_task_id = NULL WHERE id = ?1",
        params![dead.id],
    )?;

    let held = task::claimed_by(conn, &dead.id)?;
    let released_tasks = held.len();
    for task in held {
        task::abandon(conn, &task.id, "agent died")?;
    }

    let released_locks = lock::release_all(conn, &dead.id)?;

    event::log(
        conn,
        "agent_died",
        Some(&dead.id),
        None,
        Some(serde_json::json!({
            "reason": "heartbeat_timeout",
            "pid": dead.pid,
            "tasks_released": released_tasks,
            "locks_released": released_locks,
        })),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentStatus, NewAgent};
    use crate::store::Store;
    use crate::task::{NewTask, TaskStatus};

    /// A pid that cannot exist: pid_max on Linux tops out well below this.
    const DEAD_PID: i64 = 0x3fff_ffff;

    fn join(conn: &Connection, name: &str, pid: Option<i64>) -> agent::Agent {
        agent::create(
            conn,
            &NewAgent {
                name: name.into(),
                pid,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn rewind_heartbeat(conn: &Connection, agent_id: &str, seconds: i64) {
        let stale = util::to_rfc3339(Utc::now() - Duration::seconds(seconds));
        conn.execute(
            "UPDATE agents SET last_heartbeat_at = ?1 WHERE id = ?2",
            params![stale, agent_id],
        )
        .unwrap();
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_exists(i64::from(std::process::id())));
        assert!(!process_exists(DEAD_PID));
    }

    #[test]
    fn dead_agent_loses_tasks_and_locks() {
        let store = Store::in_memory().unwrap();
        let config = Config::default();

        let doomed = join(store.conn(), "doomed", Some(DEAD_PID));
        let task = task::add(
            store.conn(),
            &NewTask {
                title: "orphaned work".into(),
                priority: 5,
                max_retries: 3,
                ..Default::default()
            },
        )
        .unwrap();
        task::claim_specific(store.conn(), &task.id, &doomed.id, 1).unwrap();
        lock::acquire(store.conn(), "src/lib.rs", &doomed.id).unwrap();

        rewind_heartbeat(store.conn(), &doomed.id, 301);

        let report = sweep(store.conn(), &config).unwrap();
        assert_eq!(report.dead_agents, vec![doomed.id.clone()]);
        // The abandoned task went straight back to pending in the same sweep.
        assert_eq!(report.requeued_tasks, 1);

        let after = agent::get(store.conn(), &doomed.id).unwrap().unwrap();
        assert_eq!(after.status, AgentStatus::Dead);
        assert!(after.current_task_id.is_none());

        let reclaimed = task::get(store.conn(), &task.id).unwrap().unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Pending);
        assert_eq!(reclaimed.retry_count, 1);
        assert!(reclaimed.claimed_by.is_none());

        assert!(lock::all(store.conn()).unwrap().is_empty());
    }

    #[test]
    fn live_process_is_flagged_not_killed() {
        let store = Store::in_memory().unwrap();
        let config = Config::default();

        let silent = join(store.conn(), "silent", Some(i64::from(std::process::id())));
        rewind_heartbeat(store.conn(), &silent.id, 301);

        let report = sweep(store.conn(), &config).unwrap();
        assert!(report.dead_agents.is_empty());
        assert_eq!(report.unresponsive_agents, vec![silent.id.clone()]);

        let after = agent::get(store.conn(), &silent.id).unwrap().unwrap();
        assert_eq!(after.status, AgentStatus::Active);

        let events = event::tail(store.conn(), &event::EventFilter::default(), 10).unwrap();
        assert!(events.iter().any(|e| e.event_type == "agent_unresponsive"));
    }

    #[test]
    fn fresh_heartbeat_is_left_alone() {
        let store = Store::in_memory().unwrap();
        let config = Config::default();

        let healthy = join(store.conn(), "healthy", Some(DEAD_PID));
        let report = sweep(store.conn(), &config).unwrap();

        assert!(report.dead_agents.is_empty());
        let after = agent::get(store.conn(), &healthy.id).unwrap().unwrap();
        assert_eq!(after.status, AgentStatus::Active);
    }

    #[test]
    fn stuck_claim_is_reclaimed_without_touching_agent() {
        let store = Store::in_memory().unwrap();
        let config = Config::default();

        let holder = join(store.conn(), "holder", Some(i64::from(std::process::id())));
        let task = task::add(
            store.conn(),
            &NewTask {
                title: "stuck work".into(),
                priority: 5,
                max_retries: 3,
                ..Default::default()
            },
        )
        .unwrap();
        task::claim_specific(store.conn(), &task.id, &holder.id, 1).unwrap();

        // Rewind the claim past the timeout; the heartbeat stays fresh.
        let old = util::to_rfc3339(
            Utc::now() - Duration::seconds(config.task_claim_timeout_seconds as i64 + 60),
        );
        store
            .conn()
            .execute(
                "UPDATE tasks SET claimed_at = ?1 WHERE id = ?2",
                params![old, task.id],
            )
            .unwrap();

        let report = sweep(store.conn(), &config).unwrap();
        assert_eq!(report.stale_tasks, 1);
        assert!(report.dead_agents.is_empty());

        let after_agent = agent::get(store.conn(), &holder.id).unwrap().unwrap();
        assert_eq!(after_agent.status, AgentStatus::Active);
        assert!(after_agent.current_task_id.is_none());

        let after_task = task::get(store.conn(), &task.id).unwrap().unwrap();
        assert_eq!(after_task.status, TaskStatus::Pending);
    }

    #[test]
    fn sweep_gating_by_role_and_age() {
        let store = Store::in_memory().unwrap();
        let config = Config::default();

        // Nothing recorded yet: everyone may sweep.
        assert!(sweep_due(store.conn(), &config, true).unwrap());
        assert!(sweep_due(store.conn(), &config, false).unwrap());

        sweep(store.conn(), &config).unwrap();

        // Immediately after a sweep, neither the leader nor a follower
        // is due again.
        assert!(!sweep_due(store.conn(), &config, true).unwrap());
        assert!(!sweep_due(store.conn(), &config, false).unwrap());
    }
}
