//! Agent membership commands: join, leave, refresh, ps.

use aqua_core::{AgentKind, Coordinator, NewAgent, Result};

use crate::output;

/// Registers this session as an agent.
pub fn join(
    json: bool,
    name: Option<String>,
    kind: AgentKind,
    capabilities: Vec<String>,
    role: Option<String>,
) -> Result<()> {
    let mut kernel = super::open()?;
    let outcome = kernel.join(NewAgent {
        name: name.unwrap_or_default(),
        kind,
        capabilities,
        role,
        ..Default::default()
    })?;

    if json {
        output::print_json(&outcome);
        return Ok(());
    }

    if outcome.already_joined {
        println!("Already joined as {}", outcome.agent.name);
        return Ok(());
    }

    let leader_note = if outcome.is_leader {
        format!(" (leader, term {})", outcome.term)
    } else {
        String::new()
    };
    println!("Joined as {}{leader_note}", outcome.agent.name);
    println!("  Agent id: {}", outcome.agent.id);
    println!(
        "  Set AQUA_AGENT_ID={} to reuse this identity elsewhere",
        outcome.agent.id
    );
    Ok(())
}

/// Leaves the quorum.
pub fn leave(json: bool, force: bool) -> Result<()> {
    let mut kernel = super::open()?;
    let outcome = kernel.leave(force)?;

    if json {
        output::print_json(&outcome);
        return Ok(());
    }

    println!("Left the quorum (was {})", outcome.name);
    if let Some(task_id) = &outcome.returned_task {
        println!("  Returned task {task_id} to the queue");
    }
    if outcome.released_locks > 0 {
        println!("  Released {} lock(s)", outcome.released_locks);
    }
    Ok(())
}

/// Restores identity and context for this session.
pub fn refresh(json: bool) -> Result<()> {
    let mut kernel = super::open()?;
    let outcome = kernel.refresh()?;

    if json {
        output::print_json(&outcome);
        return Ok(());
    }

    if outcome.leadership_changed {
        let successor = outcome.leader_name.as_deref().unwrap_or("another agent");
        println!("Leadership changed: {successor} is leading now. Continue as a worker.");
        println!();
    }

    let marker = if outcome.is_leader { " [leader]" } else { "" };
    println!("You are: {}{marker}", outcome.agent.name);
    println!("Agent id: {}", outcome.agent.id);
    println!();

    match &outcome.current_task {
        Some(task) => {
            println!("Current task: {} - {}", output::short(&task.id), task.title);
            if let Some(description) = &task.description {
                println!("  {description}");
            }
            if let Some(note) = &outcome.agent.last_progress {
                println!("  Last progress: {note}");
            }
            println!("  When done: aqua done --summary \"what you did\"");
        },
        None => {
            println!("Current task: none");
            println!("  Run 'aqua claim' to get one");
        },
    }

    if outcome.unread_messages > 0 {
        println!();
        println!(
            "{} unread message(s); run 'aqua inbox --unread'",
            outcome.unread_messages
        );
    }

    println!();
    println!(
        "Tasks: {} pending, {} in progress, {} done",
        outcome.counts.pending, outcome.counts.claimed, outcome.counts.done
    );
    Ok(())
}

/// Lists agents and probes whether their processes are alive.
pub fn ps(json: bool) -> Result<()> {
    let kernel = super::open()?;
    let agents = kernel.agents(Some(aqua_core::AgentStatus::Active))?;

    if json {
        let rows: Vec<_> = agents
            .iter()
            .map(|agent| {
                serde_json::json!({
                    "id": agent.id,
                    "name": agent.name,
                    "pid": agent.pid,
                    "current_task_id": agent.current_task_id,
                    "alive": Coordinator::probe_process(agent.pid),
                    "last_heartbeat_at": agent.last_heartbeat_at,
                })
            })
            .collect();
        output::print_json(&rows);
        return Ok(());
    }

    if agents.is_empty() {
        println!("No active agents.");
        return Ok(());
    }

    println!(
        "{:<16} {:>8} {:<8} {:<10} {:<6}",
        "NAME", "PID", "STATE", "TASK", "ALIVE"
    );
    for agent in &agents {
        let state = if agent.current_task_id.is_some() {
            "working"
        } else {
            "idle"
        };
        let task = agent
            .current_task_id
            .as_deref()
            .map_or_else(|| "-".to_string(), output::short);
        let pid = agent.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
        let alive = if Coordinator::probe_process(agent.pid) {
            "yes"
        } else {
            "no"
        };
        println!(
            "{:<16} {:>8} {:<8} {:<10} {:<6}",
            agent.name, pid, state, task, alive
        );
    }
    Ok(())
}
