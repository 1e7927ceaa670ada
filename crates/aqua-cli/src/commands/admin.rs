//! Observation and maintenance commands: status, log, doctor, recover.

use aqua_core::{EventFilter, Result};

use crate::output;

/// Shows the quorum status.
pub fn status(json: bool) -> Result<()> {
    let kernel = super::open()?;
    let report = kernel.status()?;

    if json {
        output::print_json(&report);
        return Ok(());
    }

    match (&report.leader, &report.leader_name) {
        (Some(leader), name) => {
            let who = name.clone().unwrap_or_else(|| output::short(&leader.agent_id));
            let lease = if leader.is_expired() {
                "lease EXPIRED".to_string()
            } else {
                format!("term {}", leader.term)
            };
            println!(
                "Leader: {who} ({lease}, elected {})",
                output::time_ago(&leader.elected_at)
            );
        },
        (None, _) => println!("Leader: none"),
    }

    println!();
    println!("Agents ({} active):", report.agents.len());
    if report.agents.is_empty() {
        println!("  none; run 'aqua join' to register");
    }
    for agent in &report.agents {
        let marker = report
            .leader
            .as_ref()
            .filter(|l| l.agent_id == agent.id && !l.is_expired())
            .map_or("  ", |_| "* ");
        let state = agent
            .current_task_id
            .as_deref()
            .map_or_else(|| "idle".to_string(), |t| format!("on {}", output::short(t)));
        println!(
            "{marker}{:<16} {:<10} {:<12} heartbeat {}",
            agent.name,
            agent.kind.to_string(),
            state,
            output::time_ago(&agent.last_heartbeat_at)
        );
    }

    println!();
    println!(
        "Tasks: {} pending | {} claimed | {} done | {} failed | {} abandoned",
        report.counts.pending,
        report.counts.claimed,
        report.counts.done,
        report.counts.failed,
        report.counts.abandoned
    );

    if !report.recent_events.is_empty() {
        println!();
        println!("Recent activity:");
        for event in &report.recent_events {
            let mut line = format!(
                "  {} {}",
                output::time_ago(&event.timestamp),
                event.event_type
            );
            if let Some(agent_id) = &event.agent_id {
                line.push_str(&format!(" by {}", kernel.display_name(agent_id)?));
            }
            if let Some(task_id) = &event.task_id {
                line.push_str(&format!(" task:{}", output::short(task_id)));
            }
            println!("{line}");
        }
    }
    Ok(())
}

/// Tails the event log.
pub fn log(
    json: bool,
    agent_name: Option<&str>,
    task_id: Option<String>,
    event_type: Option<String>,
    limit: u32,
) -> Result<()> {
    let kernel = super::open()?;

    let agent_id = match agent_name {
        Some(name) => Some(kernel.agent_id_by_name(name)?),
        None => None,
    };
    let events = kernel.log_tail(
        &EventFilter {
            event_type,
            agent_id,
            task_id,
        },
        limit,
    )?;

    if json {
        output::print_json(&events);
        return Ok(());
    }

    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    for event in &events {
        let mut line = format!("{} {}", event.timestamp, event.event_type);
        if let Some(agent_id) = &event.agent_id {
            line.push_str(&format!(" {}", kernel.display_name(agent_id)?));
        }
        if let Some(task_id) = &event.task_id {
            line.push_str(&format!(" task:{}", output::short(task_id)));
        }
        if let Some(details) = &event.details {
            line.push_str(&format!(" {details}"));
        }
        println!("{line}");
    }
    Ok(())
}

/// Runs health checks.
pub fn doctor(json: bool) -> Result<()> {
    let kernel = super::open()?;
    let checks = kernel.doctor()?;

    if json {
        output::print_json(&checks);
        return Ok(());
    }

    println!("aqua health check");
    for check in &checks {
        let mark = if check.ok { "ok " } else { "FAIL" };
        println!("  [{mark}] {:<12} {}", check.name, check.detail);
    }

    let failing = checks.iter().filter(|c| !c.ok).count();
    println!();
    if failing == 0 {
        println!("Overall: healthy");
    } else {
        println!("Overall: {failing} issue(s) found");
    }
    Ok(())
}

/// Runs the recovery sweep immediately.
pub fn recover(json: bool) -> Result<()> {
    let mut kernel = super::open()?;
    let report = kernel.recover_now()?;

    if json {
        output::print_json(&report);
        return Ok(());
    }

    if report.is_empty() {
        println!("Recovery sweep: nothing to do.");
        return Ok(());
    }

    if !report.dead_agents.is_empty() {
        println!("Declared {} agent(s) dead.", report.dead_agents.len());
    }
    if !report.unresponsive_agents.is_empty() {
        println!(
            "{} agent(s) unresponsive but alive.",
            report.unresponsive_agents.len()
        );
    }
    if report.stale_tasks > 0 {
        println!("Reclaimed {} stuck task(s).", report.stale_tasks);
    }
    if report.requeued_tasks > 0 {
        println!("Requeued {} task(s).", report.requeued_tasks);
    }
    Ok(())
}
