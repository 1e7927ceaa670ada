//! Task commands: add, list, show, claim, done, fail, progress, serialize.

use aqua_core::{ClaimOutcome, Error, NewTask, Result, TaskFilter, TaskStatus};

use crate::output;

/// Adds a task to the queue.
pub fn add(
    json: bool,
    title: String,
    description: Option<String>,
    priority: Option<i64>,
    tags: Vec<String>,
    context: Option<String>,
    after: &[String],
) -> Result<()> {
    let mut kernel = super::open()?;
    let task = kernel.add_task(
        NewTask {
            title,
            description,
            priority: priority.unwrap_or(0),
            tags,
            context,
            ..Default::default()
        },
        after,
    )?;

    if json {
        output::print_json(&task);
        return Ok(());
    }

    println!("Created task {}: {}", task.id, task.title);
    if !task.depends_on.is_empty() {
        println!("  After: {}", task.depends_on.join(", "));
    }
    Ok(())
}

/// Lists tasks.
pub fn list(json: bool, status: Option<&str>, tag: Option<String>) -> Result<()> {
    let kernel = super::open()?;
    let status = match status {
        Some(text) => Some(parse_status(text)?),
        None => None,
    };
    let tasks = kernel.list_tasks(&TaskFilter {
        status,
        claimed_by: None,
        tag,
    })?;

    if json {
        output::print_json(&tasks);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<10} {:>3} {:<10} {:<42} {:<12} {}",
        "ID", "PRI", "STATUS", "TITLE", "CLAIMED BY", "TAGS"
    );
    for task in &tasks {
        let claimed_by = match &task.claimed_by {
            Some(id) => kernel.display_name(id)?,
            None => String::new(),
        };
        println!(
            "{:<10} {:>3} {:<10} {:<42} {:<12} {}",
            output::short(&task.id),
            task.priority,
            task.status.to_string(),
            output::truncate(&task.title, 40),
            claimed_by,
            task.tags.join(", "),
        );
    }
    Ok(())
}

/// Shows one task in detail.
pub fn show(json: bool, task_id: Option<&str>) -> Result<()> {
    let kernel = super::open()?;
    let task = kernel.show_task(task_id)?;

    if json {
        output::print_json(&task);
        return Ok(());
    }

    println!("Task {}", task.id);
    println!("  Title:    {}", task.title);
    println!("  Status:   {}", task.status);
    println!("  Priority: {}", task.priority);
    if task.is_checkpoint {
        println!("  Checkpoint task");
    }
    if let Some(description) = &task.description {
        println!("  Description: {description}");
    }
    if !task.tags.is_empty() {
        println!("  Tags: {}", task.tags.join(", "));
    }
    if !task.depends_on.is_empty() {
        println!("  Depends on: {}", task.depends_on.join(", "));
    }
    if let Some(context) = &task.context {
        println!("  Context: {context}");
    }
    if let Some(claimed_by) = &task.claimed_by {
        println!("  Claimed by: {}", kernel.display_name(claimed_by)?);
    }
    if let Some(result) = &task.result {
        println!("  Result: {result}");
    }
    if let Some(error) = &task.error {
        println!("  Error: {error}");
    }
    if task.retry_count > 0 {
        println!("  Retries: {}/{}", task.retry_count, task.max_retries);
    }
    println!("  Created: {}", output::time_ago(&task.created_at));
    if let Some(completed_at) = &task.completed_at {
        println!("  Completed: {}", output::time_ago(completed_at));
    }
    Ok(())
}

/// Claims a task. Exits 3 when nothing is available.
pub fn claim(json: bool, task_id: Option<&str>) -> Result<()> {
    let mut kernel = super::open()?;
    let outcome = kernel.claim(task_id)?;

    if json {
        output::print_json(&outcome);
    }

    match outcome {
        ClaimOutcome::Claimed { task } => {
            if !json {
                println!("Claimed task {}: {}", task.id, task.title);
                if let Some(description) = &task.description {
                    println!("  {description}");
                }
            }
            Ok(())
        },
        ClaimOutcome::AlreadyWorking { task } => {
            if !json {
                println!("Already working on task {}: {}", task.id, task.title);
            }
            Ok(())
        },
        ClaimOutcome::NoneAvailable { counts } => {
            if !json {
                let total = counts.pending + counts.claimed + counts.done + counts.failed;
                if counts.pending == 0 && counts.claimed == 0 && total > 0 {
                    println!("All tasks complete. Done: {}", counts.done);
                } else if total == 0 {
                    println!("No tasks in the queue yet.");
                } else {
                    println!(
                        "No tasks available right now ({} being worked on).",
                        counts.claimed
                    );
                }
            }
            // "no task available" is a distinct exit code for scripts.
            std::process::exit(3);
        },
    }
}

/// Marks a task complete.
pub fn done(json: bool, task_id: Option<&str>, summary: Option<&str>) -> Result<()> {
    let mut kernel = super::open()?;
    let task = kernel.done(task_id, summary)?;

    if json {
        output::print_json(&task);
    } else {
        println!("Task {} completed.", task.id);
    }
    Ok(())
}

/// Marks a task failed.
pub fn fail(json: bool, task_id: Option<&str>, reason: &str) -> Result<()> {
    let mut kernel = super::open()?;
    let task = kernel.fail(task_id, reason)?;

    if json {
        output::print_json(&task);
    } else {
        println!(
            "Task {} marked failed ({}/{} retries used).",
            task.id, task.retry_count, task.max_retries
        );
    }
    Ok(())
}

/// Records progress on the current task.
pub fn progress(json: bool, message: &str) -> Result<()> {
    let mut kernel = super::open()?;
    let task = kernel.progress(message)?;

    if json {
        output::print_json(&task);
    } else {
        println!("Progress updated on task {}.", task.id);
    }
    Ok(())
}

/// Threads pending tasks into a checkpointed chain.
pub fn serialize(json: bool, stride: usize) -> Result<()> {
    let mut kernel = super::open()?;
    let outcome = kernel.serialize(stride)?;

    if json {
        output::print_json(&outcome);
        return Ok(());
    }

    if outcome.chain.is_empty() {
        println!("Nothing to serialize: fewer than two pending tasks.");
        return Ok(());
    }

    println!(
        "Serialized {} task(s): {} checkpoint(s) and {} edge(s) added.",
        outcome.chain.len(),
        outcome.checkpoints_added,
        outcome.edges_added
    );
    println!(
        "Chain: {}",
        outcome
            .chain
            .iter()
            .map(|id| output::short(id))
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    Ok(())
}

fn parse_status(text: &str) -> Result<TaskStatus> {
    match text {
        "pending" => Ok(TaskStatus::Pending),
        "claimed" => Ok(TaskStatus::Claimed),
        "done" => Ok(TaskStatus::Done),
        "failed" => Ok(TaskStatus::Failed),
        "abandoned" => Ok(TaskStatus::Abandoned),
        other => Err(Error::Config(format!(
            "unknown status '{other}' (expected pending, claimed, done, failed, or abandoned)"
        ))),
    }
}
