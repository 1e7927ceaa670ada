//! File lock commands: lock, unlock, locks.

use aqua_core::Result;

use crate::output;

/// Takes an exclusive lock on a path.
pub fn lock(json: bool, path: &str) -> Result<()> {
    let mut kernel = super::open()?;
    let taken = kernel.lock(path)?;

    if json {
        output::print_json(&taken);
    } else {
        println!("Locked {path}");
    }
    Ok(())
}

/// Releases a lock held by the caller.
pub fn unlock(json: bool, path: &str) -> Result<()> {
    let mut kernel = super::open()?;
    kernel.unlock(path)?;

    if json {
        output::print_json(&serde_json::json!({ "unlocked": path }));
    } else {
        println!("Unlocked {path}");
    }
    Ok(())
}

/// Lists held locks.
pub fn list(json: bool) -> Result<()> {
    let kernel = super::open()?;
    let locks = kernel.locks()?;

    if json {
        output::print_json(&locks);
        return Ok(());
    }

    if locks.is_empty() {
        println!("No locks held.");
        return Ok(());
    }

    println!("{:<48} {:<16} {}", "PATH", "OWNER", "SINCE");
    for lock in &locks {
        let owner = kernel.display_name(&lock.agent_id)?;
        println!(
            "{:<48} {:<16} {}",
            output::truncate(&lock.file_path, 46),
            owner,
            output::time_ago(&lock.locked_at)
        );
    }
    Ok(())
}
