//! `aqua init`.

use aqua_core::{Coordinator, Result};

use crate::output;

/// Initializes `.aqua` in the current directory.
pub fn run(json: bool) -> Result<()> {
    let cwd = super::cwd()?;
    let already = cwd.join(".aqua").is_dir();
    let kernel = Coordinator::init(&cwd)?;
    let aqua_dir = kernel.aqua_dir();

    if json {
        output::print_json(&serde_json::json!({
            "initialized": true,
            "already_existed": already,
            "path": aqua_dir,
        }));
        return Ok(());
    }

    if already {
        println!("aqua already initialized in {}", aqua_dir.display());
        return Ok(());
    }

    println!("Initialized aqua in {}", aqua_dir.display());
    println!();
    println!("Next steps:");
    println!("  aqua join --name <name>   # register this session as an agent");
    println!("  aqua add 'First task' -p 5");
    println!("  aqua claim");
    Ok(())
}
