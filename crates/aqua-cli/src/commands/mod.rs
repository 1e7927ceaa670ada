//! Command implementations, grouped by domain.

pub mod admin;
pub mod agent;
pub mod init;
pub mod lock;
pub mod msg;
pub mod task;

use std::path::PathBuf;

use aqua_core::{Coordinator, Result};

/// Opens the kernel for the project containing the working directory.
pub fn open() -> Result<Coordinator> {
    let cwd = std::env::current_dir()?;
    Coordinator::open(&cwd)
}

/// The working directory, for init.
pub fn cwd() -> Result<PathBuf> {
    Ok(std::env::current_dir()?)
}
