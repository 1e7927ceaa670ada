//! Session-bound agent identity.
//!
//! Client invocations are short-lived, so "who am I?" cannot live in process
//! memory. Each invocation derives a deterministic session key from its
//! environment and maps it to an agent id through a tiny file under
//! `.aqua/sessions/`. AI agents frequently run without a controlling
//! terminal; the `"default"` fallback keeps their identity stable across
//! invocations in one project.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;

/// Environment variable that overrides identity resolution entirely.
pub const AGENT_ID_VAR: &str = "AQUA_AGENT_ID";

/// Environment variable that overrides the session key.
pub const SESSION_ID_VAR: &str = "AQUA_SESSION_ID";

/// Explicit agent id override from the environment, if set.
#[must_use]
pub fn agent_id_override() -> Option<String> {
    std::env::var(AGENT_ID_VAR).ok().filter(|v| !v.is_empty())
}

/// Derives the session key for this invocation.
///
/// Precedence: `AQUA_SESSION_ID`, the controlling terminal device path,
/// the parent process id, then the literal `"default"`.
#[must_use]
pub fn session_key() -> String {
    if let Ok(explicit) = std::env::var(SESSION_ID_VAR) {
        if !explicit.is_empty() {
            return explicit;
        }
    }

    if let Ok(tty) = nix::unistd::ttyname(std::io::stdin()) {
        return tty.to_string_lossy().into_owned();
    }

    let ppid = nix::unistd::getppid().as_raw();
    if ppid > 1 {
        return format!("ppid:{ppid}");
    }

    "default".to_string()
}

/// Path of the session file for a given key.
#[must_use]
pub fn session_file(aqua_dir: &Path, key: &str) -> PathBuf {
    let digest = Sha256::digest(key.as_bytes());
    aqua_dir.join("sessions").join(&hex::encode(digest)[..16])
}

/// Reads the agent id stored for a session key, if any.
#[must_use]
pub fn stored_agent_id(aqua_dir: &Path, key: &str) -> Option<String> {
    let path = session_file(aqua_dir, key);
    std::fs::read_to_string(path)
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|id| !id.is_empty())
}

/// Writes the agent id for a session key.
///
/// # Errors
///
/// Returns an error if the sessions directory cannot be written.
pub fn store_agent_id(aqua_dir: &Path, key: &str, agent_id: &str) -> Result<()> {
    let sessions = aqua_dir.join("sessions");
    if !sessions.is_dir() {
        std::fs::create_dir_all(&sessions)?;
    }
    let path = session_file(aqua_dir, key);
    debug!(path = %path.display(), agent_id, "binding session to agent");
    std::fs::write(path, agent_id)?;
    Ok(())
}

/// Removes the session binding, if present.
///
/// # Errors
///
/// Returns an error only for I/O failures other than the file being absent.
pub fn clear_agent_id(aqua_dir: &Path, key: &str) -> Result<()> {
    let path = session_file(aqua_dir, key);
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(cause) if cause.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(cause) => Err(cause.into()),
    }
}
