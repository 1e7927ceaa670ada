//! Kernel error types.
//!
//! Outcomes like "no task available" or "lock held by someone else" are
//! ordinary results of coordination, not exceptional conditions. They are
//! modelled as a closed enumeration carrying the identifiers a caller needs
//! to react without string-matching, and each kind maps to a stable process
//! exit code for the CLI surface.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by kernel operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No `.aqua` directory exists at or above the working directory.
    #[error("aqua is not initialized here (no .aqua directory found)")]
    NotInitialized,

    /// The caller has no agent identity for this session.
    #[error("not joined: no agent is registered for this session")]
    NotJoined,

    /// An agent was not found.
    #[error("agent not found: {agent_id}")]
    AgentNotFound {
        /// The agent id that did not resolve.
        agent_id: String,
    },

    /// A task was not found.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task id that did not resolve.
        task_id: String,
    },

    /// A message was not found.
    #[error("message not found: {message_id}")]
    MessageNotFound {
        /// The message id that did not resolve.
        message_id: i64,
    },

    /// A file lock is already held by another agent.
    #[error("{path} is locked by {owner}")]
    LockHeld {
        /// The contended path.
        path: PathBuf,
        /// Agent id of the current owner.
        owner: String,
    },

    /// The task is already claimed by another agent.
    #[error("task {task_id} is already claimed by {owner}")]
    TaskClaimed {
        /// The contended task.
        task_id: String,
        /// Agent id of the current claimer.
        owner: String,
    },

    /// A conditional update affected zero rows: another writer won the race.
    #[error("lost the race for {entity} {id}")]
    RaceLost {
        /// What was contended ("task", "leadership", ...).
        entity: &'static str,
        /// Identifier of the contended row.
        id: String,
    },

    /// Adding a dependency edge would make the task graph cyclic.
    #[error("cyclic dependency: {task_id} -> {depends_on} closes a cycle")]
    CycleDetected {
        /// The task the edge starts from.
        task_id: String,
        /// The parent the edge points at.
        depends_on: String,
    },

    /// Optimistic-concurrency mismatch on a versioned update.
    #[error("task {task_id} was modified concurrently (expected version {expected}, found {found})")]
    StaleVersion {
        /// The task being updated.
        task_id: String,
        /// The version the caller observed.
        expected: i64,
        /// The version currently in the store.
        found: i64,
    },

    /// The store stayed busy through every retry attempt.
    #[error("store busy after {attempts} attempts")]
    StoreBusy {
        /// How many attempts were made.
        attempts: u32,
    },

    /// The operation requires ownership or leadership the caller lacks.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// Why the operation was refused.
        reason: String,
    },

    /// A blocking wait expired without a result.
    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// The configured timeout.
        seconds: u64,
    },

    /// The configuration file or an override is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database error from the underlying store.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// I/O error touching the `.aqua` directory or session files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short stable name of the error kind, for machine-readable output.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::NotJoined => "not_joined",
            Self::AgentNotFound { .. } => "agent_not_found",
            Self::TaskNotFound { .. } => "task_not_found",
            Self::MessageNotFound { .. } => "message_not_found",
            Self::LockHeld { .. } => "lock_held",
            Self::TaskClaimed { .. } => "task_claimed",
            Self::RaceLost { .. } => "race_lost",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::StaleVersion { .. } => "stale_version",
            Self::StoreBusy { .. } => "store_busy",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Timeout { .. } => "timeout",
            Self::Config(_) => "config_error",
            Self::Store(_) => "store_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Stable process exit code for this error kind.
    ///
    /// Kinds without a dedicated code collapse to 1.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::NotInitialized => 1,
            Self::NotJoined => 2,
            Self::TaskNotFound { .. } | Self::AgentNotFound { .. } | Self::MessageNotFound { .. } => {
                4
            },
            Self::LockHeld { .. } | Self::TaskClaimed { .. } | Self::RaceLost { .. } => 5,
            Self::StoreBusy { .. } | Self::Store(_) | Self::Io(_) => 10,
            Self::Config(_) => 11,
            _ => 1,
        }
    }
}

/// Convenience alias used throughout the kernel.
pub type Result<T> = std::result::Result<T, Error>;
