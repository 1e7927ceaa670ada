//! # aqua-core
//!
//! Coordination kernel for Aqua: lets multiple independent CLI agents
//! cooperate on a shared workload through an embedded store in a
//! project-local `.aqua/` directory. There is no server process and no
//! broker; every client invocation opens the store, performs one
//! transactional operation, and exits.
//!
//! ## What the kernel provides
//!
//! - **Leader election**: a lease on a singleton row with a monotonic term
//!   that doubles as a fencing token
//! - **Heartbeat and liveness**: piggybacked on every operation, with a
//!   lazy recovery sweep instead of a background thread
//! - **Task lifecycle**: atomic claims, in-query dependency resolution,
//!   retries, checkpoint serialization, and orphan recovery
//! - **File locks**: exclusive path locks with owner-release semantics
//! - **Messaging**: broadcast, direct, and addressed delivery plus a
//!   polling ask/reply primitive
//! - **Session identity**: short-lived processes rediscover who they are
//!   through per-session files, without a daemon
//!
//! ## Example
//!
//! ```rust,no_run
//! use aqua_core::{Coordinator, NewAgent, NewTask};
//!
//! let mut kernel = Coordinator::init(std::path::Path::new("."))?;
//! let joined = kernel.join(NewAgent::default())?;
//! assert!(joined.is_leader);
//!
//! kernel.add_task(
//!     NewTask {
//!         title: "write the docs".into(),
//!         ..Default::default()
//!     },
//!     &[],
//! )?;
//! let outcome = kernel.claim(None)?;
//! # let _ = outcome;
//! # Ok::<(), aqua_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
#![allow(clippy::missing_panics_doc)]

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod leader;
pub mod lock;
pub mod message;
pub mod recovery;
pub mod session;
pub mod store;
pub mod task;
pub mod util;

pub use agent::{Agent, AgentKind, AgentStatus, NewAgent};
pub use config::Config;
pub use coordinator::{
    ClaimOutcome, Coordinator, HealthCheck, JoinOutcome, LeaveOutcome, RefreshOutcome,
    StatusReport,
};
pub use error::{Error, Result};
pub use event::{Event, EventFilter};
pub use leader::Leader;
pub use lock::FileLock;
pub use message::{Address, Message, MessageType};
pub use recovery::SweepReport;
pub use store::Store;
pub use task::{NewTask, SerializeOutcome, Task, TaskCounts, TaskFilter, TaskStatus};
