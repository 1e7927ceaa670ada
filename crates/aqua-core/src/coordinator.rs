//! Per-invocation coordination facade.
//!
//! Every client invocation is short-lived: open the store, work out who is
//! calling, refresh the heartbeat, opportunistically renew leadership and
//! run recovery, execute one operation in a transaction, exit. This module
//! is that control flow; the CLI never talks to the storage modules
//! directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::agent::{self, Agent, AgentStatus, NewAgent};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{self, Event, EventFilter};
use crate::leader::{self, Acquire, Leader};
use crate::lock::{self, FileLock};
use crate::message::{self, Address, Message, Standing};
use crate::recovery::{self, SweepReport};
use crate::store::{Store, find_project_root};
use crate::task::{
    self, NewTask, SerializeOutcome, Task, TaskCounts, TaskFilter, serialize_pending,
};
use crate::{session, util};

/// Result of a join.
#[derive(Debug, Clone, Serialize)]
pub struct JoinOutcome {
    /// The agent identity for this session.
    pub agent: Agent,
    /// Whether the caller now holds leadership, and at which term.
    pub is_leader: bool,
    /// The held term; 0 when not leader.
    pub term: i64,
    /// True when the session was already bound to this agent.
    pub already_joined: bool,
}

/// Result of a leave.
#[derive(Debug, Clone, Serialize)]
pub struct LeaveOutcome {
    /// Name of the departed agent.
    pub name: String,
    /// Task returned to the queue, if one was held.
    pub returned_task: Option<String>,
    /// File locks released.
    pub released_locks: usize,
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// A task was claimed.
    Claimed {
        /// The claimed task.
        task: Task,
    },
    /// The caller already holds a task; finish it first.
    AlreadyWorking {
        /// The task currently held.
        task: Task,
    },
    /// Nothing is claimable right now.
    NoneAvailable {
        /// Queue counts, so callers can tell "all done" from "all busy".
        counts: TaskCounts,
    },
}

/// Identity and context snapshot for `refresh`.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    /// The agent identity for this session.
    pub agent: Agent,
    /// Whether the caller currently holds an unexpired lease.
    pub is_leader: bool,
    /// Whether leadership was lost since the last refresh.
    pub leadership_changed: bool,
    /// Name of the current leader, when someone else leads.
    pub leader_name: Option<String>,
    /// The task the caller holds, if any.
    pub current_task: Option<Task>,
    /// Unread messages waiting in the inbox.
    pub unread_messages: usize,
    /// Queue counts.
    pub counts: TaskCounts,
}

/// Snapshot for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Current leader row, if any.
    pub leader: Option<Leader>,
    /// Name of the current leader, when resolvable.
    pub leader_name: Option<String>,
    /// Active agents.
    pub agents: Vec<Agent>,
    /// Queue counts.
    pub counts: TaskCounts,
    /// Most recent events, newest first.
    pub recent_events: Vec<Event>,
}

/// One `doctor` finding.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// What was checked.
    pub name: String,
    /// Whether it passed.
    pub ok: bool,
    /// Supporting detail.
    pub detail: String,
}

/// The coordination kernel bound to one project and one session.
pub struct Coordinator {
    store: Store,
    config: Config,
    session_key: String,
}

impl Coordinator {
    /// Initializes `.aqua` under `project_root` and opens the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout or schema cannot be created.
    pub fn init(project_root: &Path) -> Result<Self> {
        let store = Store::create(project_root)?;
        let config = Config::load(store.aqua_dir())?;
        Ok(Self {
            store,
            config,
            session_key: session::session_key(),
        })
    }

    /// Opens the kernel for the project containing `start`, walking upward
    /// to find `.aqua`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no project is found.
    pub fn open(start: &Path) -> Result<Self> {
        let root = find_project_root(start).ok_or(Error::NotInitialized)?;
        let store = Store::open(&root)?;
        let config = Config::load(store.aqua_dir())?;
        Ok(Self {
            store,
            config,
            session_key: session::session_key(),
        })
    }

    /// Opens the kernel with an explicit session key instead of deriving
    /// one from the environment. Embedders and tests use this to model
    /// several sessions against one store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no project is found.
    pub fn open_with_session(start: &Path, session_key: impl Into<String>) -> Result<Self> {
        let mut coordinator = Self::open(start)?;
        coordinator.session_key = session_key.into();
        Ok(coordinator)
    }

    /// The effective configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The `.aqua` directory backing this kernel.
    #[must_use]
    pub fn aqua_dir(&self) -> PathBuf {
        self.store.aqua_dir().to_path_buf()
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Resolves the caller's agent, if this session is bound to a live one.
    ///
    /// `AQUA_AGENT_ID` wins when it names a live agent; otherwise the
    /// session file decides.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn current_agent(&self) -> Result<Option<Agent>> {
        if let Some(id) = session::agent_id_override() {
            if let Some(found) = agent::get(self.store.conn(), &id)? {
                if found.status != AgentStatus::Dead {
                    return Ok(Some(found));
                }
            }
        }

        let Some(id) = session::stored_agent_id(self.store.aqua_dir(), &self.session_key) else {
            return Ok(None);
        };
        Ok(agent::get(self.store.conn(), &id)?.filter(|a| a.status != AgentStatus::Dead))
    }

    /// Like [`Self::current_agent`], but an unbound session is an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotJoined`] when the session has no live agent.
    pub fn require_agent(&self) -> Result<Agent> {
        self.current_agent()?.ok_or(Error::NotJoined)
    }

    /// Heartbeat plus the opportunistic duties of every invocation:
    /// renew-or-take leadership, and sweep when due.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects a statement.
    fn prologue(&mut self, agent_id: &str) -> Result<Acquire> {
        let lease = self.config.leader_lease_seconds;
        let config = self.config.clone();
        let agent_id = agent_id.to_string();

        self.store.with_tx(|tx| {
            agent::heartbeat(tx, &agent_id)?;
            let acquire = leader::try_acquire(tx, &agent_id, lease)?;

            if recovery::sweep_due(tx, &config, acquire.is_leader)? {
                if acquire.is_leader {
                    // Administrative writes are fenced on the held term; a
                    // deposed leader writes nothing and learns it here.
                    if !leader::renew_fenced(tx, &agent_id, acquire.term, lease)? {
                        debug!(agent = %agent_id, term = acquire.term, "deposed before sweep");
                        return Ok(Acquire {
                            is_leader: false,
                            term: 0,
                        });
                    }
                }
                let report = recovery::sweep(tx, &config)?;
                if !report.is_empty() {
                    debug!(?report, "opportunistic recovery sweep");
                }
            }
            Ok(acquire)
        })
    }

    // ------------------------------------------------------------------
    // Join / leave / refresh
    // ------------------------------------------------------------------

    /// Registers this session as an agent, or returns the existing binding.
    ///
    /// A joining agent immediately attempts leader election, so the first
    /// join in a project becomes leader at term 1.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RaceLost`] when the requested name is taken.
    pub fn join(&mut self, mut spec: NewAgent) -> Result<JoinOutcome> {
        if let Some(existing) = self.current_agent()? {
            let acquire = self.prologue(&existing.id)?;
            let agent = agent::get(self.store.conn(), &existing.id)?.ok_or(Error::NotJoined)?;
            return Ok(JoinOutcome {
                agent,
                is_leader: acquire.is_leader,
                term: acquire.term,
                already_joined: true,
            });
        }

        let generated_name = spec.name.is_empty();
        if generated_name {
            spec.name = util::agent_name();
        }
        if spec.pid.is_none() {
            spec.pid = Some(i64::from(std::process::id()));
        }

        let lease = self.config.leader_lease_seconds;
        let (agent, acquire) = self.store.with_tx(|tx| {
            let created = match agent::create(tx, &spec) {
                // A generated name colliding is bad luck, not user error.
                Err(Error::RaceLost { .. }) if generated_name => {
                    let mut retry = spec.clone();
                    retry.name = util::agent_name();
                    agent::create(tx, &retry)?
                },
                other => other?,
            };
            let acquire = leader::try_acquire(tx, &created.id, lease)?;
            Ok((created, acquire))
        })?;

        session::store_agent_id(self.store.aqua_dir(), &self.session_key, &agent.id)?;

        Ok(JoinOutcome {
            agent,
            is_leader: acquire.is_leader,
            term: acquire.term,
            already_joined: false,
        })
    }

    /// Leaves the quorum: returns any held task to the queue, releases
    /// locks, steps down from leadership, removes the agent row, and
    /// unbinds the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] when a task is held and `force`
    /// is false.
    pub fn leave(&mut self, force: bool) -> Result<LeaveOutcome> {
        let me = self.require_agent()?;

        if let Some(task_id) = &me.current_task_id {
            if !force {
                return Err(Error::PermissionDenied {
                    reason: format!(
                        "you are working on task {task_id}; complete it first or leave with force"
                    ),
                });
            }
        }

        let me_id = me.id.clone();
        let me_name = me.name.clone();
        let held_task = me.current_task_id.clone();

        let outcome = self.store.with_tx(|tx| {
            let mut returned_task = None;
            if let Some(task_id) = &held_task {
                if task::abandon(tx, task_id, &format!("agent {me_name} left"))? {
                    // Departure is not a crash: the task goes straight back
                    // to pending if it still has retries left.
                    tx.execute(
                        "UPDATE tasks SET status = 'pending'
                         WHERE id = ?1 AND status = 'abandoned' AND retry_count < max_retries",
                        rusqlite::params![task_id],
                    )?;
                    returned_task = Some(task_id.clone());
                }
            }
            let released_locks = lock::release_all(tx, &me_id)?;
            leader::step_down(tx, &me_id)?;
            agent::delete(tx, &me_id)?;
            Ok(LeaveOutcome {
                name: me_name.clone(),
                returned_task,
                released_locks,
            })
        })?;

        session::clear_agent_id(self.store.aqua_dir(), &self.session_key)?;
        Ok(outcome)
    }

    /// Restores identity and context for this session: who am I, am I
    /// leading, what was I doing, what is waiting for me.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotJoined`] when the session has no live agent.
    pub fn refresh(&mut self) -> Result<RefreshOutcome> {
        let me = self.require_agent()?;
        self.prologue(&me.id)?;

        let conn = self.store.conn();
        let me = agent::get(conn, &me.id)?.ok_or(Error::NotJoined)?;

        let current_leader = leader::get(conn)?;
        let is_leader = current_leader
            .as_ref()
            .is_some_and(|l| l.agent_id == me.id && !l.is_expired());

        // Leadership standing is remembered in agent metadata so a later
        // refresh can tell the agent it was deposed while away.
        let was_leader = me.metadata.get("leader").and_then(|v| v.as_bool()) == Some(true);
        if was_leader != is_leader {
            let mut metadata = me.metadata.clone();
            if !metadata.is_object() {
                metadata = serde_json::json!({});
            }
            metadata["leader"] = serde_json::Value::Bool(is_leader);
            conn.execute(
                "UPDATE agents SET metadata = ?1 WHERE id = ?2",
                rusqlite::params![metadata.to_string(), me.id],
            )?;
        }

        let leader_name = match &current_leader {
            Some(l) if !l.is_expired() && l.agent_id != me.id => {
                Some(agent::get(conn, &l.agent_id)?.map_or_else(
                    || l.agent_id.chars().take(8).collect(),
                    |a| a.name,
                ))
            },
            _ => None,
        };

        let current_task = match &me.current_task_id {
            Some(task_id) => task::get(conn, task_id)?,
            None => None,
        };

        let standing = Standing {
            is_leader,
            is_idle: me.current_task_id.is_none(),
        };
        let unread_messages = message::unread_count(conn, &me.id, standing)?;

        Ok(RefreshOutcome {
            leadership_changed: was_leader && !is_leader,
            is_leader,
            leader_name,
            current_task,
            unread_messages,
            counts: task::counts(conn)?,
            agent: me,
        })
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Adds a task. `after` entries are parent references resolved as an
    /// exact id or a fuzzy title match.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unresolvable parent and
    /// [`Error::CycleDetected`] for a cyclic dependency.
    pub fn add_task(&mut self, mut spec: NewTask, after: &[String]) -> Result<Task> {
        if spec.created_by.is_none() {
            spec.created_by = self.current_agent()?.map(|a| a.id);
        }
        if let Some(creator) = &spec.created_by {
            self.prologue(creator)?;
        }
        if spec.priority == 0 {
            spec.priority = self.config.default_priority;
        }
        if spec.max_retries == 0 {
            spec.max_retries = self.config.max_retries;
        }

        self.store.with_tx(|tx| {
            let mut resolved = spec.clone();
            for reference in after {
                let parent = task::resolve_parent(tx, reference)?;
                resolved.depends_on.push(parent.id);
            }
            task::add(tx, &resolved)
        })
    }

    /// Claims a task: the given one, or the best available.
    ///
    /// # Errors
    ///
    /// Propagates claim errors for a specific task; a generic claim never
    /// fails for lack of work, it reports [`ClaimOutcome::NoneAvailable`].
    pub fn claim(&mut self, task_id: Option<&str>) -> Result<ClaimOutcome> {
        let me = self.require_agent()?;
        self.prologue(&me.id)?;

        // Holding a task already: point the caller back at it.
        if let Some(current_id) = &me.current_task_id {
            if let Some(current) = task::get(self.store.conn(), current_id)? {
                if current.status == task::TaskStatus::Claimed
                    && current.claimed_by.as_deref() == Some(me.id.as_str())
                {
                    return Ok(ClaimOutcome::AlreadyWorking { task: current });
                }
            }
        }

        let me_id = me.id.clone();
        let role = me.role.clone();
        let wanted = task_id.map(ToOwned::to_owned);

        self.store.with_tx(|tx| {
            let term = leader::current_term(tx)?;
            match &wanted {
                Some(task_id) => {
                    let task = task::claim_specific(tx, task_id, &me_id, term)?;
                    Ok(ClaimOutcome::Claimed { task })
                },
                None => match task::claim_next(tx, &me_id, role.as_deref(), term)? {
                    Some(task) => Ok(ClaimOutcome::Claimed { task }),
                    None => Ok(ClaimOutcome::NoneAvailable {
                        counts: task::counts(tx)?,
                    }),
                },
            }
        })
    }

    /// Completes a task; with no id, the caller's current task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] when the caller does not hold
    /// the task.
    pub fn done(&mut self, task_id: Option<&str>, summary: Option<&str>) -> Result<Task> {
        let me = self.require_agent()?;
        self.prologue(&me.id)?;
        let task_id = self.resolve_own_task(&me, task_id)?;
        let me_id = me.id.clone();
        let summary = summary.map(ToOwned::to_owned);

        self.store
            .with_tx(|tx| task::complete(tx, &task_id, &me_id, summary.as_deref()))
    }

    /// Fails a task; with no id, the caller's current task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] when the caller does not hold
    /// the task.
    pub fn fail(&mut self, task_id: Option<&str>, reason: &str) -> Result<Task> {
        let me = self.require_agent()?;
        self.prologue(&me.id)?;
        let task_id = self.resolve_own_task(&me, task_id)?;
        let me_id = me.id.clone();
        let reason = reason.to_string();

        self.store
            .with_tx(|tx| task::fail(tx, &task_id, &me_id, &reason))
    }

    /// Records progress on the caller's current task and mirrors the note
    /// onto the agent row for later `refresh`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] without a current task and
    /// [`Error::StaleVersion`] on a concurrent update.
    pub fn progress(&mut self, note: &str) -> Result<Task> {
        let me = self.require_agent()?;
        self.prologue(&me.id)?;
        let task_id = self.resolve_own_task(&me, None)?;
        let me_id = me.id.clone();
        let note = note.to_string();

        self.store.with_tx(|tx| {
            let current = task::get(tx, &task_id)?.ok_or_else(|| Error::TaskNotFound {
                task_id: task_id.clone(),
            })?;
            let updated = task::progress(tx, &task_id, &me_id, &note, current.version)?;
            agent::set_last_progress(tx, &me_id, &note)?;
            Ok(updated)
        })
    }

    /// Threads the pending queue into a linear chain with checkpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if a statement fails.
    pub fn serialize(&mut self, stride: usize) -> Result<SerializeOutcome> {
        let me = self.current_agent()?;
        if let Some(me) = &me {
            self.prologue(&me.id)?;
        }
        let me_id = me.map(|a| a.id);

        self.store
            .with_tx(|tx| serialize_pending(tx, me_id.as_deref(), stride))
    }

    /// Lists tasks by filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        task::list(self.store.conn(), filter)
    }

    /// Shows one task; with no id, the caller's current task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] when it does not resolve.
    pub fn show_task(&self, task_id: Option<&str>) -> Result<Task> {
        let task_id = match task_id {
            Some(id) => id.to_string(),
            None => {
                let me = self.require_agent()?;
                me.current_task_id.ok_or(Error::TaskNotFound {
                    task_id: "(current)".into(),
                })?
            },
        };
        task::get(self.store.conn(), &task_id)?.ok_or(Error::TaskNotFound { task_id })
    }

    fn resolve_own_task(&self, me: &Agent, task_id: Option<&str>) -> Result<String> {
        match task_id {
            Some(id) => Ok(id.to_string()),
            None => me
                .current_task_id
                .clone()
                .ok_or_else(|| Error::PermissionDenied {
                    reason: "no current task; claim one first".into(),
                }),
        }
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Resolves a CLI destination: `@all`/empty is broadcast, `@leader`
    /// and `@idle` stay symbolic, anything else is an agent name or id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AgentNotFound`] for an unknown name.
    pub fn resolve_address(&self, to: Option<&str>) -> Result<Address> {
        match to {
            None | Some("@all" | "") => Ok(Address::Broadcast),
            Some("@leader") => Ok(Address::Leader),
            Some("@idle") => Ok(Address::Idle),
            Some(name) => {
                let conn = self.store.conn();
                if let Some(found) = agent::get_by_name(conn, name)? {
                    return Ok(Address::Agent(found.id));
                }
                if let Some(found) = agent::get(conn, name)? {
                    return Ok(Address::Agent(found.id));
                }
                Err(Error::AgentNotFound {
                    agent_id: name.to_string(),
                })
            },
        }
    }

    /// Sends a chat message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AgentNotFound`] for an unknown destination.
    pub fn send_message(&mut self, to: Option<&str>, content: &str) -> Result<Message> {
        let me = self.require_agent()?;
        self.prologue(&me.id)?;
        let address = self.resolve_address(to)?;
        message::send(
            self.store.conn(),
            &me.id,
            &address,
            content,
            message::MessageType::Chat,
            None,
        )
    }

    /// Reads the caller's inbox, marking returned messages read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotJoined`] when the session has no live agent.
    pub fn inbox(&mut self, unread_only: bool, limit: u32) -> Result<Vec<Message>> {
        let me = self.require_agent()?;
        self.prologue(&me.id)?;

        let conn = self.store.conn();
        let standing = Standing {
            is_leader: leader::is_leader(conn, &me.id)?,
            is_idle: me.current_task_id.is_none(),
        };
        message::read_inbox(conn, &me.id, standing, unread_only, limit)
    }

    /// Sends a request and blocks for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when nobody answers in time.
    pub fn ask(&mut self, to: Option<&str>, content: &str, timeout: Duration) -> Result<Message> {
        let me = self.require_agent()?;
        self.prologue(&me.id)?;
        let address = self.resolve_address(to)?;
        message::ask(&self.store, &me.id, &address, content, timeout)
    }

    /// Answers a request by message id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageNotFound`] for an unknown request.
    pub fn reply(&mut self, request_id: i64, content: &str) -> Result<Message> {
        let me = self.require_agent()?;
        self.prologue(&me.id)?;
        message::reply(self.store.conn(), &me.id, request_id, content)
    }

    /// Resolves an agent id to its display name, falling back to the id
    /// prefix for departed agents.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn display_name(&self, agent_id: &str) -> Result<String> {
        Ok(agent::get(self.store.conn(), agent_id)?
            .map_or_else(|| agent_id.chars().take(8).collect(), |a| a.name))
    }

    // ------------------------------------------------------------------
    // File locks
    // ------------------------------------------------------------------

    /// Takes an exclusive lock on a path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockHeld`] with the owner when contended.
    pub fn lock(&mut self, path: &str) -> Result<FileLock> {
        let me = self.require_agent()?;
        self.prologue(&me.id)?;
        let me_id = me.id;
        let path = path.to_string();
        self.store.with_tx(|tx| lock::acquire(tx, &path, &me_id))
    }

    /// Releases a lock the caller owns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] when the caller is not the
    /// owner.
    pub fn unlock(&mut self, path: &str) -> Result<()> {
        let me = self.require_agent()?;
        self.prologue(&me.id)?;
        let me_id = me.id;
        let path = path.to_string();
        self.store.with_tx(|tx| lock::release(tx, &path, &me_id))
    }

    /// Lists all currently held locks.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn locks(&self) -> Result<Vec<FileLock>> {
        lock::all(self.store.conn())
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Project-wide status snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub fn status(&self) -> Result<StatusReport> {
        let conn = self.store.conn();
        let current_leader = leader::get(conn)?;
        let leader_name = match &current_leader {
            Some(l) => agent::get(conn, &l.agent_id)?.map(|a| a.name),
            None => None,
        };
        Ok(StatusReport {
            leader: current_leader,
            leader_name,
            agents: agent::all(conn, Some(AgentStatus::Active))?,
            counts: task::counts(conn)?,
            recent_events: event::tail(conn, &EventFilter::default(), 5)?,
        })
    }

    /// All agents regardless of status.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn agents(&self, status: Option<AgentStatus>) -> Result<Vec<Agent>> {
        agent::all(self.store.conn(), status)
    }

    /// Event log tail.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn log_tail(&self, filter: &EventFilter, limit: u32) -> Result<Vec<Event>> {
        event::tail(self.store.conn(), filter, limit)
    }

    /// Resolves an agent name to its id for log filtering.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AgentNotFound`] for an unknown name.
    pub fn agent_id_by_name(&self, name: &str) -> Result<String> {
        agent::get_by_name(self.store.conn(), name)?
            .map(|a| a.id)
            .ok_or_else(|| Error::AgentNotFound {
                agent_id: name.to_string(),
            })
    }

    /// Runs the recovery sweep immediately, regardless of spacing.
    ///
    /// # Errors
    ///
    /// Returns an error if a statement fails.
    pub fn recover_now(&mut self) -> Result<SweepReport> {
        if let Some(me) = self.current_agent()? {
            agent::heartbeat(self.store.conn(), &me.id)?;
        }
        let config = self.config.clone();
        self.store.with_tx(|tx| recovery::sweep(tx, &config))
    }

    /// Health checks for `doctor`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store is unreachable outright.
    pub fn doctor(&self) -> Result<Vec<HealthCheck>> {
        let conn = self.store.conn();
        let mut checks = Vec::new();

        let version = self.store.schema_version()?;
        checks.push(HealthCheck {
            name: "schema".into(),
            ok: version >= 1,
            detail: format!("version {version}"),
        });

        match leader::get(conn)? {
            Some(l) if l.is_expired() => checks.push(HealthCheck {
                name: "leader".into(),
                ok: false,
                detail: format!("lease expired at {}", l.lease_expires_at),
            }),
            Some(l) => checks.push(HealthCheck {
                name: "leader".into(),
                ok: true,
                detail: format!("term {}", l.term),
            }),
            None => checks.push(HealthCheck {
                name: "leader".into(),
                ok: true,
                detail: "none elected yet".into(),
            }),
        }

        let cutoff = util::to_rfc3339(
            chrono::Utc::now()
                - chrono::Duration::seconds(self.config.agent_dead_threshold_seconds as i64),
        );
        let stale: Vec<String> = agent::all(conn, Some(AgentStatus::Active))?
            .into_iter()
            .filter(|a| a.last_heartbeat_at < cutoff)
            .map(|a| a.name)
            .collect();
        checks.push(HealthCheck {
            name: "heartbeats".into(),
            ok: stale.is_empty(),
            detail: if stale.is_empty() {
                "all agents recent".into()
            } else {
                format!("stale: {}", stale.join(", "))
            },
        });

        let stuck_cutoff = util::to_rfc3339(
            chrono::Utc::now()
                - chrono::Duration::seconds(self.config.task_claim_timeout_seconds as i64),
        );
        let stuck = task::stale_claims(conn, &stuck_cutoff)?;
        checks.push(HealthCheck {
            name: "claims".into(),
            ok: stuck.is_empty(),
            detail: if stuck.is_empty() {
                "no stuck tasks".into()
            } else {
                format!(
                    "stuck: {}",
                    stuck
                        .iter()
                        .map(|t| t.id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            },
        });

        Ok(checks)
    }

    /// Whether an agent's recorded process is still running.
    #[must_use]
    pub fn probe_process(pid: Option<i64>) -> bool {
        pid.is_some_and(recovery::process_exists)
    }
}
