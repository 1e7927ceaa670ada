//! aqua - coordinate multiple CLI agents on a shared workload.
//!
//! Every invocation is short-lived: it opens the project-local store under
//! `.aqua/`, performs one operation, and exits. Identity persists across
//! invocations through session files, so agents can keep calling `aqua`
//! from fresh processes without re-introducing themselves.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod output;

/// aqua - autonomous quorum of agents
#[derive(Parser, Debug)]
#[command(name = "aqua")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Machine-readable JSON output (also via AQUA_JSON=1)
    #[arg(long, global = true)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Agent kind accepted by `join`.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum KindArg {
    /// Claude Code.
    Claude,
    /// Codex CLI.
    Codex,
    /// Gemini CLI.
    Gemini,
    /// Anything else.
    #[default]
    Generic,
}

impl From<KindArg> for aqua_core::AgentKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Claude => Self::Claude,
            KindArg::Codex => Self::Codex,
            KindArg::Gemini => Self::Gemini,
            KindArg::Generic => Self::Generic,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    // === Project ===
    /// Initialize aqua in the current directory
    Init,

    /// Show quorum status: leader, agents, tasks, recent activity
    Status,

    /// Run health checks
    Doctor,

    /// Run the recovery sweep now
    Recover,

    /// View the event log
    Log {
        /// Filter by agent name
        #[arg(long)]
        agent: Option<String>,

        /// Filter by task id
        #[arg(long)]
        task: Option<String>,

        /// Filter by event type
        #[arg(long = "type")]
        event_type: Option<String>,

        /// Number of events to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },

    // === Agent membership ===
    /// Register as an agent in the quorum
    Join {
        /// Agent name (generated if not provided)
        #[arg(short, long)]
        name: Option<String>,

        /// Agent kind
        #[arg(short = 't', long = "type", value_enum, default_value = "generic")]
        kind: KindArg,

        /// Capability label (repeatable)
        #[arg(short, long = "cap")]
        capabilities: Vec<String>,

        /// Role label steering task preference
        #[arg(long)]
        role: Option<String>,
    },

    /// Leave the quorum
    Leave {
        /// Leave even while holding a task (it returns to the queue)
        #[arg(long)]
        force: bool,
    },

    /// Restore identity and context for this session
    Refresh,

    /// List agents and whether their processes are alive
    Ps,

    // === Tasks ===
    /// Add a task to the queue
    Add {
        /// One-line task title
        title: String,

        /// Longer description
        #[arg(short, long)]
        description: Option<String>,

        /// Priority 1-10, higher first
        #[arg(short, long)]
        priority: Option<i64>,

        /// Tag label (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Free-form context for the implementer
        #[arg(long)]
        context: Option<String>,

        /// Parent task: an id or a fuzzy title match (repeatable)
        #[arg(long)]
        after: Vec<String>,
    },

    /// List tasks
    #[command(alias = "ls")]
    List {
        /// Filter by status (pending, claimed, done, failed, abandoned)
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by tag
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Show task details
    Show {
        /// Task id; defaults to your current task
        task_id: Option<String>,
    },

    /// Claim a task
    Claim {
        /// Specific task id; defaults to the best available
        task_id: Option<String>,
    },

    /// Mark a task complete
    Done {
        /// Task id; defaults to your current task
        task_id: Option<String>,

        /// Completion summary
        #[arg(short, long)]
        summary: Option<String>,
    },

    /// Mark a task failed
    Fail {
        /// Task id; defaults to your current task
        task_id: Option<String>,

        /// Failure reason
        #[arg(short, long)]
        reason: String,
    },

    /// Report progress on your current task
    Progress {
        /// What you are doing right now
        message: String,
    },

    /// Thread pending tasks into a linear chain with checkpoints
    Serialize {
        /// Insert a checkpoint after every N-th task
        #[arg(long, default_value = "1")]
        stride: usize,
    },

    // === Messaging ===
    /// Send a message
    Msg {
        /// Message body
        message: String,

        /// Recipient: agent name, @all, @leader, or @idle
        #[arg(long)]
        to: Option<String>,
    },

    /// Read messages
    Inbox {
        /// Only unread messages
        #[arg(long)]
        unread: bool,

        /// Number of messages to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: u32,
    },

    /// Send a question and wait for the reply
    Ask {
        /// Question body
        message: String,

        /// Recipient: agent name, @all, @leader, or @idle
        #[arg(long)]
        to: Option<String>,

        /// Seconds to wait for a reply
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Answer a question by message id
    Reply {
        /// Id of the request being answered
        message_id: i64,

        /// Answer body
        message: String,
    },

    // === File locks ===
    /// Take an exclusive lock on a file path
    Lock {
        /// Path to lock
        path: String,
    },

    /// Release a lock you hold
    Unlock {
        /// Path to unlock
        path: String,
    },

    /// List held locks
    Locks,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let json = output::json_mode(cli.json);
    let outcome = run(cli.command, json);

    if let Err(error) = outcome {
        let code = output::report_error(json, &error);
        std::process::exit(i32::from(code));
    }
}

fn run(command: Commands, json: bool) -> aqua_core::Result<()> {
    match command {
        Commands::Init => commands::init::run(json),
        Commands::Status => commands::admin::status(json),
        Commands::Doctor => commands::admin::doctor(json),
        Commands::Recover => commands::admin::recover(json),
        Commands::Log {
            agent,
            task,
            event_type,
            limit,
        } => commands::admin::log(json, agent.as_deref(), task, event_type, limit),
        Commands::Join {
            name,
            kind,
            capabilities,
            role,
        } => commands::agent::join(json, name, kind.into(), capabilities, role),
        Commands::Leave { force } => commands::agent::leave(json, force),
        Commands::Refresh => commands::agent::refresh(json),
        Commands::Ps => commands::agent::ps(json),
        Commands::Add {
            title,
            description,
            priority,
            tags,
            context,
            after,
        } => commands::task::add(json, title, description, priority, tags, context, &after),
        Commands::List { status, tag } => commands::task::list(json, status.as_deref(), tag),
        Commands::Show { task_id } => commands::task::show(json, task_id.as_deref()),
        Commands::Claim { task_id } => commands::task::claim(json, task_id.as_deref()),
        Commands::Done { task_id, summary } => {
            commands::task::done(json, task_id.as_deref(), summary.as_deref())
        },
        Commands::Fail { task_id, reason } => {
            commands::task::fail(json, task_id.as_deref(), &reason)
        },
        Commands::Progress { message } => commands::task::progress(json, &message),
        Commands::Serialize { stride } => commands::task::serialize(json, stride),
        Commands::Msg { message, to } => commands::msg::send(json, &message, to.as_deref()),
        Commands::Inbox { unread, limit } => commands::msg::inbox(json, unread, limit),
        Commands::Ask {
            message,
            to,
            timeout,
        } => commands::msg::ask(json, &message, to.as_deref(), timeout),
        Commands::Reply {
            message_id,
            message,
        } => commands::msg::reply(json, message_id, &message),
        Commands::Lock { path } => commands::lock::lock(json, &path),
        Commands::Unlock { path } => commands::lock::unlock(json, &path),
        Commands::Locks => commands::lock::list(json),
    }
}
