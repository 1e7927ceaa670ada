//! `SQLite`-backed coordination store.
//!
//! One file under `.aqua/` holds all coordination state. The store opens in
//! WAL mode with a generous busy timeout so concurrent short-lived clients
//! serialize rather than fail, and every write runs inside a
//! `BEGIN IMMEDIATE` transaction so the writer slot is taken eagerly and
//! lock upgrades cannot deadlock.
//!
//! Schema versioning lives in the `user_version` pragma: [`MIGRATIONS`] is a
//! forward-only list, and opening the store applies every migration past the
//! recorded version, in order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Name of the project-local state directory.
pub const AQUA_DIR: &str = ".aqua";

/// Name of the database file inside [`AQUA_DIR`].
pub const DB_FILE: &str = "aqua.db";

/// Forward-only schema migrations; index + 1 is the resulting version.
const MIGRATIONS: &[&str] = &[include_str!("schema.sql")];

/// Maximum attempts for a busy write transaction.
const BUSY_RETRIES: u32 = 5;

/// Walks upward from `start` looking for a directory containing `.aqua`.
#[must_use]
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(candidate) = dir {
        if candidate.join(AQUA_DIR).is_dir() {
            return Some(candidate.to_path_buf());
        }
        dir = candidate.parent();
    }
    None
}

/// Handle to the coordination store of one project.
pub struct Store {
    conn: Connection,
    aqua_dir: PathBuf,
}

impl Store {
    /// Opens the store for a project root, creating the `.aqua` directory,
    /// sessions directory, and database file if needed.
    ///
    /// The directory is created mode 0700 and the database file 0600; the
    /// store is plaintext and the security model is a trusted local user.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem refuses the layout or the
    /// database cannot be opened or migrated.
    pub fn create(project_root: &Path) -> Result<Self> {
        let aqua_dir = project_root.join(AQUA_DIR);
        create_private_dir(&aqua_dir)?;
        create_private_dir(&aqua_dir.join("sessions"))?;
        Self::open_dir(aqua_dir)
    }

    /// Opens the store for an existing `.aqua` directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if the directory does not exist.
    pub fn open(project_root: &Path) -> Result<Self> {
        let aqua_dir = project_root.join(AQUA_DIR);
        if !aqua_dir.is_dir() {
            return Err(Error::NotInitialized);
        }
        Self::open_dir(aqua_dir)
    }

    fn open_dir(aqua_dir: PathBuf) -> Result<Self> {
        let db_path = aqua_dir.join(DB_FILE);
        let created = !db_path.exists();

        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        if created {
            restrict_file_mode(&db_path)?;
        }

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;

        let store = Self { conn, aqua_dir };
        store.migrate()?;
        Ok(store)
    }

    /// Opens an in-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn,
            aqua_dir: PathBuf::new(),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Applies every migration past the recorded `user_version`.
    fn migrate(&self) -> Result<()> {
        let version: usize =
            self.conn
                .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))? as usize;

        for (index, sql) in MIGRATIONS.iter().enumerate().skip(version) {
            debug!(from = version, to = index + 1, "applying store migration");
            self.conn.execute_batch(sql)?;
            self.conn
                .pragma_update(None, "user_version", (index + 1) as i64)?;
        }
        Ok(())
    }

    /// Current schema version as recorded in the `user_version` pragma.
    ///
    /// # Errors
    ///
    /// Returns an error if the pragma cannot be read.
    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// The `.aqua` directory this store lives in.
    #[must_use]
    pub fn aqua_dir(&self) -> &Path {
        &self.aqua_dir
    }

    /// Read-only access to the underlying connection.
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Runs `op` inside a `BEGIN IMMEDIATE` transaction, retrying on a
    /// busy or locked database with exponential backoff plus jitter.
    ///
    /// The closure may run more than once, so it must not have side
    /// effects outside the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreBusy`] once every attempt is exhausted, or the
    /// first non-transient error from `op`.
    pub fn with_tx<T>(&mut self, mut op: impl FnMut(&Transaction<'_>) -> Result<T>) -> Result<T> {
        for attempt in 0..BUSY_RETRIES {
            let outcome = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(Error::from)
                .and_then(|tx| {
                    let value = op(&tx)?;
                    tx.commit()?;
                    Ok(value)
                });

            match outcome {
                Err(Error::Store(ref cause)) if is_busy(cause) => {
                    let backoff = backoff_with_jitter(attempt);
                    warn!(attempt, ?backoff, "store busy, retrying");
                    std::thread::sleep(backoff);
                },
                other => return other,
            }
        }
        Err(Error::StoreBusy {
            attempts: BUSY_RETRIES,
        })
    }
}

/// `100ms * 2^attempt` plus up to 100ms of jitter.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 100u64 << attempt;
    let jitter = rand::random::<u64>() % 100;
    Duration::from_millis(base + jitter)
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Creates a directory with owner-only permissions if it does not exist.
fn create_private_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if !path.is_dir() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)?;
    }
    Ok(())
}

/// Restricts a file to owner read/write.
fn restrict_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
