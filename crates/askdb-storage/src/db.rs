//! Session database handle.
//!
//! One rusqlite connection behind a mutex. File databases run in WAL mode so
//! a second process (another CLI window) can read history while this one
//! appends turns.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::info;

use askdb_core::error::AskError;

use crate::migrations;

/// How long a writer waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the session database at `path`, creating parent
    /// directories, then bring the schema up to date.
    pub fn new(path: &Path) -> Result<Self, AskError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage("open session database"))?;
        let db = Self::configure(conn, true)?;
        info!(path = %path.display(), "Session database ready");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, AskError> {
        let conn = Connection::open_in_memory().map_err(storage("open in-memory database"))?;
        Self::configure(conn, false)
    }

    fn configure(conn: Connection, on_disk: bool) -> Result<Self, AskError> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(storage("set busy timeout"))?;
        let pragmas = if on_disk {
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;"
        } else {
            "PRAGMA foreign_keys = ON;"
        };
        conn.execute_batch(pragmas).map_err(storage("set pragmas"))?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AskError> {
        self.conn
            .lock()
            .map_err(|e| AskError::Storage(format!("session database lock poisoned: {e}")))
    }

    /// Run `f` against the connection while holding the lock.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, AskError>
    where
        F: FnOnce(&Connection) -> Result<T, AskError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside a transaction, committing only when it returns `Ok`.
    pub fn in_transaction<F, T>(&self, f: F) -> Result<T, AskError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, AskError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage("begin transaction"))?;
        let value = f(&tx)?;
        tx.commit().map_err(storage("commit transaction"))?;
        Ok(value)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// Map a rusqlite error to [`AskError::Storage`] with a short description of
/// what was being attempted.
pub(crate) fn storage(action: &'static str) -> impl Fn(rusqlite::Error) -> AskError {
    move |e| AskError::Storage(format!("failed to {action}: {e}"))
}
