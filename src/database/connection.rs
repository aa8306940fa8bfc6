//! SQLite access for the identity core
//!
//! One connection behind a mutex, opened in WAL mode with foreign keys
//! enforced and a busy timeout matching the core's I/O budget, migrated
//! on open. Identity state is small and single-node; there is no
//! default database location — `db_path` is required configuration.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;

use super::schema;

/// Writers queue behind the connection mutex; SQLite itself gets the
/// same five seconds the rest of the core allows external calls.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the identity database.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) and migrate the database at `path`.
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // WAL keeps readers unblocked while the orchestrator audits.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .context("Failed to enable WAL")?;

        Self::bootstrap(conn, path)
    }

    /// In-memory database for tests. Shares the migration path with
    /// file-backed databases so schema drift shows up in unit tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::bootstrap(conn, PathBuf::from(":memory:"))
    }

    fn bootstrap(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;

        schema::create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Run a closure against the connection. This is the only way in;
    /// a poisoned lock surfaces as an error instead of a panic so one
    /// crashed writer cannot take the control plane down with it.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database lock poisoned"))?;
        f(&conn)
    }

    /// Get database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            path: self.path.clone(),
        }
    }
}
