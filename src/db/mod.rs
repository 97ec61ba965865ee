//! SQLite persistence: schema, row-level queries, and the
//! [`StorageCollaborator`](crate::storage::StorageCollaborator) built on them.

mod migrations;
pub mod queries;
mod storage;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use thiserror::Error;

pub use storage::SqliteStorage;

/// How long a statement waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl DbError {
    /// Busy/locked databases clear up on their own; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

/// One serialized connection shared by the storage layer.
pub struct Database {
    conn: Mutex<Connection>,
    location: String,
}

impl Database {
    /// Open (or create) the database file at `path` and bring its schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn, path.display().to_string())
    }

    /// Database that lives as long as the process. WAL does not apply here.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn init(conn: Connection, location: String) -> Result<Self, DbError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_migrations(&conn)?;
        tracing::debug!(%location, "database ready");
        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    /// File path, or `:memory:`.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Lock the connection. A panic while another caller held the lock
    /// leaves SQLite itself consistent, so the guard is recovered.
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        Ok(self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(location = %self.location, "recovering poisoned database lock");
            poisoned.into_inner()
        }))
    }
}
