//! SQLite state store.
//!
//! Holds the durable queue of not-yet-applied changesets, the resume cursor
//! (the revision of the last successfully applied changeset) and an audit
//! log of engine events. One database belongs to one source/target pairing.

pub mod queries;
pub mod schema;

pub use queries::{ApplyEvent, ApplyLogEntry, PendingChangeset};

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// `kv_state` key holding the last applied revision.
pub const CURSOR_KEY: &str = "cursor";

/// `kv_state` key holding the engine's last persisted state.
pub const SYNC_STATE_KEY: &str = "sync_state";

const FILE_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
";

/// Handle to the state store.
///
/// Running two engines against the same file is not supported; the
/// connection mutex only serializes callers inside one process.
pub struct Database {
    conn: Mutex<Connection>,
}

/// Resume point, queue depth and engine state, read in one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSnapshot {
    pub cursor: Option<String>,
    pub pending: i64,
    pub sync_state: Option<String>,
}

impl Database {
    /// Open the state store at `path`, creating its directory and bringing
    /// the schema up to date.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        info!(path = %path.display(), "opening state store");

        let conn = Connection::open(path)?;
        conn.execute_batch(FILE_PRAGMAS)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;
        Ok(db)
    }

    /// A migrated store that lives only as long as the handle.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Apply outstanding schema migrations. Safe to call repeatedly.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        schema::run_migrations(&self.conn())?;
        debug!("state store schema is current");
        Ok(())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("state store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` in a transaction that commits only if `f` succeeds.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // -- resume point -------------------------------------------------------

    /// Revision of the last successfully applied changeset.
    pub fn cursor(&self) -> Result<Option<String>, DatabaseError> {
        self.get_state(CURSOR_KEY)
    }

    pub fn set_cursor(&self, revision: &str) -> Result<(), DatabaseError> {
        self.set_state(CURSOR_KEY, revision)
    }

    /// True once a cursor exists or anything has been queued.
    pub fn is_bootstrapped(&self) -> Result<bool, DatabaseError> {
        let snapshot = self.snapshot()?;
        Ok(snapshot.cursor.is_some() || snapshot.pending > 0)
    }

    pub fn snapshot(&self) -> Result<StoreSnapshot, DatabaseError> {
        self.transaction(|conn| {
            let read = |key: &str| {
                conn.query_row(
                    "SELECT value FROM kv_state WHERE key = ?1",
                    [key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            };
            Ok(StoreSnapshot {
                cursor: read(CURSOR_KEY)?,
                pending: conn.query_row("SELECT COUNT(*) FROM pending_changesets", [], |row| {
                    row.get(0)
                })?,
                sync_state: read(SYNC_STATE_KEY)?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::Changeset;
    use chrono::Utc;

    #[test]
    fn test_open_creates_directory_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/nested/vcsmirror.db");
        {
            let db = Database::open(&path).unwrap();
            db.set_cursor("41").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.cursor().unwrap().as_deref(), Some("41"));
    }

    #[test]
    fn test_snapshot_reads_cursor_queue_and_state() {
        let db = Database::in_memory().unwrap();
        assert_eq!(
            db.snapshot().unwrap(),
            StoreSnapshot {
                cursor: None,
                pending: 0,
                sync_state: None,
            }
        );
        assert!(!db.is_bootstrapped().unwrap());

        db.push_pending(&[Changeset::new("7", Utc::now(), "ann", "", vec![], false)])
            .unwrap();
        db.set_state(SYNC_STATE_KEY, "pending").unwrap();
        let snapshot = db.snapshot().unwrap();
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.sync_state.as_deref(), Some("pending"));
        assert!(db.is_bootstrapped().unwrap());
    }

    #[test]
    fn test_transaction_rollback_on_error() {
        let db = Database::in_memory().unwrap();

        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![CURSOR_KEY, "99", "2025-01-01T00:00:00Z"],
            )?;
            Err(DatabaseError::NotFound {
                entity: "test".into(),
                id: "forced".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(db.cursor().unwrap(), None);
    }
}
