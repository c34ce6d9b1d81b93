//! Typed query helpers for the state store.

use std::fmt;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{Database, CURSOR_KEY};
use crate::changeset::Changeset;
use crate::errors::DatabaseError;

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// A queued changeset together with its queue position.
#[derive(Debug, Clone)]
pub struct PendingChangeset {
    pub seq: i64,
    pub changeset: Changeset,
    pub queued_at: String,
}

/// Event kinds recorded in `apply_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyEvent {
    Fetched,
    Applied,
    Conflict,
    Failed,
    Bootstrap,
}

impl ApplyEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyEvent::Fetched => "fetched",
            ApplyEvent::Applied => "applied",
            ApplyEvent::Conflict => "conflict",
            ApplyEvent::Failed => "failed",
            ApplyEvent::Bootstrap => "bootstrap",
        }
    }
}

impl fmt::Display for ApplyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row from the `apply_log` table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApplyLogEntry {
    pub id: i64,
    pub run_id: String,
    pub revision: Option<String>,
    pub event: String,
    pub detail: Option<String>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- pending_changesets -------------------------------------------------

    /// Append changesets to the queue, all or nothing.
    pub fn push_pending(&self, changesets: &[Changeset]) -> Result<usize, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self.transaction(|conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO pending_changesets (revision, payload, queued_at) VALUES (?1, ?2, ?3)",
            )?;
            for cs in changesets {
                let payload =
                    serde_json::to_string(cs).map_err(|e| DatabaseError::CorruptRecord {
                        seq: 0,
                        detail: e.to_string(),
                    })?;
                stmt.execute(params![cs.revision(), payload, now])?;
            }
            Ok(changesets.len())
        })?;
        debug!(count, "queued changesets");
        Ok(count)
    }

    /// Oldest queued changeset, if any.
    pub fn next_pending(&self) -> Result<Option<PendingChangeset>, DatabaseError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT seq, payload, queued_at FROM pending_changesets ORDER BY seq LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(decode_pending).transpose()
    }

    /// Every queued changeset in apply order.
    pub fn pending(&self) -> Result<Vec<PendingChangeset>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT seq, payload, queued_at FROM pending_changesets ORDER BY seq")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<(i64, String, String)>, _>>()?;
        rows.into_iter().map(decode_pending).collect()
    }

    pub fn pending_count(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_changesets", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Drop queue entry `seq` and move the cursor to `revision` in one
    /// transaction. Fails without touching the cursor if `seq` is gone.
    pub fn checkpoint(&self, seq: i64, revision: &str) -> Result<(), DatabaseError> {
        self.transaction(|conn| {
            let removed = conn.execute(
                "DELETE FROM pending_changesets WHERE seq = ?1",
                params![seq],
            )?;
            if removed == 0 {
                return Err(DatabaseError::NotFound {
                    entity: "pending changeset".into(),
                    id: seq.to_string(),
                });
            }
            upsert_state(conn, CURSOR_KEY, revision)
        })?;
        debug!(seq, revision, "checkpoint written");
        Ok(())
    }

    // -- kv_state -----------------------------------------------------------

    /// Get a key-value state entry.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a key-value state entry (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        upsert_state(&conn, key, value)?;
        debug!(key, value, "set kv_state");
        Ok(())
    }

    // -- apply_log ----------------------------------------------------------

    pub fn insert_apply_log(
        &self,
        run_id: &str,
        revision: Option<&str>,
        event: ApplyEvent,
        detail: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO apply_log (run_id, revision, event, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, revision, event.as_str(), detail, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent apply log entries, newest first.
    pub fn list_apply_log(&self, limit: u32) -> Result<Vec<ApplyLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, revision, event, detail, created_at
             FROM apply_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(ApplyLogEntry {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    revision: row.get(2)?,
                    event: row.get(3)?,
                    detail: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn upsert_state(conn: &Connection, key: &str, value: &str) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now],
    )?;
    Ok(())
}

fn decode_pending(
    (seq, payload, queued_at): (i64, String, String),
) -> Result<PendingChangeset, DatabaseError> {
    let changeset = serde_json::from_str(&payload).map_err(|e| DatabaseError::CorruptRecord {
        seq,
        detail: e.to_string(),
    })?;
    Ok(PendingChangeset {
        seq,
        changeset,
        queued_at,
    })
}
