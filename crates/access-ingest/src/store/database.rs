//! SQLite event store with content-hash deduplication.
//!
//! One connection, one writer. Every upsert runs in its own immediate
//! transaction and is committed before the call returns, so a crash never
//! leaves half a row and one record's check never interleaves with another
//! record's insert.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::errors::IngestResult;
use crate::models::{PersistedEvent, UpsertOutcome};
use crate::store::schema;

// ---------------------------------------------------------------------------
// Helper: tilde expansion
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersistedEvent> {
    Ok(PersistedEvent {
        content_hash: row.get(0)?,
        timestamp: row.get(1)?,
        user_id: row.get(2)?,
        client_ip: row.get(3)?,
        operation: row.get(4)?,
        status: row.get(5)?,
        row_count: row.get(6)?,
        raw_line: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

/// Persisted set of events keyed by content hash.
pub struct EventStore {
    conn: Connection,
    db_path: Option<PathBuf>,
}

impl EventStore {
    /// Open (or create) the database at `db_path`. The path is expanded and
    /// parent directories are created if they do not already exist.
    pub fn open(db_path: &Path) -> IngestResult<Self> {
        let expanded = expand_tilde(&db_path.to_string_lossy());
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(&expanded)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&resolved)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let store = Self {
            conn,
            db_path: Some(resolved),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> IngestResult<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
            db_path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Resolved database path; `None` for in-memory stores.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Create missing tables and stamp the schema version. Safe to call
    /// repeatedly.
    pub fn init_schema(&self) -> IngestResult<()> {
        schema::ensure_schema(&self.conn)
    }

    /// Whether an event with this hash is already stored.
    pub fn exists(&self, content_hash: &str) -> IngestResult<bool> {
        Self::exists_in(&self.conn, content_hash)
    }

    fn exists_in(conn: &Connection, content_hash: &str) -> IngestResult<bool> {
        let present = conn
            .query_row(
                "SELECT 1 FROM events WHERE hash = ?1 LIMIT 1;",
                params![content_hash],
                |_| Ok(()),
            )
            .optional()?;
        Ok(present.is_some())
    }

    /// Insert `event` unless its hash is already present, committing before
    /// returning.
    pub fn upsert_if_new(&mut self, event: &PersistedEvent) -> IngestResult<UpsertOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if Self::exists_in(&tx, &event.content_hash)? {
            debug!("db already has {}", event.content_hash);
            tx.commit()?;
            return Ok(UpsertOutcome::AlreadyPresent);
        }

        tx.execute(
            "INSERT INTO events (hash, timestamp, userid, client, operation, status, rowcount, logline) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                event.content_hash,
                event.timestamp,
                event.user_id,
                event.client_ip,
                event.operation,
                event.status,
                event.row_count,
                event.raw_line,
            ],
        )?;
        tx.commit()?;
        info!("adding {} to db", event.content_hash);
        Ok(UpsertOutcome::Inserted)
    }

    /// Fetch one stored event by hash.
    pub fn get(&self, content_hash: &str) -> IngestResult<Option<PersistedEvent>> {
        let event = self
            .conn
            .query_row(
                "SELECT hash, timestamp, userid, client, operation, status, rowcount, logline \
                 FROM events WHERE hash = ?1;",
                params![content_hash],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Total number of stored events.
    pub fn count(&self) -> IngestResult<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM events;", [], |row| row.get(0))?;
        Ok(n)
    }
}
