//! SQLite schema for the event store.
//!
//! The `events` table layout predates this crate; column names and types are
//! kept so existing databases open unchanged. Such databases carry no `meta`
//! row and are stamped on first open.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::errors::IngestResult;

/// Layout version written to `meta.schema_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// DDL for the current layout. Every statement is safe to replay.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS events (
        hash TEXT PRIMARY KEY,
        timestamp TEXT,
        userid TEXT,
        client TEXT,
        operation TEXT,
        status TEXT,
        rowcount INTEGER,
        logline TEXT
    );",
    "CREATE INDEX IF NOT EXISTS idx_events_userid_timestamp
        ON events(userid, timestamp);",
];

/// Create missing tables and indexes, then stamp [`SCHEMA_VERSION`].
///
/// Runs in one transaction. A database stamped with a newer version is left
/// as it is.
pub fn ensure_schema(conn: &Connection) -> IngestResult<()> {
    let tx = conn.unchecked_transaction()?;
    for stmt in SCHEMA_STATEMENTS {
        tx.execute_batch(stmt)?;
    }

    match stored_version(&tx)? {
        Some(found) if found > SCHEMA_VERSION => {
            warn!("database schema v{found} is newer than v{SCHEMA_VERSION}; leaving it as is");
        }
        Some(found) if found == SCHEMA_VERSION => {}
        found => {
            tx.execute(
                "INSERT INTO meta(key, value) VALUES('schema_version', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
                params![SCHEMA_VERSION.to_string()],
            )?;
            debug!("stamped schema v{SCHEMA_VERSION} (was {found:?})");
        }
    }

    tx.commit()?;
    Ok(())
}

/// Version recorded in `meta`, or `None` when unstamped or unreadable.
pub fn stored_version(conn: &Connection) -> IngestResult<Option<i32>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version';",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()))
}
