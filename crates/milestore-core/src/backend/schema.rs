//! SQLite schemas for the hybrid index and the embedded database.
//!
//! Both databases are versioned with `PRAGMA user_version`; each pending
//! migration runs in its own transaction. DDL uses `IF NOT EXISTS` so a
//! migration interrupted before the version bump re-runs cleanly.
//!
//! Connections run with:
//! - `journal_mode = WAL` so readers never block the single writer
//! - `busy_timeout = 5s` to ride out short lock contention between processes
//! - `foreign_keys = ON` for the dependency edge tables

use rusqlite::{Connection, types::Type};
use std::path::Path;
use std::time::Duration;

use super::BackendKind;
use crate::error::{IoContext, StoreError};
use crate::recovery;

/// Busy timeout applied to every connection.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long opening a database waits out another process's exclusive lock.
const OPEN_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

pub const INDEX_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_meta (id, schema_version) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS unit_index (
    unit_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    last_sequence INTEGER NOT NULL,
    progress_percent INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS unit_dependencies (
    unit_id TEXT NOT NULL REFERENCES unit_index(unit_id) ON DELETE CASCADE,
    depends_on TEXT NOT NULL,
    PRIMARY KEY (unit_id, depends_on)
);

CREATE INDEX IF NOT EXISTS idx_unit_index_status
    ON unit_index(status, unit_id);
CREATE INDEX IF NOT EXISTS idx_unit_dependencies_target
    ON unit_dependencies(depends_on, unit_id);
";

pub const STORE_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_meta (id, schema_version) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS work_units (
    unit_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    last_sequence INTEGER NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    unit_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    kind TEXT NOT NULL,
    writer_id TEXT NOT NULL,
    recorded_at_us INTEGER NOT NULL,
    line TEXT NOT NULL,
    PRIMARY KEY (unit_id, sequence)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS unit_dependencies (
    unit_id TEXT NOT NULL REFERENCES work_units(unit_id) ON DELETE CASCADE,
    depends_on TEXT NOT NULL,
    PRIMARY KEY (unit_id, depends_on)
);

CREATE INDEX IF NOT EXISTS idx_work_units_status
    ON work_units(status, unit_id);
CREATE INDEX IF NOT EXISTS idx_unit_dependencies_target
    ON unit_dependencies(depends_on, unit_id);
";

/// Writer activity lookups for the scale monitor.
pub const STORE_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_recorded_at
    ON events(recorded_at_us, writer_id);
";

pub const INDEX_MIGRATIONS: &[(u32, &str)] = &[(1, INDEX_V1_SQL)];
pub const STORE_MIGRATIONS: &[(u32, &str)] = &[(1, STORE_V1_SQL), (2, STORE_V2_SQL)];

/// Indexes every migrated store database must carry.
pub const REQUIRED_STORE_INDEXES: &[&str] = &[
    "idx_work_units_status",
    "idx_unit_dependencies_target",
    "idx_events_recorded_at",
];

/// Read `PRAGMA user_version` as a `u32`.
///
/// # Errors
///
/// Query failure or a version that does not fit in `u32`.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply every migration newer than the database's version, in order.
///
/// # Errors
///
/// The first failing migration's error; earlier ones stay applied.
pub fn migrate(conn: &mut Connection, migrations: &[(u32, &str)]) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;

    for (version, sql) in migrations {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.execute(
            "UPDATE schema_meta SET schema_version = ?1 WHERE id = 1",
            [i64::from(*version)],
        )?;
        tx.commit()?;
        current = *version;
    }

    Ok(current)
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Open (or create) the database at `path`, configure it and bring its
/// schema up to date.
///
/// # Errors
///
/// [`StoreError::Io`] if the parent directory cannot be created,
/// [`StoreError::Sqlite`] for open, pragma or migration failures.
pub fn open_database(
    path: &Path,
    backend: BackendKind,
    migrations: &[(u32, &str)],
    durable: bool,
) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }

    let mut conn = recovery::open_db_with_retry(path, OPEN_RETRY_TIMEOUT, |p| {
        let conn = Connection::open(p)?;
        configure_connection(&conn)?;
        Ok(conn)
    })
    .map_err(StoreError::sqlite(backend))?;

    if durable {
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(StoreError::sqlite(backend))?;
    }

    let version = migrate(&mut conn, migrations).map_err(StoreError::sqlite(backend))?;
    tracing::debug!(path = %path.display(), %backend, version, "database ready");
    Ok(conn)
}
