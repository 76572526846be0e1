//! Embedded-database backend: one SQLite file per store.
//!
//! Every commit is a single `IMMEDIATE` transaction that checks the unit's
//! last sequence, inserts the events, and replaces the document row and its
//! dependency edges. Documents are stored as JSON bodies next to the
//! columns the queries filter on.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::schema::{STORE_MIGRATIONS, open_database};
use super::{BackendKind, BackendOptions, StorageBackend, check_contiguous};
use crate::error::StoreError;
use crate::event::Event;
use crate::metrics::{BackendMetrics, WriteStats};
use crate::model::{Status, WorkUnit, WorkUnitId};
use crate::projection;
use crate::recovery::HealthCheckResult;

const DATABASE_FILE: &str = "store.sqlite3";
const KIND: BackendKind = BackendKind::EmbeddedDatabase;

#[derive(Debug)]
pub struct SqliteBackend {
    root: PathBuf,
    db_path: PathBuf,
    conn: Mutex<Connection>,
    options: BackendOptions,
    stats: WriteStats,
}

impl SqliteBackend {
    /// # Errors
    ///
    /// I/O failures creating `root`, SQLite open or migration failures.
    pub fn open(root: &Path, options: BackendOptions) -> Result<Self, StoreError> {
        let db_path = root.join(DATABASE_FILE);
        let conn = open_database(&db_path, KIND, STORE_MIGRATIONS, options.durable)?;
        Ok(Self {
            root: root.to_path_buf(),
            db_path,
            conn: Mutex::new(conn),
            stats: WriteStats::with_writer_window(options.writer_window),
            options,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn corrupt(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            path: self.db_path.clone(),
            reason: reason.into(),
        }
    }

    fn parse_body(&self, body: &str) -> Result<WorkUnit, StoreError> {
        serde_json::from_str(body).map_err(|err| self.corrupt(format!("document body: {err}")))
    }

    fn query_documents(
        &self,
        sql: &str,
        param: &str,
    ) -> Result<Vec<WorkUnit>, StoreError> {
        let bodies: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn.prepare_cached(sql).map_err(StoreError::sqlite(KIND))?;
            let rows = stmt
                .query_map([param], |row| row.get(0))
                .map_err(StoreError::sqlite(KIND))?;
            rows.collect::<rusqlite::Result<_>>()
                .map_err(StoreError::sqlite(KIND))?
        };
        bodies.iter().map(|body| self.parse_body(body)).collect()
    }

    /// Writers with an event recorded inside the monitoring window, across
    /// every process sharing this database.
    fn recent_db_writers(&self) -> Result<BTreeSet<String>, StoreError> {
        let window = chrono::Duration::from_std(self.options.writer_window)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let since = Utc::now()
            .checked_sub_signed(window)
            .map_or(i64::MIN, |t| t.timestamp_micros());
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT DISTINCT writer_id FROM events WHERE recorded_at_us >= ?1",
            )
            .map_err(StoreError::sqlite(KIND))?;
        let rows = stmt
            .query_map([since], |row| row.get::<_, String>(0))
            .map_err(StoreError::sqlite(KIND))?;
        rows.collect::<rusqlite::Result<_>>()
            .map_err(StoreError::sqlite(KIND))
    }
}

fn write_document(conn: &Connection, doc: &WorkUnit) -> Result<(), StoreError> {
    let body = serde_json::to_string(doc)?;
    let sequence = i64::try_from(doc.last_sequence).unwrap_or(i64::MAX);
    conn.execute(
        "INSERT INTO work_units (unit_id, status, archived, last_sequence, body)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(unit_id) DO UPDATE SET
            status = excluded.status,
            archived = excluded.archived,
            last_sequence = excluded.last_sequence,
            body = excluded.body",
        params![
            doc.id.as_str(),
            doc.status.as_str(),
            doc.is_archived(),
            sequence,
            body
        ],
    )
    .map_err(StoreError::sqlite(KIND))?;
    conn.execute(
        "DELETE FROM unit_dependencies WHERE unit_id = ?1",
        [doc.id.as_str()],
    )
    .map_err(StoreError::sqlite(KIND))?;
    for dep in &doc.dependencies {
        conn.execute(
            "INSERT INTO unit_dependencies (unit_id, depends_on) VALUES (?1, ?2)",
            params![doc.id.as_str(), dep.as_str()],
        )
        .map_err(StoreError::sqlite(KIND))?;
    }
    Ok(())
}

fn last_sequence_in(conn: &Connection, id: &WorkUnitId) -> Result<Option<u64>, StoreError> {
    let max: Option<i64> = conn
        .query_row(
            "SELECT MAX(sequence) FROM events WHERE unit_id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )
        .map_err(StoreError::sqlite(KIND))?;
    Ok(max.and_then(|seq| u64::try_from(seq).ok()))
}

impl StorageBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn location(&self) -> &Path {
        &self.root
    }

    fn put_document(&self, doc: &WorkUnit) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(StoreError::sqlite(KIND))?;
        write_document(&tx, doc)?;
        tx.commit().map_err(StoreError::sqlite(KIND))
    }

    fn get_document(&self, id: &WorkUnitId) -> Result<Option<WorkUnit>, StoreError> {
        let body: Option<String> = self
            .conn()
            .query_row(
                "SELECT body FROM work_units WHERE unit_id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::sqlite(KIND))?;
        body.map(|body| self.parse_body(&body)).transpose()
    }

    fn list_ids(&self) -> Result<Vec<WorkUnitId>, StoreError> {
        let raw: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare_cached("SELECT unit_id FROM work_units ORDER BY unit_id")
                .map_err(StoreError::sqlite(KIND))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(StoreError::sqlite(KIND))?;
            rows.collect::<rusqlite::Result<_>>()
                .map_err(StoreError::sqlite(KIND))?
        };
        raw.into_iter()
            .map(|id| WorkUnitId::parse(id).map_err(|err| self.corrupt(err.to_string())))
            .collect()
    }

    fn list_documents(&self) -> Result<Vec<WorkUnit>, StoreError> {
        let bodies: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare_cached("SELECT body FROM work_units ORDER BY unit_id")
                .map_err(StoreError::sqlite(KIND))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(StoreError::sqlite(KIND))?;
            rows.collect::<rusqlite::Result<_>>()
                .map_err(StoreError::sqlite(KIND))?
        };
        bodies.iter().map(|body| self.parse_body(body)).collect()
    }

    fn query_by_status(&self, status: Status) -> Result<Vec<WorkUnit>, StoreError> {
        self.query_documents(
            "SELECT body FROM work_units WHERE status = ?1 ORDER BY unit_id",
            status.as_str(),
        )
    }

    fn query_by_dependency(&self, depends_on: &WorkUnitId) -> Result<Vec<WorkUnit>, StoreError> {
        self.query_documents(
            "SELECT w.body FROM unit_dependencies d
             JOIN work_units w ON w.unit_id = d.unit_id
             WHERE d.depends_on = ?1 AND w.archived = 0
             ORDER BY w.unit_id",
            depends_on.as_str(),
        )
    }

    fn commit(&self, events: &[Event], doc: &WorkUnit) -> Result<(), StoreError> {
        let Some(first) = events.first() else {
            return self.put_document(doc);
        };
        let lines = events
            .iter()
            .map(Event::to_line)
            .collect::<Result<Vec<_>, _>>()?;

        self.stats.timed(&first.writer_id, || {
            let mut conn = self.conn();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StoreError::sqlite(KIND))?;
            check_contiguous(KIND, events, last_sequence_in(&tx, &doc.id)?)?;

            {
                let mut insert = tx
                    .prepare_cached(
                        "INSERT INTO events
                            (unit_id, sequence, kind, writer_id, recorded_at_us, line)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )
                    .map_err(StoreError::sqlite(KIND))?;
                for (event, line) in events.iter().zip(&lines) {
                    insert
                        .execute(params![
                            event.work_unit_id.as_str(),
                            i64::try_from(event.sequence).unwrap_or(i64::MAX),
                            event.kind.as_str(),
                            event.writer_id,
                            event.timestamp.timestamp_micros(),
                            line,
                        ])
                        .map_err(StoreError::sqlite(KIND))?;
                }
            }
            write_document(&tx, doc)?;
            tx.commit().map_err(StoreError::sqlite(KIND))?;

            tracing::debug!(
                work_unit = %doc.id,
                sequence = doc.last_sequence,
                backend = %KIND,
                events = events.len(),
                "commit"
            );
            Ok(())
        })
    }

    fn read_events(
        &self,
        id: &WorkUnitId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let lines: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT line FROM events
                     WHERE unit_id = ?1 AND sequence >= ?2
                     ORDER BY sequence LIMIT ?3",
                )
                .map_err(StoreError::sqlite(KIND))?;
            let rows = stmt
                .query_map(
                    params![
                        id.as_str(),
                        i64::try_from(from).unwrap_or(i64::MAX),
                        i64::try_from(limit).unwrap_or(i64::MAX),
                    ],
                    |row| row.get(0),
                )
                .map_err(StoreError::sqlite(KIND))?;
            rows.collect::<rusqlite::Result<_>>()
                .map_err(StoreError::sqlite(KIND))?
        };
        lines
            .iter()
            .map(|line| Event::from_line(line).map_err(|err| self.corrupt(err.to_string())))
            .collect()
    }

    fn last_sequence(&self, id: &WorkUnitId) -> Result<Option<u64>, StoreError> {
        last_sequence_in(&self.conn(), id)
    }

    fn metrics(&self) -> Result<BackendMetrics, StoreError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM work_units", [], |row| row.get(0))
            .map_err(StoreError::sqlite(KIND))?;
        let mut snapshot = self.stats.snapshot(
            usize::try_from(count).unwrap_or(0),
            self.options.writer_window,
        );
        let mut writers = self.recent_db_writers()?;
        writers.extend(self.stats.recent_writers(self.options.writer_window));
        snapshot.writer_count = writers.len();
        Ok(snapshot)
    }

    fn purge(&self, id: &WorkUnitId) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(StoreError::sqlite(KIND))?;
        tx.execute("DELETE FROM events WHERE unit_id = ?1", [id.as_str()])
            .map_err(StoreError::sqlite(KIND))?;
        let removed = tx
            .execute("DELETE FROM work_units WHERE unit_id = ?1", [id.as_str()])
            .map_err(StoreError::sqlite(KIND))?;
        tx.commit().map_err(StoreError::sqlite(KIND))?;
        Ok(removed > 0)
    }

    fn discard(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(&self.root, err)),
        }
    }

    /// Run `PRAGMA quick_check` and rebuild documents whose watermark
    /// disagrees with their event rows.
    fn repair(&self) -> Result<HealthCheckResult, StoreError> {
        let mut result = HealthCheckResult::default();
        let verdict: String = self
            .conn()
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(StoreError::sqlite(KIND))?;
        if verdict != "ok" {
            result.warnings.push(format!("quick_check: {verdict}"));
        }

        for id in self.list_ids()? {
            let stored = self.get_document(&id)?.map(|d| d.last_sequence);
            if stored == self.last_sequence(&id)? {
                continue;
            }
            let events = self.read_all_events(&id, 0, 1024)?;
            if let Some(doc) = projection::replay(&events)? {
                write_document(&self.conn(), &doc)?;
                tracing::info!(
                    work_unit = %id,
                    sequence = doc.last_sequence,
                    "document rebuilt from events"
                );
            }
            result.needs_rebuild.push(id);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CreatedData, EventPayload, PhaseStartedData};
    use crate::model::PhaseSpec;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn uid(raw: &str) -> WorkUnitId {
        WorkUnitId::parse(raw).unwrap()
    }

    fn event(unit: &str, seq: u64, writer: &str, payload: EventPayload) -> Event {
        Event {
            sequence: seq,
            timestamp: Utc::now(),
            work_unit_id: uid(unit),
            kind: payload.kind(),
            payload,
            writer_id: writer.into(),
        }
    }

    fn created() -> EventPayload {
        EventPayload::Created(CreatedData {
            title: "t".into(),
            phases: vec![PhaseSpec::new("only", 1.0)],
            dependencies: BTreeSet::new(),
        })
    }

    #[test]
    fn commit_rejects_gaps_inside_the_transaction() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path(), BackendOptions::default()).unwrap();
        let doc = backend.append_event(&event("A", 0, "w", created())).unwrap();

        let gap = event(
            "A",
            2,
            "w",
            EventPayload::PhaseStarted(PhaseStartedData {
                phase: "only".into(),
            }),
        );
        let err = backend.commit(&[gap], &doc).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { actual: Some(0), .. }));
        assert_eq!(backend.last_sequence(&uid("A")).unwrap(), Some(0));
    }

    #[test]
    fn writer_count_spans_processes_sharing_the_file() {
        let dir = TempDir::new().unwrap();
        let first = SqliteBackend::open(dir.path(), BackendOptions::default()).unwrap();
        let second = SqliteBackend::open(dir.path(), BackendOptions::default()).unwrap();
        first.append_event(&event("A", 0, "alpha", created())).unwrap();
        second.append_event(&event("B", 0, "beta", created())).unwrap();

        let metrics = first.metrics().unwrap();
        assert_eq!(metrics.document_count, 2);
        assert_eq!(metrics.writer_count, 2);
    }

    #[test]
    fn purge_removes_events_and_edges() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path(), BackendOptions::default()).unwrap();
        backend.append_event(&event("A", 0, "w", created())).unwrap();
        assert!(backend.purge(&uid("A")).unwrap());
        assert!(!backend.purge(&uid("A")).unwrap());
        assert_eq!(backend.last_sequence(&uid("A")).unwrap(), None);
        assert!(backend.get_document(&uid("A")).unwrap().is_none());
    }
}
