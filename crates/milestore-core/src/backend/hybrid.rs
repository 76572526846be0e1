//! Indexed-hybrid backend: the flat-file layout plus an SQLite index.
//!
//! Documents and logs stay in `units/` exactly as the flat-file backend
//! writes them, so the hybrid tier remains interchangeable with it. The
//! index (`index.sqlite3`) answers status and dependency queries and the
//! id listing without scanning directories.
//!
//! The index is derived data. If updating it fails after the files have
//! committed, the backend marks it stale (`index.stale`) and answers
//! queries by scanning until the next open rebuilds it.

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::flat::FlatFileBackend;
use super::schema::{INDEX_MIGRATIONS, open_database};
use super::{BackendKind, BackendOptions, StorageBackend};
use crate::error::{IoContext, StoreError};
use crate::event::Event;
use crate::metrics::BackendMetrics;
use crate::model::{Status, WorkUnit, WorkUnitId};
use crate::recovery::HealthCheckResult;

const INDEX_FILE: &str = "index.sqlite3";
const STALE_MARKER: &str = "index.stale";

#[derive(Debug)]
pub struct HybridBackend {
    files: FlatFileBackend,
    index: Mutex<Connection>,
    stale: AtomicBool,
    marker: PathBuf,
}

impl HybridBackend {
    /// Open the files and the index, rebuilding the index when it is marked
    /// stale or its row count disagrees with the unit directories.
    ///
    /// # Errors
    ///
    /// I/O or SQLite failures.
    pub fn open(root: &Path, options: BackendOptions) -> Result<Self, StoreError> {
        let files = FlatFileBackend::open(root, options)?;
        let conn = open_database(
            &root.join(INDEX_FILE),
            BackendKind::IndexedHybrid,
            INDEX_MIGRATIONS,
            options.durable,
        )?;
        let marker = root.join(STALE_MARKER);
        let backend = Self {
            files,
            index: Mutex::new(conn),
            stale: AtomicBool::new(marker.exists()),
            marker,
        };

        let indexed = backend.indexed_count()?;
        let on_disk = backend.files.list_ids()?.len();
        if backend.is_stale() || indexed != on_disk {
            tracing::info!(indexed, on_disk, "rebuilding hybrid index");
            backend.rebuild_index()?;
        }
        Ok(backend)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    fn mark_stale(&self, err: &StoreError) {
        tracing::warn!(error = %err, "hybrid index update failed, falling back to scans");
        self.stale.store(true, Ordering::Release);
        if let Err(err) = fs::write(&self.marker, b"") {
            tracing::error!(
                path = %self.marker.display(),
                error = %err,
                "cannot write stale marker"
            );
        }
    }

    fn indexed_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM unit_index", [], |row| row.get(0))
            .map_err(StoreError::sqlite(BackendKind::IndexedHybrid))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Drop and repopulate every index row from the stored documents.
    ///
    /// # Errors
    ///
    /// Document read or SQLite failures. The stale marker is kept on error.
    pub fn rebuild_index(&self) -> Result<(), StoreError> {
        let docs = self.files.list_documents()?;
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(StoreError::sqlite(BackendKind::IndexedHybrid))?;
        tx.execute("DELETE FROM unit_index", [])
            .map_err(StoreError::sqlite(BackendKind::IndexedHybrid))?;
        for doc in &docs {
            upsert_row(&tx, doc).map_err(StoreError::sqlite(BackendKind::IndexedHybrid))?;
        }
        tx.commit()
            .map_err(StoreError::sqlite(BackendKind::IndexedHybrid))?;
        drop(conn);

        self.stale.store(false, Ordering::Release);
        match fs::remove_file(&self.marker) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::io(&self.marker, err)),
        }
        tracing::info!(units = docs.len(), "hybrid index rebuilt");
        Ok(())
    }

    fn index_document(&self, doc: &WorkUnit) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(StoreError::sqlite(BackendKind::IndexedHybrid))?;
        upsert_row(&tx, doc).map_err(StoreError::sqlite(BackendKind::IndexedHybrid))?;
        tx.commit()
            .map_err(StoreError::sqlite(BackendKind::IndexedHybrid))
    }

    fn indexed_ids(&self, sql: &str, param: Option<&str>) -> Result<Vec<WorkUnitId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(StoreError::sqlite(BackendKind::IndexedHybrid))?;
        let rows = stmt
            .query_map(params_from_iter(param), |row| row.get::<_, String>(0))
            .map_err(StoreError::sqlite(BackendKind::IndexedHybrid))?;

        let mut ids = Vec::new();
        for raw in rows {
            let raw = raw.map_err(StoreError::sqlite(BackendKind::IndexedHybrid))?;
            let id = WorkUnitId::parse(raw).map_err(|err| StoreError::Corrupt {
                path: self.files.location().join(INDEX_FILE),
                reason: err.to_string(),
            })?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Load indexed hits, re-checking each against its document in case
    /// the index lags a writer in another process.
    fn load(
        &self,
        ids: Vec<WorkUnitId>,
        keep: impl Fn(&WorkUnit) -> bool,
    ) -> Result<Vec<WorkUnit>, StoreError> {
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.files.get_document(&id)? {
                Some(doc) if keep(&doc) => docs.push(doc),
                _ => {}
            }
        }
        Ok(docs)
    }
}

/// Insert or refresh a unit's row and edges. Rows never move backwards in
/// sequence, so a late writer cannot clobber a newer one.
fn upsert_row(conn: &Connection, doc: &WorkUnit) -> rusqlite::Result<()> {
    let current: Option<i64> = conn
        .query_row(
            "SELECT last_sequence FROM unit_index WHERE unit_id = ?1",
            [doc.id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let sequence = i64::try_from(doc.last_sequence).unwrap_or(i64::MAX);
    if current.is_some_and(|seq| seq > sequence) {
        return Ok(());
    }

    conn.execute(
        "INSERT INTO unit_index
            (unit_id, status, archived, last_sequence, progress_percent, updated_at_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(unit_id) DO UPDATE SET
            status = excluded.status,
            archived = excluded.archived,
            last_sequence = excluded.last_sequence,
            progress_percent = excluded.progress_percent,
            updated_at_us = excluded.updated_at_us",
        params![
            doc.id.as_str(),
            doc.status.as_str(),
            doc.is_archived(),
            sequence,
            doc.progress_percent,
            doc.updated_at.timestamp_micros(),
        ],
    )?;
    conn.execute(
        "DELETE FROM unit_dependencies WHERE unit_id = ?1",
        [doc.id.as_str()],
    )?;
    for dep in &doc.dependencies {
        conn.execute(
            "INSERT INTO unit_dependencies (unit_id, depends_on) VALUES (?1, ?2)",
            params![doc.id.as_str(), dep.as_str()],
        )?;
    }
    Ok(())
}

impl StorageBackend for HybridBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::IndexedHybrid
    }

    fn location(&self) -> &Path {
        self.files.location()
    }

    fn put_document(&self, doc: &WorkUnit) -> Result<(), StoreError> {
        self.files.put_document(doc)?;
        if let Err(err) = self.index_document(doc) {
            self.mark_stale(&err);
        }
        Ok(())
    }

    fn get_document(&self, id: &WorkUnitId) -> Result<Option<WorkUnit>, StoreError> {
        self.files.get_document(id)
    }

    fn list_ids(&self) -> Result<Vec<WorkUnitId>, StoreError> {
        if self.is_stale() {
            return self.files.list_ids();
        }
        self.indexed_ids("SELECT unit_id FROM unit_index ORDER BY unit_id", None)
    }

    fn query_by_status(&self, status: Status) -> Result<Vec<WorkUnit>, StoreError> {
        if self.is_stale() {
            return self.files.query_by_status(status);
        }
        let ids = self.indexed_ids(
            "SELECT unit_id FROM unit_index WHERE status = ?1 ORDER BY unit_id",
            Some(status.as_str()),
        )?;
        self.load(ids, |doc| doc.status == status)
    }

    fn query_by_dependency(&self, depends_on: &WorkUnitId) -> Result<Vec<WorkUnit>, StoreError> {
        if self.is_stale() {
            return self.files.query_by_dependency(depends_on);
        }
        let ids = self.indexed_ids(
            "SELECT d.unit_id FROM unit_dependencies d
             JOIN unit_index u ON u.unit_id = d.unit_id
             WHERE d.depends_on = ?1 AND u.archived = 0
             ORDER BY d.unit_id",
            Some(depends_on.as_str()),
        )?;
        self.load(ids, |doc| {
            !doc.is_archived() && doc.dependencies.contains(depends_on)
        })
    }

    fn commit(&self, events: &[Event], doc: &WorkUnit) -> Result<(), StoreError> {
        self.files.commit(events, doc)?;
        if let Err(err) = self.index_document(doc) {
            self.mark_stale(&err);
        }
        Ok(())
    }

    fn read_events(
        &self,
        id: &WorkUnitId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        self.files.read_events(id, from, limit)
    }

    fn last_sequence(&self, id: &WorkUnitId) -> Result<Option<u64>, StoreError> {
        self.files.last_sequence(id)
    }

    fn metrics(&self) -> Result<BackendMetrics, StoreError> {
        let count = if self.is_stale() {
            self.files.list_ids()?.len()
        } else {
            self.indexed_count()?
        };
        Ok(self
            .files
            .stats()
            .snapshot(count, self.files.options().writer_window))
    }

    fn purge(&self, id: &WorkUnitId) -> Result<bool, StoreError> {
        let existed = self.files.purge(id)?;
        self.conn()
            .execute("DELETE FROM unit_index WHERE unit_id = ?1", [id.as_str()])
            .map_err(StoreError::sqlite(BackendKind::IndexedHybrid))?;
        Ok(existed)
    }

    fn discard(&self) -> Result<(), StoreError> {
        self.files.discard()?;
        // The open connection may recreate WAL side files; remove them too.
        for suffix in ["-wal", "-shm"] {
            let path = self.files.location().join(format!("{INDEX_FILE}{suffix}"));
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).at(&path),
            }
        }
        Ok(())
    }

    fn repair(&self) -> Result<HealthCheckResult, StoreError> {
        let result = self.files.repair_files()?;
        self.rebuild_index()?;
        Ok(result)
    }
}
