//! Flat-file backend.
//!
//! # Layout
//!
//! ```text
//! <root>/units/<id>/document.json   projected document, pretty JSON
//! <root>/units/<id>/events.jsonl    header line, then one event per line
//! <root>/units/<id>/events.lock     fs2 lock held across a commit
//! ```
//!
//! # Commit protocol
//!
//! 0. Take the unit's `events.lock` for the rest of the protocol.
//! 1. Truncate a torn trailing line left by a crashed writer.
//! 2. Check the batch continues the log's last sequence.
//! 3. Write the new document to a uniquely named temp file.
//! 4. Append every event line in one `write_all` on an `O_APPEND` handle.
//!    On failure the log is truncated back to its previous length and the
//!    temp file removed.
//! 5. Rename the temp file over `document.json`.
//!
//! The log is authoritative. If step 5 fails the events are already
//! durable; the stale document is detected on read (its `last_sequence`
//! trails the log) and rebuilt by replay.

use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{BackendKind, BackendOptions, StorageBackend, check_contiguous};
use crate::error::{IoContext, StoreError};
use crate::event::Event;
use crate::lock::StoreLock;
use crate::metrics::{BackendMetrics, WriteStats};
use crate::model::{Status, WorkUnit, WorkUnitId};
use crate::projection;
use crate::recovery::{self, DOCUMENT_TMP_PREFIX, HealthCheckResult, LOG_HEADER};

const DOCUMENT_FILE: &str = "document.json";
const LOG_FILE: &str = "events.jsonl";
const COMMIT_LOCK_FILE: &str = "events.lock";

/// How long a commit waits for another process appending to the same log.
const COMMIT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Smallest tail window read when looking for the last event line.
const TAIL_WINDOW: u64 = 4096;

/// Directory-per-unit storage.
#[derive(Debug)]
pub struct FlatFileBackend {
    root: PathBuf,
    units_dir: PathBuf,
    options: BackendOptions,
    stats: WriteStats,
}

impl FlatFileBackend {
    /// Open the layout rooted at `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directories cannot be created.
    pub fn open(root: &Path, options: BackendOptions) -> Result<Self, StoreError> {
        let units_dir = root.join("units");
        fs::create_dir_all(&units_dir).at(&units_dir)?;
        Ok(Self {
            root: root.to_path_buf(),
            units_dir,
            stats: WriteStats::with_writer_window(options.writer_window),
            options,
        })
    }

    #[must_use]
    pub fn units_dir(&self) -> &Path {
        &self.units_dir
    }

    pub(crate) const fn stats(&self) -> &WriteStats {
        &self.stats
    }

    pub(crate) const fn options(&self) -> BackendOptions {
        self.options
    }

    fn unit_dir(&self, id: &WorkUnitId) -> PathBuf {
        self.units_dir.join(id.as_str())
    }

    fn document_path(&self, id: &WorkUnitId) -> PathBuf {
        self.unit_dir(id).join(DOCUMENT_FILE)
    }

    fn commit_lock_path(&self, id: &WorkUnitId) -> PathBuf {
        self.unit_dir(id).join(COMMIT_LOCK_FILE)
    }

    fn log_path(&self, id: &WorkUnitId) -> PathBuf {
        self.unit_dir(id).join(LOG_FILE)
    }

    /// The stored document as written, without checking it against the log.
    ///
    /// # Errors
    ///
    /// I/O failures or an unreadable document.
    pub fn read_stored_document(&self, id: &WorkUnitId) -> Result<Option<WorkUnit>, StoreError> {
        let path = self.document_path(id);
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|err| StoreError::Corrupt {
                    path,
                    reason: err.to_string(),
                }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(path, err)),
        }
    }

    fn write_document(&self, doc: &WorkUnit) -> Result<(), StoreError> {
        let tmp = self.stage_document(doc)?;
        let path = self.document_path(&doc.id);
        fs::rename(&tmp, &path).at(&path)
    }

    /// Write `doc` to a fresh temp file in its unit directory and return
    /// the temp path.
    fn stage_document(&self, doc: &WorkUnit) -> Result<PathBuf, StoreError> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let dir = self.unit_dir(&doc.id);
        fs::create_dir_all(&dir).at(&dir)?;
        let tmp = dir.join(format!(
            "{DOCUMENT_TMP_PREFIX}.{}.{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let json = serde_json::to_vec_pretty(doc)?;
        let mut file = File::create(&tmp).at(&tmp)?;
        file.write_all(&json).at(&tmp)?;
        if self.options.durable {
            file.sync_all().at(&tmp)?;
        }
        Ok(tmp)
    }

    /// Append `events` as one write. Restores the previous length on error.
    fn append_lines(&self, path: &Path, events: &[Event]) -> Result<(), StoreError> {
        let mut buf = String::new();
        for event in events {
            buf.push_str(&event.to_line()?);
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .at(path)?;
        let prev_len = file.metadata().at(path)?.len();
        if prev_len == 0 {
            buf.insert_str(0, &format!("{LOG_HEADER}\n"));
        }

        let written = file
            .write_all(buf.as_bytes())
            .and_then(|()| file.flush())
            .and_then(|()| {
                if self.options.durable {
                    file.sync_data()
                } else {
                    Ok(())
                }
            });
        if let Err(err) = written {
            if let Err(truncate_err) = file.set_len(prev_len) {
                tracing::error!(
                    path = %path.display(),
                    error = %truncate_err,
                    "failed to roll back partial append"
                );
            }
            return Err(StoreError::io(path, err));
        }
        Ok(())
    }

    fn log_events(&self, id: &WorkUnitId) -> Result<Vec<Event>, StoreError> {
        let path = self.log_path(id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(path, err)),
        };
        parse_complete_lines(&path, &text, 0, usize::MAX)
    }

    /// Rebuild `id`'s document from its log and store it.
    ///
    /// # Errors
    ///
    /// Read, projection or write failures.
    pub fn rebuild_document(&self, id: &WorkUnitId) -> Result<Option<WorkUnit>, StoreError> {
        let events = self.log_events(id)?;
        let doc = projection::replay(&events)?;
        if let Some(doc) = &doc {
            self.write_document(doc)?;
            tracing::info!(
                work_unit = %id,
                sequence = doc.last_sequence,
                "document rebuilt from log"
            );
        }
        Ok(doc)
    }

    /// Repair torn appends and rebuild every document that disagrees with
    /// its log. Callers must ensure no writer is active.
    ///
    /// # Errors
    ///
    /// I/O failures while scanning or rewriting.
    pub fn repair_files(&self) -> Result<HealthCheckResult, StoreError> {
        let mut result = recovery::auto_recover(&self.units_dir)?;
        for id in self.list_ids()? {
            let stale = match (self.read_stored_document(&id), self.last_sequence(&id)?) {
                (Ok(Some(doc)), Some(last)) => doc.last_sequence != last,
                (Ok(None) | Err(_), Some(_)) => true,
                (_, None) => false,
            };
            if stale && !result.needs_rebuild.contains(&id) {
                result.needs_rebuild.push(id);
            }
        }
        result.needs_rebuild.sort();
        for id in &result.needs_rebuild {
            if let Err(err) = self.rebuild_document(id) {
                result.warnings.push(format!("rebuild of {id} failed: {err}"));
            }
        }
        Ok(result)
    }
}

impl StorageBackend for FlatFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::FlatFile
    }

    fn location(&self) -> &Path {
        &self.root
    }

    fn put_document(&self, doc: &WorkUnit) -> Result<(), StoreError> {
        self.write_document(doc)
    }

    fn get_document(&self, id: &WorkUnitId) -> Result<Option<WorkUnit>, StoreError> {
        let last = self.last_sequence(id)?;
        let stored = self.read_stored_document(id);
        match (stored, last) {
            (Ok(Some(doc)), Some(last)) if doc.last_sequence == last => Ok(Some(doc)),
            (_, None) => Ok(None),
            (stored, Some(_)) => {
                // Readers hold no lease: answer from the log, leave the
                // rewrite to the next writer.
                if let Err(err) = stored {
                    tracing::warn!(
                        work_unit = %id,
                        error = %err,
                        "unreadable document, replaying log"
                    );
                }
                projection::replay(&self.log_events(id)?)
            }
        }
    }

    fn list_ids(&self) -> Result<Vec<WorkUnitId>, StoreError> {
        let entries = match fs::read_dir(&self.units_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&self.units_dir, err)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.at(&self.units_dir)?;
            let Ok(id) = WorkUnitId::parse(entry.file_name().to_string_lossy().into_owned())
            else {
                continue;
            };
            if self.last_sequence(&id)?.is_some() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn query_by_status(&self, status: Status) -> Result<Vec<WorkUnit>, StoreError> {
        Ok(self
            .list_documents()?
            .into_iter()
            .filter(|doc| doc.status == status)
            .collect())
    }

    fn query_by_dependency(&self, depends_on: &WorkUnitId) -> Result<Vec<WorkUnit>, StoreError> {
        Ok(self
            .list_documents()?
            .into_iter()
            .filter(|doc| !doc.is_archived() && doc.dependencies.contains(depends_on))
            .collect())
    }

    fn commit(&self, events: &[Event], doc: &WorkUnit) -> Result<(), StoreError> {
        let Some(first) = events.first() else {
            return self.write_document(doc);
        };
        let writer = first.writer_id.clone();
        self.stats.timed(&writer, || {
            let dir = self.unit_dir(&doc.id);
            fs::create_dir_all(&dir).at(&dir)?;
            // Serializes the contiguity check with the append, so a writer
            // whose lease lapsed mid-commit cannot interleave with the next.
            let _guard = StoreLock::acquire(&self.commit_lock_path(&doc.id), COMMIT_LOCK_TIMEOUT)?;
            let log = self.log_path(&doc.id);
            recovery::recover_partial_write(&log)?;
            check_contiguous(self.kind(), events, last_event_sequence(&log)?)?;

            let tmp = self.stage_document(doc)?;
            if let Err(err) = self.append_lines(&log, events) {
                let _ = fs::remove_file(&tmp);
                return Err(err);
            }

            let path = self.document_path(&doc.id);
            if let Err(err) = fs::rename(&tmp, &path) {
                tracing::error!(
                    work_unit = %doc.id,
                    sequence = doc.last_sequence,
                    error = %err,
                    "events committed but document replace failed; it will be rebuilt from the log"
                );
            }
            tracing::debug!(
                work_unit = %doc.id,
                sequence = doc.last_sequence,
                backend = %self.kind(),
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
        let path = self.log_path(id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(path, err)),
        };
        parse_complete_lines(&path, &text, from, limit)
    }

    fn last_sequence(&self, id: &WorkUnitId) -> Result<Option<u64>, StoreError> {
        last_event_sequence(&self.log_path(id))
    }

    fn metrics(&self) -> Result<BackendMetrics, StoreError> {
        Ok(self
            .stats
            .snapshot(self.list_ids()?.len(), self.options.writer_window))
    }

    fn purge(&self, id: &WorkUnitId) -> Result<bool, StoreError> {
        let dir = self.unit_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::io(dir, err)),
        }
    }

    fn discard(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(&self.root, err)),
        }
    }

    fn repair(&self) -> Result<HealthCheckResult, StoreError> {
        self.repair_files()
    }
}

#[derive(Deserialize)]
struct SequenceOnly {
    sequence: u64,
}

/// Parse the complete (newline-terminated) event lines of a log, keeping
/// sequences in `from..` up to `limit` events.
fn parse_complete_lines(
    path: &Path,
    text: &str,
    from: u64,
    limit: usize,
) -> Result<Vec<Event>, StoreError> {
    let complete = text.rfind('\n').map_or("", |pos| &text[..=pos]);
    let mut out = Vec::new();
    for line in complete.lines() {
        if out.len() >= limit {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let seq: SequenceOnly = serde_json::from_str(trimmed).map_err(|err| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        if seq.sequence < from {
            continue;
        }
        let event = Event::from_line(trimmed).map_err(|err| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("event #{}: {err}", seq.sequence),
        })?;
        out.push(event);
    }
    Ok(out)
}

/// Sequence of the last complete event line, reading only the file's tail.
fn last_event_sequence(path: &Path) -> Result<Option<u64>, StoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    let len = file.metadata().at(path)?.len();
    let mut window = TAIL_WINDOW;

    loop {
        let start = len.saturating_sub(window);
        file.seek(SeekFrom::Start(start)).at(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).at(path)?;

        let Some(last_nl) = buf.iter().rposition(|&b| b == b'\n') else {
            if start == 0 {
                return Ok(None);
            }
            window = window.saturating_mul(4);
            continue;
        };
        // A window that starts mid-file begins with a partial line.
        let begin = if start == 0 {
            0
        } else {
            buf.iter().position(|&b| b == b'\n').map_or(buf.len(), |p| p + 1)
        };
        let region = if begin <= last_nl { &buf[begin..=last_nl] } else { &[][..] };
        let text = String::from_utf8_lossy(region);

        for line in text.lines().rev() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let seq: SequenceOnly =
                serde_json::from_str(trimmed).map_err(|err| StoreError::Corrupt {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })?;
            return Ok(Some(seq.sequence));
        }

        if start == 0 {
            return Ok(None);
        }
        window = window.saturating_mul(4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CreatedData, EventPayload, PhaseStartedData};
    use crate::model::PhaseSpec;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn id() -> WorkUnitId {
        WorkUnitId::parse("M1").unwrap()
    }

    fn event(seq: u64, payload: EventPayload) -> Event {
        Event {
            sequence: seq,
            timestamp: Utc::now(),
            work_unit_id: id(),
            kind: payload.kind(),
            payload,
            writer_id: "w".into(),
        }
    }

    fn created(title: &str) -> EventPayload {
        EventPayload::Created(CreatedData {
            title: title.into(),
            phases: vec![PhaseSpec::new("design", 0.3), PhaseSpec::new("execute", 0.7)],
            dependencies: BTreeSet::new(),
        })
    }

    fn started(phase: &str) -> EventPayload {
        EventPayload::PhaseStarted(PhaseStartedData {
            phase: phase.into(),
        })
    }

    fn backend() -> (TempDir, FlatFileBackend) {
        let dir = TempDir::new().unwrap();
        let backend = FlatFileBackend::open(dir.path(), BackendOptions::default()).unwrap();
        (dir, backend)
    }

    #[test]
    fn log_starts_with_header() {
        let (_dir, backend) = backend();
        backend.append_event(&event(0, created("t"))).unwrap();
        let text = fs::read_to_string(backend.log_path(&id())).unwrap();
        assert_eq!(text.lines().next(), Some(LOG_HEADER));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn last_sequence_reads_tail_past_window() {
        let (_dir, backend) = backend();
        // A title longer than the tail window forces the window to grow.
        backend
            .append_event(&event(0, created(&"x".repeat(10_000))))
            .unwrap();
        assert_eq!(backend.last_sequence(&id()).unwrap(), Some(0));
        backend.append_event(&event(1, started("design"))).unwrap();
        assert_eq!(backend.last_sequence(&id()).unwrap(), Some(1));
    }

    #[test]
    fn stale_document_is_answered_from_log() {
        let (_dir, backend) = backend();
        let doc0 = backend.append_event(&event(0, created("t"))).unwrap();
        backend.append_event(&event(1, started("design"))).unwrap();
        // Simulate a lost rename: the stored document trails the log.
        backend.put_document(&doc0).unwrap();

        let doc = backend.get_document(&id()).unwrap().unwrap();
        assert_eq!(doc.last_sequence, 1);
        assert_eq!(doc.status, Status::Active);

        let report = backend.repair().unwrap();
        assert_eq!(report.needs_rebuild, vec![id()]);
        assert_eq!(
            backend.read_stored_document(&id()).unwrap().unwrap().last_sequence,
            1
        );
    }

    #[test]
    fn torn_tail_is_ignored_by_readers_and_truncated_by_writers() {
        let (_dir, backend) = backend();
        backend.append_event(&event(0, created("t"))).unwrap();
        let log = backend.log_path(&id());
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(b"{\"sequence\":1,\"times").unwrap();

        assert_eq!(backend.last_sequence(&id()).unwrap(), Some(0));
        assert_eq!(backend.read_events(&id(), 0, 10).unwrap().len(), 1);

        backend.append_event(&event(1, started("design"))).unwrap();
        let events = backend.read_events(&id(), 0, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].sequence, 1);
    }

    #[test]
    fn commit_waits_for_the_log_lock() {
        let (_dir, backend) = backend();
        backend.append_event(&event(0, created("t"))).unwrap();
        let held = StoreLock::acquire(&backend.commit_lock_path(&id()), Duration::ZERO).unwrap();

        std::thread::scope(|scope| {
            let writer = scope.spawn(|| backend.append_event(&event(1, started("design"))));
            std::thread::sleep(Duration::from_millis(150));
            assert_eq!(backend.last_sequence(&id()).unwrap(), Some(0));
            drop(held);
            writer.join().unwrap().unwrap();
        });
        assert_eq!(backend.last_sequence(&id()).unwrap(), Some(1));

        // A writer that computed the same sequence is refused under the lock.
        let doc = backend.get_document(&id()).unwrap().unwrap();
        let racing = event(1, started("design"));
        let err = backend.commit(std::slice::from_ref(&racing), &doc).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn leftover_temp_file_does_not_hide_units() {
        let (_dir, backend) = backend();
        backend.append_event(&event(0, created("t"))).unwrap();
        fs::write(
            backend.unit_dir(&id()).join(format!("{DOCUMENT_TMP_PREFIX}.1.1")),
            "{",
        )
        .unwrap();
        assert_eq!(backend.list_ids().unwrap(), vec![id()]);
        let report = backend.repair().unwrap();
        assert_eq!(report.needs_rebuild, vec![id()]);
    }
}
