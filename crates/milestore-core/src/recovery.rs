//! Recovery of flat-file storage after crashes.
//!
//! Restores a unit directory to a consistent state after:
//! - a torn append (process died mid-line in `events.jsonl`)
//! - corrupt log lines (bit flips, manual edits)
//! - an interrupted document replace (leftover temp file)
//! - a busy SQLite file at open time
//!
//! # Recovery Philosophy
//!
//! - **Deterministic**: same input, same action.
//! - **No silent data loss**: corrupt lines are quarantined to a `.corrupt`
//!   file next to the log, never just dropped.
//! - **The log wins**: a document that disagrees with its log is rebuilt by
//!   replay, never the other way around.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{IoContext, StoreError};
use crate::event::Event;
use crate::model::WorkUnitId;

/// First line of every flat-file event log.
pub const LOG_HEADER: &str = "# milestore events v1";

/// Prefix of temporary files written during a document replace.
pub const DOCUMENT_TMP_PREFIX: &str = "document.json.tmp";

/// Report from scanning one event log for corrupt lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub log_path: PathBuf,
    /// Valid events kept.
    pub events_preserved: usize,
    /// Lines moved to the quarantine file.
    pub events_discarded: usize,
    /// Byte offset of the first bad line.
    pub corruption_offset: Option<u64>,
    pub action_taken: RecoveryAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Corrupt tail moved to `backup_path` and the log truncated.
    Quarantined { backup_path: PathBuf },
    NoActionNeeded,
}

/// Truncate an incomplete trailing line left by a crashed append.
///
/// Only the final byte is inspected on the fast path, so this is cheap to
/// call before every append.
///
/// # Returns
///
/// The number of bytes removed (0 when the file was already clean or
/// does not exist).
///
/// # Errors
///
/// Returns [`StoreError::Io`] if the file cannot be read or truncated.
pub fn recover_partial_write(path: &Path) -> Result<u64, StoreError> {
    let mut file = match fs::OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    let len = file.metadata().at(path)?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1)).at(path)?;
    file.read_exact(&mut last).at(path)?;
    if last[0] == b'\n' {
        return Ok(0);
    }

    let mut content = Vec::new();
    file.seek(SeekFrom::Start(0)).at(path)?;
    file.read_to_end(&mut content).at(path)?;
    let truncate_to = content
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);
    let bytes_removed = len - truncate_to as u64;
    file.set_len(truncate_to as u64).at(path)?;

    tracing::warn!(
        path = %path.display(),
        bytes_removed,
        "torn write repaired: truncated incomplete trailing line"
    );
    Ok(bytes_removed)
}

/// Quarantine everything from the first unparsable line onward.
///
/// Comment and blank lines are always valid. An event line must decode as
/// an [`Event`] and continue the sequence of the lines before it.
///
/// # Errors
///
/// Returns [`StoreError::Io`] on read or write failure.
pub fn recover_corrupt_log(path: &Path) -> Result<RecoveryReport, StoreError> {
    let content = fs::read_to_string(path).at(path)?;
    let lines: Vec<&str> = content.lines().collect();

    let mut events_preserved = 0usize;
    let mut next_sequence = 0u64;
    let mut first_bad_line = None;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match Event::from_line(line) {
            Ok(event) if event.sequence == next_sequence => {
                events_preserved += 1;
                next_sequence += 1;
            }
            _ => {
                first_bad_line = Some(i);
                break;
            }
        }
    }

    let Some(bad_idx) = first_bad_line else {
        return Ok(RecoveryReport {
            log_path: path.to_path_buf(),
            events_preserved,
            events_discarded: 0,
            corruption_offset: None,
            action_taken: RecoveryAction::NoActionNeeded,
        });
    };

    let events_discarded = lines[bad_idx..]
        .iter()
        .filter(|l| {
            let t = l.trim();
            !t.is_empty() && !t.starts_with('#')
        })
        .count();
    let corruption_offset: u64 = lines[..bad_idx].iter().map(|l| l.len() as u64 + 1).sum();

    let backup_path = path.with_extension("corrupt");
    let corrupt: String = lines[bad_idx..].iter().map(|l| format!("{l}\n")).collect();
    fs::write(&backup_path, corrupt).at(&backup_path)?;
    let valid: String = lines[..bad_idx].iter().map(|l| format!("{l}\n")).collect();
    fs::write(path, valid).at(path)?;

    tracing::warn!(
        path = %path.display(),
        events_preserved,
        events_discarded,
        corruption_offset,
        backup = %backup_path.display(),
        "corrupt event log recovered: quarantined bad lines"
    );

    Ok(RecoveryReport {
        log_path: path.to_path_buf(),
        events_preserved,
        events_discarded,
        corruption_offset: Some(corruption_offset),
        action_taken: RecoveryAction::Quarantined { backup_path },
    })
}

/// Remove leftover document temp files in a unit directory.
///
/// Returns whether any were found, meaning the document may be stale and
/// must be rebuilt from the log.
///
/// # Errors
///
/// Returns [`StoreError::Io`] if the directory cannot be listed.
pub fn clear_document_temps(unit_dir: &Path) -> Result<bool, StoreError> {
    let mut found = false;
    let entries = match fs::read_dir(unit_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(StoreError::io(unit_dir, err)),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(DOCUMENT_TMP_PREFIX) {
            found = true;
            let path = entry.path();
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "cannot remove document temp file"
                );
            }
        }
    }
    Ok(found)
}

/// Result of a whole-store health check.
#[derive(Debug, Clone, Default)]
pub struct HealthCheckResult {
    /// Logs whose torn tail was truncated, with bytes removed.
    pub torn_write_repairs: Vec<(PathBuf, u64)>,
    /// Units whose document must be rebuilt by replay.
    pub needs_rebuild: Vec<WorkUnitId>,
    /// Non-fatal problems encountered.
    pub warnings: Vec<String>,
}

/// Scan every unit directory under `units_dir`, repairing torn appends and
/// collecting units whose document needs a rebuild.
///
/// # Errors
///
/// Returns [`StoreError::Io`] if `units_dir` exists but cannot be listed.
pub fn auto_recover(units_dir: &Path) -> Result<HealthCheckResult, StoreError> {
    let mut result = HealthCheckResult::default();
    let entries = match fs::read_dir(units_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(result),
        Err(err) => return Err(StoreError::io(units_dir, err)),
    };

    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Ok(id) = WorkUnitId::parse(entry.file_name().to_string_lossy().into_owned()) else {
            result
                .warnings
                .push(format!("ignoring foreign directory {}", dir.display()));
            continue;
        };

        let log = dir.join("events.jsonl");
        match recover_partial_write(&log) {
            Ok(0) => {}
            Ok(bytes) => {
                result.torn_write_repairs.push((log.clone(), bytes));
                result.needs_rebuild.push(id.clone());
            }
            Err(err) => result.warnings.push(format!("torn-write check failed: {err}")),
        }

        if log.exists() {
            match recover_corrupt_log(&log) {
                Ok(RecoveryReport {
                    action_taken: RecoveryAction::Quarantined { backup_path },
                    events_discarded,
                    ..
                }) => {
                    result.warnings.push(format!(
                        "{id}: {events_discarded} corrupt events moved to {}",
                        backup_path.display()
                    ));
                    if !result.needs_rebuild.contains(&id) {
                        result.needs_rebuild.push(id.clone());
                    }
                }
                Ok(_) => {}
                Err(err) => result.warnings.push(format!("corruption scan failed: {err}")),
            }
        }

        match clear_document_temps(&dir) {
            Ok(true) if !result.needs_rebuild.contains(&id) => result.needs_rebuild.push(id),
            Ok(_) => {}
            Err(err) => result.warnings.push(format!("temp cleanup failed: {err}")),
        }
    }

    result.needs_rebuild.sort();
    tracing::info!(
        torn_writes = result.torn_write_repairs.len(),
        rebuilds = result.needs_rebuild.len(),
        warnings = result.warnings.len(),
        "flat-file recovery scan complete"
    );
    Ok(result)
}

/// Open an SQLite file, retrying with backoff while it is locked by
/// another process.
///
/// # Errors
///
/// Returns the last error once `timeout` elapses, or any non-lock error
/// immediately.
pub fn open_db_with_retry<T>(
    path: &Path,
    timeout: Duration,
    mut open: impl FnMut(&Path) -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let start = Instant::now();
    let mut delay = Duration::from_millis(50);
    let max_delay = Duration::from_secs(2);

    loop {
        match open(path) {
            Ok(value) => return Ok(value),
            Err(err) if is_locked_error(&err) && start.elapsed() < timeout => {
                tracing::debug!(
                    path = %path.display(),
                    elapsed_ms = start.elapsed().as_millis(),
                    "database locked, retrying"
                );
            }
            Err(err) => return Err(err),
        }
        std::thread::sleep(delay);
        delay = (delay * 2).min(max_delay);
    }
}

fn is_locked_error(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => matches!(
            err.code,
            rusqlite::ffi::ErrorCode::DatabaseBusy | rusqlite::ffi::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CreatedData, EventPayload};
    use crate::model::PhaseSpec;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn created_line(seq: u64) -> String {
        let event = Event {
            sequence: seq,
            timestamp: Utc::now(),
            work_unit_id: WorkUnitId::parse("M1").unwrap(),
            kind: crate::event::EventKind::Created,
            payload: EventPayload::Created(CreatedData {
                title: "t".into(),
                phases: vec![PhaseSpec::new("only", 1.0)],
                dependencies: BTreeSet::new(),
            }),
            writer_id: "w".into(),
        };
        event.to_line().unwrap()
    }

    #[test]
    fn partial_write_clean_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        fs::write(&path, format!("{LOG_HEADER}\n{}\n", created_line(0))).unwrap();
        assert_eq!(recover_partial_write(&path).unwrap(), 0);
    }

    #[test]
    fn partial_write_truncates_incomplete_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let good = format!("{LOG_HEADER}\n{}\n", created_line(0));
        fs::write(&path, format!("{good}{{\"sequence\":1,\"tim")).unwrap();
        let removed = recover_partial_write(&path).unwrap();
        assert_eq!(removed, 18);
        assert_eq!(fs::read_to_string(&path).unwrap(), good);
    }

    #[test]
    fn partial_write_missing_file_is_clean() {
        let dir = TempDir::new().unwrap();
        assert_eq!(recover_partial_write(&dir.path().join("nope")).unwrap(), 0);
    }

    #[test]
    fn corrupt_log_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        fs::write(
            &path,
            format!("{LOG_HEADER}\n{}\nnot json\n{}\n", created_line(0), created_line(1)),
        )
        .unwrap();

        let report = recover_corrupt_log(&path).unwrap();
        assert_eq!(report.events_preserved, 1);
        assert_eq!(report.events_discarded, 2);
        let RecoveryAction::Quarantined { backup_path } = report.action_taken else {
            panic!("expected quarantine");
        };
        assert!(fs::read_to_string(backup_path).unwrap().starts_with("not json"));
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn auto_recover_flags_units_for_rebuild() {
        let dir = TempDir::new().unwrap();
        let units = dir.path().join("units");
        let m1 = units.join("M1");
        fs::create_dir_all(&m1).unwrap();
        fs::write(m1.join("events.jsonl"), format!("{LOG_HEADER}\n{}\n{{\"seq", created_line(0)))
            .unwrap();
        let m2 = units.join("M2");
        fs::create_dir_all(&m2).unwrap();
        fs::write(m2.join(format!("{DOCUMENT_TMP_PREFIX}.123")), "{").unwrap();
        fs::create_dir_all(units.join("not valid")).unwrap();

        let result = auto_recover(&units).unwrap();
        assert_eq!(result.torn_write_repairs.len(), 1);
        assert_eq!(
            result.needs_rebuild,
            vec![WorkUnitId::parse("M1").unwrap(), WorkUnitId::parse("M2").unwrap()]
        );
        assert_eq!(result.warnings.len(), 1);
        assert!(!m2.join(format!("{DOCUMENT_TMP_PREFIX}.123")).exists());
    }

    #[test]
    fn auto_recover_quarantines_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let units = dir.path().join("units");
        let m1 = units.join("M1");
        fs::create_dir_all(&m1).unwrap();
        let log = m1.join("events.jsonl");
        fs::write(&log, format!("{LOG_HEADER}\n{}\ngarbage\n", created_line(0))).unwrap();

        let result = auto_recover(&units).unwrap();
        assert!(result.torn_write_repairs.is_empty());
        assert_eq!(result.needs_rebuild, vec![WorkUnitId::parse("M1").unwrap()]);
        assert!(result.warnings[0].contains("1 corrupt events"));
        assert!(log.with_extension("corrupt").exists());
    }

    #[test]
    fn open_db_with_retry_succeeds_immediately() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.sqlite3");
        let conn = open_db_with_retry(&path, Duration::from_millis(100), |p| {
            rusqlite::Connection::open(p)
        })
        .unwrap();
        conn.execute_batch("SELECT 1").unwrap();
    }
}
