//! Storage backends.
//!
//! Three implementations share the [`StorageBackend`] trait:
//!
//! - [`flat::FlatFileBackend`]: one directory per work unit holding
//!   `document.json` and an `events.jsonl` log. The canonical interchange
//!   layout.
//! - [`hybrid::HybridBackend`]: the flat-file layout plus an SQLite index
//!   over status, archival, sequence and dependency edges.
//! - [`sqlite::SqliteBackend`]: everything in one SQLite database.
//!
//! Query results are ordered by work unit id and are identical across all
//! three; `tests/backend_conformance.rs` runs the same suite against each.

pub mod flat;
pub mod hybrid;
pub mod schema;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::event::Event;
use crate::metrics::BackendMetrics;
use crate::model::{ParseEnumError, Status, WorkUnit, WorkUnitId};
use crate::projection;
use crate::recovery::HealthCheckResult;

/// The three storage tiers, in scale order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    FlatFile,
    IndexedHybrid,
    EmbeddedDatabase,
}

impl BackendKind {
    pub const ALL: [Self; 3] = [Self::FlatFile, Self::IndexedHybrid, Self::EmbeddedDatabase];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FlatFile => "flat-file",
            Self::IndexedHybrid => "indexed-hybrid",
            Self::EmbeddedDatabase => "embedded-database",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat-file" | "flat" => Ok(Self::FlatFile),
            "indexed-hybrid" | "hybrid" => Ok(Self::IndexedHybrid),
            "embedded-database" | "database" | "sqlite" => Ok(Self::EmbeddedDatabase),
            _ => Err(ParseEnumError {
                expected: "backend",
                got: s.to_string(),
            }),
        }
    }
}

/// Options shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendOptions {
    /// fsync every commit.
    pub durable: bool,
    /// Window over which distinct writers are counted in metrics.
    pub writer_window: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            durable: false,
            writer_window: Duration::from_secs(300),
        }
    }
}

/// Persistence for documents and their event logs.
///
/// Implementations serialize nothing themselves: the event log holds the
/// unit's lease around every mutating call. `commit` is still checked for
/// contiguity so a buggy or lease-less caller cannot open a gap.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Directory (or database file's directory) holding this backend's data.
    fn location(&self) -> &Path;

    /// Replace a document without touching its event log. Used for repairs
    /// and recomputation.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn put_document(&self, doc: &WorkUnit) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Storage failures or an unreadable document.
    fn get_document(&self, id: &WorkUnitId) -> Result<Option<WorkUnit>, StoreError>;

    /// Units with at least one event, ordered by id.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_ids(&self) -> Result<Vec<WorkUnitId>, StoreError>;

    /// # Errors
    ///
    /// Storage failures.
    fn query_by_status(&self, status: Status) -> Result<Vec<WorkUnit>, StoreError>;

    /// Non-archived units that depend directly on `depends_on`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn query_by_dependency(&self, depends_on: &WorkUnitId) -> Result<Vec<WorkUnit>, StoreError>;

    /// Atomically append `events` (contiguous, same unit) and store `doc`,
    /// the document after applying them.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if `events` do not continue the stored log;
    /// storage failures otherwise. On error nothing is persisted.
    fn commit(&self, events: &[Event], doc: &WorkUnit) -> Result<(), StoreError>;

    /// Up to `limit` events of `id` starting at sequence `from`.
    ///
    /// # Errors
    ///
    /// Storage failures or an unreadable log line.
    fn read_events(&self, id: &WorkUnitId, from: u64, limit: usize)
    -> Result<Vec<Event>, StoreError>;

    /// # Errors
    ///
    /// Storage failures.
    fn last_sequence(&self, id: &WorkUnitId) -> Result<Option<u64>, StoreError>;

    /// # Errors
    ///
    /// Storage failures.
    fn metrics(&self) -> Result<BackendMetrics, StoreError>;

    /// Physically remove a unit. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn purge(&self, id: &WorkUnitId) -> Result<bool, StoreError>;

    /// Delete all of this backend's storage. The backend must not be used
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn discard(&self) -> Result<(), StoreError>;

    /// Repair what a crashed writer can leave behind and report it.
    /// Callers must ensure no writer is active.
    ///
    /// # Errors
    ///
    /// Storage failures while scanning or rewriting.
    fn repair(&self) -> Result<HealthCheckResult, StoreError> {
        Ok(HealthCheckResult::default())
    }

    /// Append a single event, projecting the stored document forward.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidEvent`] if the event does not apply to the
    /// stored document, plus everything [`StorageBackend::commit`] returns.
    fn append_event(&self, event: &Event) -> Result<WorkUnit, StoreError> {
        let current = self.get_document(&event.work_unit_id)?;
        let doc = projection::apply(current, event)?;
        self.commit(std::slice::from_ref(event), &doc)?;
        Ok(doc)
    }

    /// Every document, ordered by id.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_documents(&self) -> Result<Vec<WorkUnit>, StoreError> {
        let mut docs = Vec::new();
        for id in self.list_ids()? {
            if let Some(doc) = self.get_document(&id)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Every event of `id` from `from` on, read in pages of `page`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn read_all_events(
        &self,
        id: &WorkUnitId,
        from: u64,
        page: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let mut out = Vec::new();
        let mut next = from;
        loop {
            let batch = self.read_events(id, next, page)?;
            let Some(last) = batch.last() else {
                break;
            };
            next = last.sequence + 1;
            let short = batch.len() < page;
            out.extend(batch);
            if short {
                break;
            }
        }
        Ok(out)
    }
}

/// Shared handle to a backend.
pub type BackendHandle = Arc<dyn StorageBackend>;

/// Open (creating if needed) a backend of `kind` rooted at `location`.
///
/// # Errors
///
/// Storage failures while creating directories or opening databases.
pub fn open_backend(
    kind: BackendKind,
    location: &Path,
    options: BackendOptions,
) -> Result<BackendHandle, StoreError> {
    Ok(match kind {
        BackendKind::FlatFile => Arc::new(flat::FlatFileBackend::open(location, options)?),
        BackendKind::IndexedHybrid => Arc::new(hybrid::HybridBackend::open(location, options)?),
        BackendKind::EmbeddedDatabase => Arc::new(sqlite::SqliteBackend::open(location, options)?),
    })
}

/// Check that `events` continue a log whose last sequence is `actual`.
pub(crate) fn check_contiguous(
    kind: BackendKind,
    events: &[Event],
    actual: Option<u64>,
) -> Result<(), StoreError> {
    let Some(first) = events.first() else {
        return Ok(());
    };
    let next = actual.map_or(0, |s| s + 1);
    let contiguous = first.sequence == next
        && events
            .windows(2)
            .all(|w| w[1].sequence == w[0].sequence + 1 && w[1].work_unit_id == w[0].work_unit_id);
    if contiguous {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            work_unit: first.work_unit_id.clone(),
            expected: first.sequence.checked_sub(1),
            actual,
            backend: kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_roundtrip() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::EmbeddedDatabase);
        assert!("postgres".parse::<BackendKind>().is_err());
    }

    #[test]
    fn kinds_are_ordered_by_scale() {
        assert!(BackendKind::FlatFile < BackendKind::IndexedHybrid);
        assert!(BackendKind::IndexedHybrid < BackendKind::EmbeddedDatabase);
    }
}
