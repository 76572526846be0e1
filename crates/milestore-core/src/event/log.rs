//! The append path.
//!
//! Every commit runs the same steps under the unit's lease:
//!
//! 1. Take the graph lease first when the batch adds dependency edges,
//!    then the unit lease. The fixed order rules out lease deadlocks.
//! 2. Refresh the backend routes and level the unit across active and
//!    mirror backends.
//! 3. Compare the caller's [`Expected`] token with the active backend's last
//!    sequence. A mismatch is returned as [`StoreError::Conflict`]; it is
//!    never retried here.
//! 4. Allocate sequences, project every event onto the current document
//!    (which validates it), stamp worker progress reports with the
//!    resulting total and append the aggregator's record if the total moved.
//! 5. Check new dependency edges against the whole store graph.
//! 6. Re-validate the leases, commit events and document together, then
//!    publish.

use chrono::Utc;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::{Event, EventPayload, Expected};
use crate::backend::BackendHandle;
use crate::broker::Broker;
use crate::error::StoreError;
use crate::graph::DependencyGraph;
use crate::graph::cycles::detect_cycle_on_add_all;
use crate::lock::{GRAPH_LEASE_KEY, Lease, LeaseManager};
use crate::model::{WorkUnit, WorkUnitId};
use crate::progress;
use crate::projection;
use crate::router::BackendRouter;

/// Events written by one commit and the document they produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub events: Vec<Event>,
    pub document: WorkUnit,
}

impl Committed {
    /// The first event of the batch: the one the caller asked for.
    #[must_use]
    pub fn primary(&self) -> Option<&Event> {
        self.events.first()
    }
}

/// Outcome of [`EventLog::recompute`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecomputeReport {
    pub work_unit_id: WorkUnitId,
    /// Percent in the stored document before the check.
    pub stored_percent: u8,
    /// Latest total found in a `progress_updated` record.
    pub recorded_percent: Option<u8>,
    /// Percent computed by replaying the log from sequence 0.
    pub computed_percent: u8,
    /// Whether the stored document disagreed with the replay and was rewritten.
    pub document_repaired: bool,
    /// The correcting `progress_updated` record, if one was appended.
    pub correction: Option<Event>,
}

/// Lease-serialized access to every unit's event log.
#[derive(Debug, Clone)]
pub struct EventLog {
    router: Arc<BackendRouter>,
    leases: LeaseManager,
    broker: Arc<Broker>,
    acquire_timeout: Duration,
}

impl EventLog {
    #[must_use]
    pub const fn new(
        router: Arc<BackendRouter>,
        leases: LeaseManager,
        broker: Arc<Broker>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            router,
            leases,
            broker,
            acquire_timeout,
        }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<BackendRouter> {
        &self.router
    }

    #[must_use]
    pub const fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Take the unit's lease, waiting up to the configured timeout.
    ///
    /// # Errors
    ///
    /// [`StoreError::LeaseTimeout`] or lease-file I/O failures.
    pub fn lease(&self, id: &WorkUnitId, writer: &str) -> Result<Lease, StoreError> {
        Ok(self
            .leases
            .acquire(id.as_str(), writer, self.acquire_timeout)?)
    }

    /// Append one event. Returns it as committed; an aggregator record
    /// written in the same commit is published but not returned.
    ///
    /// # Errors
    ///
    /// See [`EventLog::commit`].
    pub fn append(
        &self,
        id: &WorkUnitId,
        payload: EventPayload,
        writer: &str,
        expected: Expected,
    ) -> Result<Event, StoreError> {
        let committed = self.commit(id, vec![payload], writer, expected)?;
        committed
            .events
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::InvalidEvent {
                work_unit: id.clone(),
                sequence: committed.document.last_sequence,
                reason: "commit produced no events".into(),
            })
    }

    /// Append `payloads` as one atomic batch.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] when `expected` does not match the tail
    /// - [`StoreError::AlreadyExists`] for `created` on an existing unit
    /// - [`StoreError::InvalidEvent`] when projection rejects an event
    /// - [`StoreError::CycleDetected`] when a new edge closes a cycle
    /// - [`StoreError::NotFound`] for an unknown unit or an edge to one
    /// - [`StoreError::LeaseTimeout`] / [`StoreError::LeaseExpired`]
    /// - storage failures
    pub fn commit(
        &self,
        id: &WorkUnitId,
        payloads: Vec<EventPayload>,
        writer: &str,
        expected: Expected,
    ) -> Result<Committed, StoreError> {
        let adds_edges = payloads.iter().any(|p| match p {
            EventPayload::Created(data) => !data.dependencies.is_empty(),
            EventPayload::DependencyAdded(_) | EventPayload::Reconciled(_) => true,
            _ => false,
        });
        let graph_lease = if adds_edges {
            Some(
                self.leases
                    .acquire(GRAPH_LEASE_KEY, writer, self.acquire_timeout)?,
            )
        } else {
            None
        };
        let lease = self.lease(id, writer)?;
        self.commit_locked(&lease, graph_lease.as_ref(), id, payloads, writer, expected)
    }

    fn commit_locked(
        &self,
        lease: &Lease,
        graph_lease: Option<&Lease>,
        id: &WorkUnitId,
        payloads: Vec<EventPayload>,
        writer: &str,
        expected: Expected,
    ) -> Result<Committed, StoreError> {
        self.router.refresh()?;
        self.router.sync_unit(id)?;
        let active = self.router.active();

        let actual = active.last_sequence(id)?;
        if actual.is_some() && matches!(payloads.first(), Some(EventPayload::Created(_))) {
            return Err(StoreError::AlreadyExists {
                work_unit: id.clone(),
            });
        }
        if actual.is_none() && !matches!(payloads.first(), Some(EventPayload::Created(_))) {
            return Err(StoreError::NotFound {
                work_unit: id.clone(),
                backend: active.kind(),
            });
        }
        if !expected.matches(actual) {
            return Err(StoreError::Conflict {
                work_unit: id.clone(),
                expected: expected.as_sequence(),
                actual,
                backend: active.kind(),
            });
        }

        let mut doc = match actual {
            Some(_) => Some(
                active
                    .get_document(id)?
                    .ok_or_else(|| StoreError::NotFound {
                        work_unit: id.clone(),
                        backend: active.kind(),
                    })?,
            ),
            None => None,
        };
        let before = doc.as_ref().map_or(0, |d| d.progress_percent);
        let deps_before: BTreeSet<WorkUnitId> = doc
            .as_ref()
            .map(|d| d.dependencies.clone())
            .unwrap_or_default();

        let timestamp = Utc::now();
        let mut next = actual.map_or(0, |s| s + 1);
        let mut events = Vec::with_capacity(payloads.len() + 1);
        let mut applied = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let mut event = Event {
                sequence: next,
                timestamp,
                work_unit_id: id.clone(),
                kind: payload.kind(),
                payload,
                writer_id: writer.to_string(),
            };
            let projected = projection::apply(doc.take(), &event)?;
            if let EventPayload::ProgressUpdated(data) = &mut event.payload {
                data.progress_percent = projected.progress_percent;
            }
            applied.push(event.payload.clone());
            events.push(event);
            doc = Some(projected);
            next += 1;
        }
        let Some(mut doc) = doc else {
            return Err(StoreError::InvalidEvent {
                work_unit: id.clone(),
                sequence: next,
                reason: "empty batch".into(),
            });
        };

        if let Some(payload) = progress::aggregate(before, &doc, &applied) {
            let event = Event {
                sequence: next,
                timestamp,
                work_unit_id: id.clone(),
                kind: payload.kind(),
                payload,
                writer_id: writer.to_string(),
            };
            doc = projection::apply(Some(doc), &event)?;
            events.push(event);
        }

        let new_edges: Vec<&WorkUnitId> = doc.dependencies.difference(&deps_before).collect();
        if !new_edges.is_empty() {
            check_edges(&active, &doc, &new_edges)?;
        }

        // The lease may still lapse between this check and the write. The
        // backends catch that: flat files re-check contiguity under the
        // unit's `events.lock`, SQLite inside the commit transaction.
        lease.ensure_valid()?;
        if let Some(graph_lease) = graph_lease {
            graph_lease.ensure_valid()?;
        }
        self.router.commit(&events, &doc)?;

        for event in &events {
            tracing::info!(
                work_unit = %id,
                sequence = event.sequence,
                kind = %event.kind,
                writer = %writer,
                backend = %active.kind(),
                "appended"
            );
        }
        self.broker.publish(&events);
        Ok(Committed {
            events,
            document: doc,
        })
    }

    /// Lazily read `id`'s events from `from` on, one page at a time.
    #[must_use]
    pub fn read_from(&self, id: &WorkUnitId, from: u64) -> EventStream {
        EventStream::new(self.router.active(), id.clone(), from, self.router.page_size())
    }

    /// Rebuild `id`'s document from sequence 0 without touching storage.
    ///
    /// # Errors
    ///
    /// Read or projection failures.
    pub fn replay(&self, id: &WorkUnitId) -> Result<Option<WorkUnit>, StoreError> {
        projection::replay_stream(self.read_from(id, 0))
    }

    /// Replay `id` from sequence 0 and correct drift: rewrite a stored
    /// document that disagrees with the replay, and append a phase-less
    /// `progress_updated` record when the last recorded total differs from
    /// the computed one.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown unit, lease and storage
    /// failures.
    pub fn recompute(&self, id: &WorkUnitId, writer: &str) -> Result<RecomputeReport, StoreError> {
        let lease = self.lease(id, writer)?;
        self.router.refresh()?;
        self.router.sync_unit(id)?;
        let active = self.router.active();

        let events = active.read_all_events(id, 0, self.router.page_size())?;
        let replayed = projection::replay(&events)?.ok_or_else(|| StoreError::NotFound {
            work_unit: id.clone(),
            backend: active.kind(),
        })?;
        let stored = active.get_document(id)?;
        let stored_percent = stored.as_ref().map_or(0, |d| d.progress_percent);
        let recorded_percent = progress::last_recorded_percent(&events);

        let document_repaired = stored.as_ref() != Some(&replayed);
        if document_repaired {
            lease.ensure_valid()?;
            active.put_document(&replayed)?;
            if let Some(mirror) = self.router.mirror() {
                mirror.put_document(&replayed)?;
            }
            tracing::warn!(work_unit = %id, "stored document disagreed with replay; rewritten");
        }

        let drifted = recorded_percent.is_some_and(|p| p != replayed.progress_percent)
            || (recorded_percent.is_none() && replayed.progress_percent != 0);
        let correction = if drifted && !replayed.is_archived() {
            let committed = self.commit_locked(
                &lease,
                None,
                id,
                vec![EventPayload::ProgressUpdated(
                    crate::event::ProgressData::total(replayed.progress_percent),
                )],
                writer,
                Expected::Sequence(replayed.last_sequence),
            )?;
            committed.events.into_iter().next()
        } else {
            None
        };

        Ok(RecomputeReport {
            work_unit_id: id.clone(),
            stored_percent,
            recorded_percent,
            computed_percent: replayed.progress_percent,
            document_repaired,
            correction,
        })
    }
}

/// Reject edges to unknown units or edges that would close a cycle.
fn check_edges(
    active: &BackendHandle,
    doc: &WorkUnit,
    new_edges: &[&WorkUnitId],
) -> Result<(), StoreError> {
    let docs = active.list_documents()?;
    let known: BTreeSet<&WorkUnitId> = docs.iter().map(|d| &d.id).collect();
    if let Some(missing) = new_edges.iter().find(|dep| !known.contains(**dep)) {
        return Err(StoreError::NotFound {
            work_unit: (*missing).clone(),
            backend: active.kind(),
        });
    }
    let graph = DependencyGraph::from_documents(docs.iter().filter(|d| d.id != doc.id));
    if let Some(cycle) = detect_cycle_on_add_all(&graph, &doc.id, new_edges.iter().copied()) {
        return Err(StoreError::CycleDetected {
            work_unit: doc.id.clone(),
            cycle,
        });
    }
    Ok(())
}

/// A finite, restartable iterator over one unit's events.
///
/// Reads `page_size` events at a time. Iteration ends at the first short
/// page; [`EventStream::position`] is the sequence to resume from.
#[derive(Debug)]
pub struct EventStream {
    backend: BackendHandle,
    id: WorkUnitId,
    next: u64,
    page_size: usize,
    buffer: VecDeque<Event>,
    exhausted: bool,
}

impl EventStream {
    fn new(backend: BackendHandle, id: WorkUnitId, from: u64, page_size: usize) -> Self {
        Self {
            backend,
            id,
            next: from,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Sequence of the next event this stream would yield.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.next
    }

    fn fill(&mut self) -> Result<(), StoreError> {
        let page = self.backend.read_events(&self.id, self.next, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for EventStream {
    type Item = Result<Event, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        let event = self.buffer.pop_front()?;
        self.next = event.sequence + 1;
        Some(Ok(event))
    }
}
