//! Event → document projection.
//!
//! A document is the left fold of [`apply`] over its unit's events from
//! sequence 0. `apply` is also the validator: the event log runs it on a
//! copy of the current document before committing, so an event that would
//! be rejected on replay is never written.

use std::collections::BTreeSet;

use crate::error::StoreError;
use crate::event::{Event, EventPayload};
use crate::model::{Phase, PhaseStatus, Status, WorkUnit, validate_phase_specs};
use crate::progress;

fn reject(event: &Event, reason: impl Into<String>) -> StoreError {
    StoreError::InvalidEvent {
        work_unit: event.work_unit_id.clone(),
        sequence: event.sequence,
        reason: reason.into(),
    }
}

/// Fold one event into the document.
///
/// # Errors
///
/// Returns [`StoreError::InvalidEvent`] when the event does not continue
/// the document's sequence or is not valid for its current state.
pub fn apply(doc: Option<WorkUnit>, event: &Event) -> Result<WorkUnit, StoreError> {
    let next = doc.as_ref().map_or(0, |d| d.last_sequence + 1);
    if event.sequence != next {
        return Err(reject(
            event,
            format!("expected sequence {next}, got {}", event.sequence),
        ));
    }

    let mut doc = match (doc, &event.payload) {
        (None, EventPayload::Created(data)) => {
            validate_phase_specs(data.phases.iter().map(|p| (p.name.as_str(), p.weight)))
                .map_err(|reason| reject(event, reason))?;
            if data.dependencies.contains(&event.work_unit_id) {
                return Err(reject(event, "a work unit cannot depend on itself"));
            }
            return Ok(finish(
                WorkUnit {
                    id: event.work_unit_id.clone(),
                    title: data.title.clone(),
                    status: Status::Planned,
                    created_at: event.timestamp,
                    updated_at: event.timestamp,
                    phases: data.phases.iter().map(Phase::from_spec).collect(),
                    progress_percent: 0,
                    dependencies: data.dependencies.clone(),
                    blockers: std::collections::BTreeMap::new(),
                    last_sequence: event.sequence,
                    reconciled: false,
                },
                event,
            ));
        }
        (None, _) => return Err(reject(event, "first event must be `created`")),
        (Some(_), EventPayload::Created(_)) => {
            return Err(reject(event, "work unit already created"));
        }
        (Some(doc), _) => doc,
    };

    if doc.id != event.work_unit_id {
        return Err(reject(
            event,
            format!("event addressed to {} applied to {}", event.work_unit_id, doc.id),
        ));
    }
    if doc.is_archived() {
        return Err(reject(event, "work unit is archived"));
    }

    match &event.payload {
        EventPayload::Created(_) => return Err(reject(event, "work unit already created")),
        EventPayload::PhaseStarted(data) => {
            let phase = doc
                .phase_mut(&data.phase)
                .ok_or_else(|| reject(event, format!("unknown phase '{}'", data.phase)))?;
            match phase.status {
                PhaseStatus::Pending => phase.status = PhaseStatus::Active,
                PhaseStatus::Active => {}
                PhaseStatus::Completed => {
                    return Err(reject(
                        event,
                        format!("phase '{}' is already completed", data.phase),
                    ));
                }
            }
        }
        EventPayload::PhaseCompleted(data) => {
            let phase = doc
                .phase_mut(&data.phase)
                .ok_or_else(|| reject(event, format!("unknown phase '{}'", data.phase)))?;
            phase.status = PhaseStatus::Completed;
            phase.completion = 1.0;
            phase.deliverables.extend(data.deliverables.iter().cloned());
        }
        EventPayload::ProgressUpdated(data) => match (&data.phase, data.fraction) {
            (Some(name), Some(fraction)) => {
                if !(0.0..=1.0).contains(&fraction) {
                    return Err(reject(
                        event,
                        format!("fraction {fraction} outside 0.0..=1.0"),
                    ));
                }
                let phase = doc
                    .phase_mut(name)
                    .ok_or_else(|| reject(event, format!("unknown phase '{name}'")))?;
                // Reports are monotonic: a late, lower report never rolls back.
                phase.completion = phase.completion.max(fraction);
            }
            (None, None) => {}
            _ => {
                return Err(reject(
                    event,
                    "a progress report needs both phase and fraction",
                ));
            }
        },
        EventPayload::DependencyAdded(data) => {
            if data.depends_on == doc.id {
                return Err(reject(event, "a work unit cannot depend on itself"));
            }
            doc.dependencies.insert(data.depends_on.clone());
        }
        EventPayload::BlockerRaised(data) => {
            if data.blocker.trim().is_empty() {
                return Err(reject(event, "blocker id must not be empty"));
            }
            doc.blockers.insert(data.blocker.clone(), data.reason.clone());
        }
        EventPayload::BlockerResolved(data) => {
            if doc.blockers.remove(&data.blocker).is_none() {
                return Err(reject(
                    event,
                    format!("no open blocker '{}'", data.blocker),
                ));
            }
        }
        EventPayload::Archived(_) => {
            doc.status = Status::Archived;
        }
        EventPayload::Reconciled(data) => {
            if doc.reconciled {
                return Err(reject(event, "work unit was already reconciled"));
            }
            validate_phase_specs(data.phases.iter().map(|p| (p.name.as_str(), p.weight)))
                .map_err(|reason| reject(event, reason))?;
            let names: BTreeSet<&str> = doc.phases.iter().map(|p| p.name.as_str()).collect();
            let merged: BTreeSet<&str> = data.phases.iter().map(|p| p.name.as_str()).collect();
            if let Some(dropped) = names.difference(&merged).next() {
                return Err(reject(event, format!("reconciliation drops phase '{dropped}'")));
            }
            if data.dependencies.contains(&doc.id) {
                return Err(reject(event, "a work unit cannot depend on itself"));
            }
            // The log is authoritative: a view can add, never take back.
            let mut phases = data.phases.clone();
            for phase in &mut phases {
                let Some(stored) = doc.phase(&phase.name) else {
                    continue;
                };
                if phase.falls_behind(stored) {
                    return Err(reject(
                        event,
                        format!(
                            "reconciliation moves phase '{}' back from {} ({:.2})",
                            phase.name, stored.status, stored.completion
                        ),
                    ));
                }
                phase.deliverables.extend(stored.deliverables.iter().cloned());
            }
            doc.title.clone_from(&data.title);
            doc.phases = phases;
            doc.dependencies.extend(data.dependencies.iter().cloned());
            for (blocker, reason) in &data.blockers {
                doc.blockers
                    .entry(blocker.clone())
                    .or_insert_with(|| reason.clone());
            }
            doc.reconciled = true;
        }
    }

    Ok(finish(doc, event))
}

fn finish(mut doc: WorkUnit, event: &Event) -> WorkUnit {
    doc.last_sequence = event.sequence;
    doc.updated_at = event.timestamp;
    doc.progress_percent = progress::compute_percent(&doc.phases);
    doc.status = progress::derive_status(&doc);
    doc
}

/// Rebuild a document from its full event history.
///
/// Returns `None` for an empty history.
///
/// # Errors
///
/// Returns the first [`StoreError::InvalidEvent`] encountered.
pub fn replay<'a>(
    events: impl IntoIterator<Item = &'a Event>,
) -> Result<Option<WorkUnit>, StoreError> {
    let mut doc = None;
    for event in events {
        doc = Some(apply(doc, event)?);
    }
    Ok(doc)
}

/// [`replay`] over a fallible stream, such as an [`EventStream`](crate::event::EventStream).
///
/// # Errors
///
/// Returns the first read or projection error.
pub fn replay_stream(
    events: impl IntoIterator<Item = Result<Event, StoreError>>,
) -> Result<Option<WorkUnit>, StoreError> {
    let mut doc = None;
    for event in events {
        doc = Some(apply(doc, &event?)?);
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        ArchivedData, BlockerRaisedData, BlockerResolvedData, CreatedData, DependencyData,
        EventKind, PhaseCompletedData, PhaseStartedData, ProgressData, ReconciledData,
    };
    use crate::model::{PhaseSpec, WorkUnitId};
    use chrono::Utc;

    struct Log {
        id: WorkUnitId,
        events: Vec<Event>,
    }

    impl Log {
        fn new(raw: &str) -> Self {
            Self {
                id: WorkUnitId::parse(raw).unwrap(),
                events: Vec::new(),
            }
        }

        fn event(&self, payload: EventPayload) -> Event {
            Event {
                sequence: u64::try_from(self.events.len()).unwrap(),
                timestamp: Utc::now(),
                work_unit_id: self.id.clone(),
                kind: payload.kind(),
                payload,
                writer_id: "test".into(),
            }
        }

        fn push(&mut self, payload: EventPayload) -> &mut Self {
            let event = self.event(payload);
            self.events.push(event);
            self
        }

        fn doc(&self) -> WorkUnit {
            replay(&self.events).unwrap().unwrap()
        }
    }

    fn created() -> EventPayload {
        EventPayload::Created(CreatedData {
            title: "Ship v2".into(),
            phases: vec![PhaseSpec::new("design", 0.3), PhaseSpec::new("execute", 0.7)],
            dependencies: BTreeSet::new(),
        })
    }

    fn started(phase: &str) -> EventPayload {
        EventPayload::PhaseStarted(PhaseStartedData {
            phase: phase.into(),
        })
    }

    fn completed(phase: &str) -> EventPayload {
        EventPayload::PhaseCompleted(PhaseCompletedData {
            phase: phase.into(),
            deliverables: BTreeSet::from(["docs/out.md".to_string()]),
        })
    }

    #[test]
    fn lifecycle_to_completed() {
        let mut log = Log::new("M1");
        log.push(created()).push(started("design")).push(completed("design"));
        let doc = log.doc();
        assert_eq!(doc.status, Status::Active);
        assert_eq!(doc.progress_percent, 30);
        assert_eq!(doc.last_sequence, 2);

        log.push(started("execute")).push(completed("execute"));
        let doc = log.doc();
        assert_eq!(doc.status, Status::Completed);
        assert_eq!(doc.progress_percent, 100);
    }

    #[test]
    fn blockers_toggle_blocked() {
        let mut log = Log::new("M1");
        log.push(created()).push(started("design"));
        log.push(EventPayload::BlockerRaised(BlockerRaisedData {
            blocker: "B1".into(),
            reason: "vendor".into(),
        }));
        assert_eq!(log.doc().status, Status::Blocked);
        log.push(EventPayload::BlockerResolved(BlockerResolvedData {
            blocker: "B1".into(),
        }));
        assert_eq!(log.doc().status, Status::Active);
    }

    #[test]
    fn worker_reports_are_monotonic() {
        let mut log = Log::new("M1");
        log.push(created());
        log.push(EventPayload::ProgressUpdated(ProgressData::report("execute", 0.5)));
        log.push(EventPayload::ProgressUpdated(ProgressData::report("execute", 0.2)));
        let doc = log.doc();
        assert!((doc.phase("execute").unwrap().completion - 0.5).abs() < f64::EPSILON);
        assert_eq!(doc.progress_percent, 35);
        assert_eq!(doc.status, Status::Active);
    }

    #[test]
    fn rejects_gaps_and_duplicates() {
        let mut log = Log::new("M1");
        log.push(created());
        let doc = log.doc();

        let mut gap = log.event(started("design"));
        gap.sequence = 5;
        let err = apply(Some(doc.clone()), &gap).unwrap_err();
        assert!(err.to_string().contains("expected sequence 1"));

        let again = log.event(created());
        assert!(apply(Some(doc), &again).is_err());
    }

    #[test]
    fn rejects_unknown_phase_and_bad_template() {
        let mut log = Log::new("M1");
        log.push(created());
        let err = apply(Some(log.doc()), &log.event(started("deploy"))).unwrap_err();
        assert!(err.to_string().contains("unknown phase"));

        let bad = Log::new("M2");
        let bad_created = bad.event(EventPayload::Created(CreatedData {
            title: "bad".into(),
            phases: vec![PhaseSpec::new("a", 0.5), PhaseSpec::new("b", 0.4)],
            dependencies: BTreeSet::new(),
        }));
        assert!(apply(None, &bad_created).is_err());
    }

    #[test]
    fn first_event_must_be_created() {
        let log = Log::new("M1");
        let err = apply(None, &log.event(started("design"))).unwrap_err();
        assert!(err.to_string().contains("first event"));
    }

    #[test]
    fn archived_units_reject_further_events() {
        let mut log = Log::new("M1");
        log.push(created())
            .push(EventPayload::Archived(ArchivedData::default()));
        let doc = log.doc();
        assert_eq!(doc.status, Status::Archived);
        assert!(apply(Some(doc), &log.event(started("design"))).is_err());
    }

    #[test]
    fn self_dependency_rejected() {
        let mut log = Log::new("M1");
        log.push(created());
        let event = log.event(EventPayload::DependencyAdded(DependencyData {
            depends_on: WorkUnitId::parse("M1").unwrap(),
        }));
        assert!(apply(Some(log.doc()), &event).is_err());
    }

    #[test]
    fn reconciled_sets_baseline_once() {
        let mut log = Log::new("M1");
        log.push(created()).push(started("design"));
        let mut phases = log.doc().phases;
        phases[0].status = PhaseStatus::Completed;
        phases[0].completion = 1.0;
        let merged = ReconciledData {
            title: "Ship v2 (final)".into(),
            phases,
            dependencies: BTreeSet::new(),
            blockers: std::collections::BTreeMap::new(),
        };
        log.push(EventPayload::Reconciled(merged.clone()));
        let doc = log.doc();
        assert!(doc.reconciled);
        assert_eq!(doc.title, "Ship v2 (final)");
        assert_eq!(doc.progress_percent, 30);

        let second = log.event(EventPayload::Reconciled(merged));
        assert_eq!(second.kind, EventKind::Reconciled);
        assert!(apply(Some(doc), &second).is_err());
    }

    #[test]
    fn reconciled_unions_logged_edges_blockers_and_deliverables() {
        let mut log = Log::new("M1");
        log.push(created())
            .push(EventPayload::DependencyAdded(DependencyData {
                depends_on: WorkUnitId::parse("A").unwrap(),
            }))
            .push(started("design"))
            .push(completed("design"))
            .push(EventPayload::BlockerRaised(BlockerRaisedData {
                blocker: "B1".into(),
                reason: "vendor".into(),
            }));
        let mut phases = log.doc().phases;
        phases[0].deliverables.clear();
        log.push(EventPayload::Reconciled(ReconciledData {
            title: "Ship v2".into(),
            phases,
            dependencies: BTreeSet::from([WorkUnitId::parse("C").unwrap()]),
            blockers: std::collections::BTreeMap::new(),
        }));

        let doc = log.doc();
        let deps: Vec<&str> = doc.dependencies.iter().map(WorkUnitId::as_str).collect();
        assert_eq!(deps, ["A", "C"]);
        assert!(doc.blockers.contains_key("B1"));
        assert_eq!(doc.status, Status::Blocked);
        assert!(doc.phase("design").unwrap().deliverables.contains("docs/out.md"));
    }

    #[test]
    fn reconciled_cannot_move_a_phase_backward() {
        let mut log = Log::new("M1");
        log.push(created())
            .push(started("design"))
            .push(completed("design"))
            .push(EventPayload::ProgressUpdated(ProgressData::report("execute", 0.5)));
        let doc = log.doc();

        let mut reset = doc.phases.clone();
        reset[0].status = PhaseStatus::Pending;
        reset[0].completion = 0.0;
        let event = log.event(EventPayload::Reconciled(ReconciledData {
            title: doc.title.clone(),
            phases: reset,
            dependencies: BTreeSet::new(),
            blockers: std::collections::BTreeMap::new(),
        }));
        let err = apply(Some(doc.clone()), &event).unwrap_err();
        assert!(err.to_string().contains("phase 'design' back"), "{err}");

        let mut lower = doc.phases.clone();
        lower[1].completion = 0.2;
        let event = log.event(EventPayload::Reconciled(ReconciledData {
            title: doc.title.clone(),
            phases: lower,
            dependencies: BTreeSet::new(),
            blockers: std::collections::BTreeMap::new(),
        }));
        assert!(apply(Some(doc), &event).is_err());
    }

    #[test]
    fn replay_is_idempotent() {
        let mut log = Log::new("M1");
        log.push(created()).push(started("design")).push(completed("design"));
        assert_eq!(replay(&log.events).unwrap(), replay(&log.events).unwrap());
        let streamed = replay_stream(log.events.iter().cloned().map(Ok)).unwrap();
        assert_eq!(streamed, replay(&log.events).unwrap());
    }
}
