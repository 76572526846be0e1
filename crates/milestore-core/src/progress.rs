//! Progress aggregation.
//!
//! Pure functions over a projected [`WorkUnit`]: weighted completion,
//! status derivation and the per-phase breakdown dashboards read. The
//! event log calls [`aggregate`] inside every commit that touches a
//! progress-affecting kind, so the stored percent is never trusted from a
//! caller.

use serde::Serialize;

use crate::event::{Event, EventPayload, ProgressData};
use crate::model::{Phase, PhaseStatus, Status, WorkUnit};

/// `round(Σ weight × fraction × 100)`, clamped to `0..=100`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn compute_percent(phases: &[Phase]) -> u8 {
    let total: f64 = phases
        .iter()
        .map(|p| p.weight * p.completion_fraction())
        .sum();
    // Clamped first, so the cast cannot truncate.
    (total * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Status implied by the document's phases, blockers and archival.
///
/// `completed` requires every phase complete; open blockers hold an
/// unfinished unit at `blocked`; any recorded work makes it `active`.
#[must_use]
pub fn derive_status(doc: &WorkUnit) -> Status {
    if doc.is_archived() {
        Status::Archived
    } else if doc.all_phases_complete() {
        Status::Completed
    } else if !doc.blockers.is_empty() {
        Status::Blocked
    } else if doc
        .phases
        .iter()
        .any(|p| p.status != PhaseStatus::Pending || p.completion > 0.0)
    {
        Status::Active
    } else {
        Status::Planned
    }
}

/// Accept `proposed` unless the document contradicts it.
///
/// A proposed `completed` with unfinished phases, or a proposed status that
/// would move backwards from what the phases show, falls back to the
/// derived status.
#[must_use]
pub fn reconcile_status(proposed: Status, doc: &WorkUnit) -> Status {
    let derived = derive_status(doc);
    match proposed {
        Status::Archived => Status::Archived,
        Status::Completed if !doc.all_phases_complete() => derived,
        _ if proposed.rank() < derived.rank() => derived,
        Status::Active if derived == Status::Blocked => derived,
        Status::Blocked if doc.blockers.is_empty() => derived,
        _ => proposed,
    }
}

/// One row of [`phase_breakdown`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseContribution {
    pub name: String,
    pub weight: f64,
    pub status: PhaseStatus,
    /// Completion fraction in `0.0..=1.0`.
    pub fraction: f64,
    /// `weight × fraction × 100`, the phase's share of the total percent.
    pub contribution: f64,
}

/// Per-phase weight, completion and contribution to the total.
#[must_use]
pub fn phase_breakdown(doc: &WorkUnit) -> Vec<PhaseContribution> {
    doc.phases
        .iter()
        .map(|p| {
            let fraction = p.completion_fraction();
            PhaseContribution {
                name: p.name.clone(),
                weight: p.weight,
                status: p.status,
                fraction,
                contribution: p.weight * fraction * 100.0,
            }
        })
        .collect()
}

/// Decide whether a commit needs a trailing aggregate record.
///
/// `before` is the percent stored before the batch, `after` the document
/// once every event in the batch is applied. Returns the phase-less
/// `progress_updated` payload to append when a progress-affecting kind ran
/// and the total moved, unless the batch already ends with a record
/// carrying the new total.
#[must_use]
pub fn aggregate(before: u8, after: &WorkUnit, batch: &[EventPayload]) -> Option<EventPayload> {
    if !batch.iter().any(|p| p.kind().affects_progress()) {
        return None;
    }
    if after.progress_percent == before {
        return None;
    }
    if let Some(EventPayload::ProgressUpdated(last)) = batch.last() {
        if last.progress_percent == after.progress_percent {
            return None;
        }
    }
    Some(EventPayload::ProgressUpdated(ProgressData::total(
        after.progress_percent,
    )))
}

/// Latest total recorded by any `progress_updated` event, for drift checks.
#[must_use]
pub fn last_recorded_percent<'a>(events: impl IntoIterator<Item = &'a Event>) -> Option<u8> {
    events
        .into_iter()
        .filter_map(|event| match &event.payload {
            EventPayload::ProgressUpdated(data) => Some(data.progress_percent),
            _ => None,
        })
        .last()
}
