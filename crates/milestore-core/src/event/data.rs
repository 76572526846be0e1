//! Typed payload data structs for each event kind.
//!
//! Each kind has a corresponding data struct that defines the JSON payload
//! schema. Unknown fields are ignored on read so older binaries can replay
//! logs written by newer ones.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::types::EventKind;
use crate::model::{Phase, PhaseSpec, WorkUnitId};

// ---------------------------------------------------------------------------
// EventPayload - the unified payload enum
// ---------------------------------------------------------------------------

/// Typed payload for an event. The discriminant is the event's `kind` field,
/// stored next to (not inside) the payload.
///
/// **Serde note:** `EventPayload` implements `Serialize` manually
/// (dispatching to the inner struct) but does **not** implement
/// `Deserialize` directly. Use [`EventPayload::deserialize_for`] with the
/// known [`EventKind`]; the [`Event`](super::Event) struct does this in its
/// custom `Deserialize` impl.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Created(CreatedData),
    PhaseStarted(PhaseStartedData),
    PhaseCompleted(PhaseCompletedData),
    ProgressUpdated(ProgressData),
    DependencyAdded(DependencyData),
    BlockerRaised(BlockerRaisedData),
    BlockerResolved(BlockerResolvedData),
    Archived(ArchivedData),
    Reconciled(ReconciledData),
}

impl EventPayload {
    /// The kind this payload belongs to.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Created(_) => EventKind::Created,
            Self::PhaseStarted(_) => EventKind::PhaseStarted,
            Self::PhaseCompleted(_) => EventKind::PhaseCompleted,
            Self::ProgressUpdated(_) => EventKind::ProgressUpdated,
            Self::DependencyAdded(_) => EventKind::DependencyAdded,
            Self::BlockerRaised(_) => EventKind::BlockerRaised,
            Self::BlockerResolved(_) => EventKind::BlockerResolved,
            Self::Archived(_) => EventKind::Archived,
            Self::Reconciled(_) => EventKind::Reconciled,
        }
    }

    /// Deserialize a JSON value into the variant selected by `kind`.
    ///
    /// # Errors
    ///
    /// Returns a [`PayloadParseError`] if the JSON does not match the schema
    /// for `kind`.
    pub fn deserialize_for(
        kind: EventKind,
        value: serde_json::Value,
    ) -> Result<Self, PayloadParseError> {
        let result = match kind {
            EventKind::Created => serde_json::from_value(value).map(Self::Created),
            EventKind::PhaseStarted => serde_json::from_value(value).map(Self::PhaseStarted),
            EventKind::PhaseCompleted => serde_json::from_value(value).map(Self::PhaseCompleted),
            EventKind::ProgressUpdated => {
                serde_json::from_value(value).map(Self::ProgressUpdated)
            }
            EventKind::DependencyAdded => {
                serde_json::from_value(value).map(Self::DependencyAdded)
            }
            EventKind::BlockerRaised => serde_json::from_value(value).map(Self::BlockerRaised),
            EventKind::BlockerResolved => {
                serde_json::from_value(value).map(Self::BlockerResolved)
            }
            EventKind::Archived => serde_json::from_value(value).map(Self::Archived),
            EventKind::Reconciled => serde_json::from_value(value).map(Self::Reconciled),
        };

        result.map_err(|source| PayloadParseError { kind, source })
    }

    /// Serialize the payload to a [`serde_json::Value`].
    ///
    /// # Errors
    ///
    /// Returns an error if the inner struct fails to serialize.
    pub fn to_json_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl Serialize for EventPayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Created(d) => d.serialize(serializer),
            Self::PhaseStarted(d) => d.serialize(serializer),
            Self::PhaseCompleted(d) => d.serialize(serializer),
            Self::ProgressUpdated(d) => d.serialize(serializer),
            Self::DependencyAdded(d) => d.serialize(serializer),
            Self::BlockerRaised(d) => d.serialize(serializer),
            Self::BlockerResolved(d) => d.serialize(serializer),
            Self::Archived(d) => d.serialize(serializer),
            Self::Reconciled(d) => d.serialize(serializer),
        }
    }
}

// ---------------------------------------------------------------------------
// PayloadParseError
// ---------------------------------------------------------------------------

/// Error returned when deserializing an event's JSON payload fails.
#[derive(Debug)]
pub struct PayloadParseError {
    /// The kind that was being deserialized.
    pub kind: EventKind,
    /// The underlying JSON parse error.
    pub source: serde_json::Error,
}

impl fmt::Display for PayloadParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} payload: {}", self.kind, self.source)
    }
}

impl std::error::Error for PayloadParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

// ---------------------------------------------------------------------------
// Payload structs - one per event kind
// ---------------------------------------------------------------------------

/// Payload for `created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedData {
    pub title: String,
    pub phases: Vec<PhaseSpec>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<WorkUnitId>,
}

/// Payload for `phase_started`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStartedData {
    pub phase: String,
}

/// Payload for `phase_completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCompletedData {
    pub phase: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deliverables: BTreeSet<String>,
}

/// Payload for `progress_updated`.
///
/// Workers set `phase` and `fraction` to report partial completion of one
/// phase. The aggregator records a phase-less entry when a recomputation
/// changes the total. `progress_percent` is always the total after this
/// event, stamped by the aggregator regardless of what the caller sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
    pub progress_percent: u8,
}

impl ProgressData {
    /// A worker report for one phase. The total is filled in on append.
    #[must_use]
    pub fn report(phase: impl Into<String>, fraction: f64) -> Self {
        Self {
            phase: Some(phase.into()),
            fraction: Some(fraction),
            progress_percent: 0,
        }
    }

    /// An aggregator record carrying only the new total.
    #[must_use]
    pub const fn total(progress_percent: u8) -> Self {
        Self {
            phase: None,
            fraction: None,
            progress_percent,
        }
    }
}

/// Payload for `dependency_added`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyData {
    pub depends_on: WorkUnitId,
}

/// Payload for `blocker_raised`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerRaisedData {
    pub blocker: String,
    #[serde(default)]
    pub reason: String,
}

/// Payload for `blocker_resolved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerResolvedData {
    pub blocker: String,
}

/// Payload for `archived`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArchivedData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload for `reconciled`: the merged baseline written by the state bridge.
///
/// On replay it sets the title and phase weights. Dependencies, blockers and
/// deliverables are unioned with the unit's own; a phase may never fall
/// behind its logged progress. Status stays derived from the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledData {
    pub title: String,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub dependencies: BTreeSet<WorkUnitId>,
    #[serde(default)]
    pub blockers: std::collections::BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn created_payload_omits_empty_dependencies() {
        let payload = EventPayload::Created(CreatedData {
            title: "M1".into(),
            phases: vec![PhaseSpec::new("design", 0.3), PhaseSpec::new("execute", 0.7)],
            dependencies: BTreeSet::new(),
        });
        let value = payload.to_json_value().unwrap();
        assert_eq!(
            value,
            json!({
                "title": "M1",
                "phases": [
                    {"name": "design", "weight": 0.3},
                    {"name": "execute", "weight": 0.7}
                ]
            })
        );
    }

    #[test]
    fn deserialize_for_dispatches_on_kind() {
        let payload = EventPayload::deserialize_for(
            EventKind::PhaseCompleted,
            json!({"phase": "design", "deliverables": ["docs/design.md"]}),
        )
        .unwrap();
        match payload {
            EventPayload::PhaseCompleted(data) => {
                assert_eq!(data.phase, "design");
                assert!(data.deliverables.contains("docs/design.md"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn deserialize_for_reports_kind_on_schema_mismatch() {
        let err =
            EventPayload::deserialize_for(EventKind::DependencyAdded, json!({"phase": "x"}))
                .unwrap_err();
        assert_eq!(err.kind, EventKind::DependencyAdded);
        assert!(err.to_string().contains("dependency_added"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let payload = EventPayload::deserialize_for(
            EventKind::Archived,
            json!({"reason": "shipped", "ticket": "OPS-12"}),
        )
        .unwrap();
        assert_eq!(
            payload,
            EventPayload::Archived(ArchivedData {
                reason: Some("shipped".into())
            })
        );
    }

    #[test]
    fn payload_kind_matches_variant() {
        assert_eq!(
            EventPayload::ProgressUpdated(ProgressData::total(40)).kind(),
            EventKind::ProgressUpdated
        );
        assert_eq!(
            EventPayload::Archived(ArchivedData::default()).kind(),
            EventKind::Archived
        );
    }
}
