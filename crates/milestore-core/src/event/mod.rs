//! Event data model and the append-only event log.
//!
//! Every state change of a work unit is an [`Event`]: an immutable record
//! with a per-unit, gapless `sequence` starting at 0. Documents are
//! projections of the log (see [`crate::projection`]).
//!
//! # Line format
//!
//! Flat-file backends store one event per line as compact JSON:
//!
//! ```text
//! {"sequence":0,"timestamp":"2026-01-05T10:00:00Z","work_unit_id":"M1","kind":"created","payload":{...},"writer_id":"planner"}
//! ```
//!
//! The embedded database stores the same fields as columns, with `payload`
//! kept as JSON text.

pub mod data;
pub mod log;
pub mod types;

pub use data::{
    ArchivedData, BlockerRaisedData, BlockerResolvedData, CreatedData, DependencyData,
    EventPayload, PayloadParseError, PhaseCompletedData, PhaseStartedData, ProgressData,
    ReconciledData,
};
pub use log::{Committed, EventLog, EventStream, RecomputeReport};
pub use types::{EventKind, UnknownEventKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::WorkUnitId;

/// A single committed event.
///
/// # Serde
///
/// Custom `Deserialize` uses `kind` to drive typed deserialization of
/// `payload`, since the discriminant lives outside the payload object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Position in the unit's log. Gapless, starting at 0.
    pub sequence: u64,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
    /// The work unit this event mutates.
    pub work_unit_id: WorkUnitId,
    pub kind: EventKind,
    pub payload: EventPayload,
    /// Identity of the worker that appended the event.
    pub writer_id: String,
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct EventRaw {
            sequence: u64,
            timestamp: DateTime<Utc>,
            work_unit_id: WorkUnitId,
            kind: EventKind,
            payload: serde_json::Value,
            writer_id: String,
        }

        let raw = EventRaw::deserialize(deserializer)?;
        let payload = EventPayload::deserialize_for(raw.kind, raw.payload)
            .map_err(serde::de::Error::custom)?;

        Ok(Self {
            sequence: raw.sequence,
            timestamp: raw.timestamp,
            work_unit_id: raw.work_unit_id,
            kind: raw.kind,
            payload,
            writer_id: raw.writer_id,
        })
    }
}

impl Event {
    /// Encode as a single JSONL line, without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one JSONL line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not a valid event record.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{}\t{}\t{}\t{}\t",
            self.sequence,
            self.timestamp.to_rfc3339(),
            self.writer_id,
            self.kind
        )?;
        match &self.payload {
            EventPayload::Created(d) => write!(f, "{} ({} phases)", d.title, d.phases.len()),
            EventPayload::PhaseStarted(d) => f.write_str(&d.phase),
            EventPayload::PhaseCompleted(d) if d.deliverables.is_empty() => f.write_str(&d.phase),
            EventPayload::PhaseCompleted(d) => {
                write!(f, "{} [{} deliverables]", d.phase, d.deliverables.len())
            }
            EventPayload::ProgressUpdated(d) => match (&d.phase, d.fraction) {
                (Some(phase), Some(fraction)) => {
                    write!(f, "{phase}={fraction:.2} -> {}%", d.progress_percent)
                }
                _ => write!(f, "{}%", d.progress_percent),
            },
            EventPayload::DependencyAdded(d) => write!(f, "-> {}", d.depends_on),
            EventPayload::BlockerRaised(d) => write!(f, "{}: {}", d.blocker, d.reason),
            EventPayload::BlockerResolved(d) => f.write_str(&d.blocker),
            EventPayload::Archived(d) => f.write_str(d.reason.as_deref().unwrap_or("-")),
            EventPayload::Reconciled(d) => write!(f, "{} ({} phases)", d.title, d.phases.len()),
        }
    }
}

/// Optimistic-concurrency token supplied with an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expected {
    /// Append regardless of the current tail.
    #[default]
    Any,
    /// The unit must not have any events yet.
    NoStream,
    /// The unit's last committed sequence must equal this value.
    Sequence(u64),
}

impl Expected {
    /// Whether `actual` (the unit's current last sequence) satisfies the token.
    #[must_use]
    pub const fn matches(self, actual: Option<u64>) -> bool {
        match (self, actual) {
            (Self::Any, _) | (Self::NoStream, None) => true,
            (Self::Sequence(want), Some(have)) => want == have,
            _ => false,
        }
    }

    /// The sequence this token asserts, if any.
    #[must_use]
    pub const fn as_sequence(self) -> Option<u64> {
        match self {
            Self::Sequence(seq) => Some(seq),
            Self::Any | Self::NoStream => None,
        }
    }
}

impl From<u64> for Expected {
    fn from(seq: u64) -> Self {
        Self::Sequence(seq)
    }
}

impl From<Option<u64>> for Expected {
    fn from(seq: Option<u64>) -> Self {
        seq.map_or(Self::NoStream, Self::Sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PhaseSpec;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn sample_created() -> Event {
        Event {
            sequence: 0,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(),
            work_unit_id: WorkUnitId::parse("M1").unwrap(),
            kind: EventKind::Created,
            payload: EventPayload::Created(CreatedData {
                title: "Ship v2".into(),
                phases: vec![PhaseSpec::new("design", 0.3), PhaseSpec::new("execute", 0.7)],
                dependencies: BTreeSet::new(),
            }),
            writer_id: "planner".into(),
        }
    }

    #[test]
    fn line_roundtrip_preserves_typed_payload() {
        let event = sample_created();
        let line = event.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"kind\":\"created\""));
        let back = Event::from_line(&line).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn from_line_rejects_payload_that_does_not_match_kind() {
        let line = r#"{"sequence":1,"timestamp":"2026-01-05T10:00:00Z","work_unit_id":"M1","kind":"phase_started","payload":{"depends_on":"M2"},"writer_id":"w"}"#;
        assert!(Event::from_line(line).is_err());
    }

    #[test]
    fn from_line_tolerates_trailing_newline() {
        let line = format!("{}\n", sample_created().to_line().unwrap());
        assert!(Event::from_line(&line).is_ok());
    }

    #[test]
    fn display_is_single_line() {
        let shown = sample_created().to_string();
        assert!(shown.starts_with("#0\t"));
        assert!(shown.contains("Ship v2 (2 phases)"));
        assert!(!shown.contains('\n'));
    }

    #[test]
    fn expected_token_matching() {
        assert!(Expected::Any.matches(None));
        assert!(Expected::Any.matches(Some(9)));
        assert!(Expected::NoStream.matches(None));
        assert!(!Expected::NoStream.matches(Some(0)));
        assert!(Expected::Sequence(3).matches(Some(3)));
        assert!(!Expected::Sequence(3).matches(Some(4)));
        assert!(!Expected::Sequence(0).matches(None));
        assert_eq!(Expected::from(Some(2)), Expected::Sequence(2));
        assert_eq!(Expected::from(None), Expected::NoStream);
    }
}
