//! Event kind enum covering the nine work-unit event kinds.
//!
//! The string form is the snake_case name stored in the `kind` field of
//! every event record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of state change a work unit can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A new work unit with its phase template.
    Created,
    /// Execution of a phase began.
    PhaseStarted,
    /// A phase finished, optionally with deliverables.
    PhaseCompleted,
    /// Partial progress from a worker, or the aggregator's recomputed total.
    ProgressUpdated,
    /// A dependency edge to another work unit.
    DependencyAdded,
    /// Something is blocking execution.
    BlockerRaised,
    /// A previously raised blocker cleared.
    BlockerResolved,
    /// Soft delete; the unit leaves active queries.
    Archived,
    /// Canonical document produced by the planning/execution bridge.
    Reconciled,
}

/// Error returned when parsing an unknown event kind string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEventKind {
    /// The unrecognised input string.
    pub raw: String,
}

impl fmt::Display for UnknownEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown event kind '{}': expected one of created, phase_started, \
             phase_completed, progress_updated, dependency_added, blocker_raised, \
             blocker_resolved, archived, reconciled",
            self.raw
        )
    }
}

impl std::error::Error for UnknownEventKind {}

impl EventKind {
    /// All known kinds in catalog order.
    pub const ALL: [Self; 9] = [
        Self::Created,
        Self::PhaseStarted,
        Self::PhaseCompleted,
        Self::ProgressUpdated,
        Self::DependencyAdded,
        Self::BlockerRaised,
        Self::BlockerResolved,
        Self::Archived,
        Self::Reconciled,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PhaseStarted => "phase_started",
            Self::PhaseCompleted => "phase_completed",
            Self::ProgressUpdated => "progress_updated",
            Self::DependencyAdded => "dependency_added",
            Self::BlockerRaised => "blocker_raised",
            Self::BlockerResolved => "blocker_resolved",
            Self::Archived => "archived",
            Self::Reconciled => "reconciled",
        }
    }

    /// Kinds after which the progress aggregator must run in the same commit.
    #[must_use]
    pub const fn affects_progress(self) -> bool {
        matches!(
            self,
            Self::PhaseStarted
                | Self::PhaseCompleted
                | Self::ProgressUpdated
                | Self::BlockerRaised
                | Self::BlockerResolved
                | Self::Reconciled
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind { raw: s.to_string() })
    }
}

// Custom serde: serialize as the snake_case string.
impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}
