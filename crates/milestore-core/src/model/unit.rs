use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::{fmt, str::FromStr};

use super::unit_id::WorkUnitId;

/// Allowed distance between the sum of phase weights and 1.0.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// The five work unit lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Planned,
    Active,
    Blocked,
    Completed,
    Archived,
}

impl Status {
    pub const ALL: [Self; 5] = [
        Self::Planned,
        Self::Active,
        Self::Blocked,
        Self::Completed,
        Self::Archived,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    /// Position in the forward lifecycle. `active` and `blocked` share a rank:
    /// moving between them is not a regression.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Planned => 0,
            Self::Active | Self::Blocked => 1,
            Self::Completed => 2,
            Self::Archived => 3,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planned" => Ok(Self::Planned),
            "active" => Ok(Self::Active),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            _ => Err(ParseEnumError {
                expected: "status",
                got: s.to_string(),
            }),
        }
    }
}

/// Per-phase lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Active,
    Completed,
}

impl PhaseStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Active => 1,
            Self::Completed => 2,
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase template supplied at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub weight: f64,
}

impl PhaseSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// A named, weighted stage within a work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub weight: f64,
    pub status: PhaseStatus,
    /// Fraction of the phase reported done by workers, in `0.0..=1.0`.
    #[serde(default)]
    pub completion: f64,
    #[serde(default)]
    pub deliverables: BTreeSet<String>,
}

impl Phase {
    #[must_use]
    pub fn from_spec(spec: &PhaseSpec) -> Self {
        Self {
            name: spec.name.clone(),
            weight: spec.weight,
            status: PhaseStatus::Pending,
            completion: 0.0,
            deliverables: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == PhaseStatus::Completed
    }

    /// Completion fraction used for progress aggregation.
    #[must_use]
    pub fn completion_fraction(&self) -> f64 {
        if self.is_complete() {
            1.0
        } else {
            self.completion.clamp(0.0, 1.0)
        }
    }

    /// Whether this phase records less progress than `stored`.
    #[must_use]
    pub fn falls_behind(&self, stored: &Self) -> bool {
        self.status.rank() < stored.status.rank()
            || self.completion_fraction() + 1e-9 < stored.completion_fraction()
    }
}

/// The projected state of one milestone.
///
/// Never written field-by-field by callers: every change arrives as an
/// event and is folded in by [`crate::projection::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: WorkUnitId,
    pub title: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phases: Vec<Phase>,
    pub progress_percent: u8,
    #[serde(default)]
    pub dependencies: BTreeSet<WorkUnitId>,
    /// Open blockers keyed by blocker id, valued by reason.
    #[serde(default)]
    pub blockers: BTreeMap<String, String>,
    /// Sequence number of the last event folded into this document.
    pub last_sequence: u64,
    #[serde(default)]
    pub reconciled: bool,
}

impl WorkUnit {
    #[must_use]
    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_mut(&mut self, name: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.name == name)
    }

    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.status == Status::Archived
    }

    #[must_use]
    pub fn all_phases_complete(&self) -> bool {
        !self.phases.is_empty() && self.phases.iter().all(Phase::is_complete)
    }

    /// Whether any execution work has been recorded against this unit.
    #[must_use]
    pub fn execution_started(&self) -> bool {
        self.status.rank() > Status::Planned.rank()
            || self
                .phases
                .iter()
                .any(|p| p.status != PhaseStatus::Pending || p.completion > 0.0)
    }

    #[must_use]
    pub fn weight_sum(&self) -> f64 {
        self.phases.iter().map(|p| p.weight).sum()
    }
}

/// Validate a phase template: non-empty, unique names, weights in
/// `0.0..=1.0` summing to 1.0.
///
/// # Errors
///
/// Returns a human-readable reason when the template is invalid.
pub fn validate_phase_specs<'a>(
    phases: impl IntoIterator<Item = (&'a str, f64)>,
) -> Result<(), String> {
    let mut seen = BTreeSet::new();
    let mut sum = 0.0;
    let mut count = 0usize;

    for (name, weight) in phases {
        count += 1;
        if name.trim().is_empty() {
            return Err("phase name must not be empty".to_string());
        }
        if !seen.insert(name) {
            return Err(format!("duplicate phase '{name}'"));
        }
        if !(0.0..=1.0).contains(&weight) || weight.is_nan() {
            return Err(format!("phase '{name}' has weight {weight} outside 0.0..=1.0"));
        }
        sum += weight;
    }

    if count == 0 {
        return Err("a work unit needs at least one phase".to_string());
    }
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(format!("phase weights sum to {sum}, expected 1.0"));
    }
    Ok(())
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}
