//! Backend tier selection.
//!
//! The monitor never migrates anything itself. It turns a metrics snapshot
//! into an explicit [`ScaleDecision`] that callers inspect, log, and pass to
//! [`crate::migrate::MigrationEngine::migrate`].
//!
//! # Hysteresis
//!
//! Each tier has an upper bound to move up and a lower bound to move back
//! down. Between the two the current tier is kept, so a document count
//! oscillating around a single threshold never triggers back-to-back
//! migrations.
//!
//! | from \ to        | flat-file            | indexed-hybrid        | embedded-database                  |
//! |------------------|----------------------|-----------------------|------------------------------------|
//! | flat-file        | docs < hybrid_up     | docs >= hybrid_up     | docs >= db_up or writers >= db_up_writers |
//! | indexed-hybrid   | docs < hybrid_down   | otherwise             | docs >= db_up or writers >= db_up_writers |
//! | embedded-database| docs < hybrid_down   | docs < db_down        | otherwise                          |
//!
//! Downgrades require `allow_downgrade`. The database tier is also held while
//! the writer count stays at or above the writer threshold.

use serde::Serialize;
use std::fmt;

use crate::backend::BackendKind;
use crate::config::ScaleConfig;
use crate::metrics::BackendMetrics;

/// Direction of a scale decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    Stay,
    Upgrade,
    Downgrade,
}

/// Why a tier was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleReason {
    /// Metrics sit inside the current tier's band.
    WithinBand,
    DocumentCount,
    ConcurrentWriters,
    /// A smaller tier fits, but downgrades are disabled.
    DowngradeDisabled,
    /// Chosen by an operator rather than by thresholds.
    Requested,
}

impl ScaleReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::WithinBand => "within band",
            Self::DocumentCount => "document count",
            Self::ConcurrentWriters => "concurrent writers",
            Self::DowngradeDisabled => "downgrade disabled",
            Self::Requested => "requested",
        }
    }
}

/// The monitor's verdict for one metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScaleDecision {
    pub current: BackendKind,
    pub target: BackendKind,
    pub action: ScaleAction,
    pub reason: ScaleReason,
    pub metrics: BackendMetrics,
}

impl ScaleDecision {
    /// A decision that keeps `current`.
    #[must_use]
    pub const fn stay(current: BackendKind, metrics: BackendMetrics) -> Self {
        Self {
            current,
            target: current,
            action: ScaleAction::Stay,
            reason: ScaleReason::WithinBand,
            metrics,
        }
    }

    /// An operator-requested move to `target`, bypassing thresholds.
    #[must_use]
    pub fn forced(current: BackendKind, target: BackendKind, metrics: BackendMetrics) -> Self {
        let action = match target.cmp(&current) {
            std::cmp::Ordering::Greater => ScaleAction::Upgrade,
            std::cmp::Ordering::Less => ScaleAction::Downgrade,
            std::cmp::Ordering::Equal => ScaleAction::Stay,
        };
        Self {
            current,
            target,
            action,
            reason: ScaleReason::Requested,
            metrics,
        }
    }

    #[must_use]
    pub fn requires_migration(&self) -> bool {
        self.target != self.current
    }
}

impl fmt::Display for ScaleDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action {
            ScaleAction::Stay => write!(f, "stay on {}", self.current)?,
            ScaleAction::Upgrade => write!(f, "upgrade {} -> {}", self.current, self.target)?,
            ScaleAction::Downgrade => {
                write!(f, "downgrade {} -> {}", self.current, self.target)?;
            }
        }
        write!(
            f,
            " ({}; {} documents, {} writers)",
            self.reason.as_str(),
            self.metrics.document_count,
            self.metrics.writer_count
        )
    }
}

/// Applies [`ScaleConfig`] thresholds to backend metrics.
#[derive(Debug, Clone, Default)]
pub struct ScaleMonitor {
    config: ScaleConfig,
}

impl ScaleMonitor {
    #[must_use]
    pub const fn new(config: ScaleConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &ScaleConfig {
        &self.config
    }

    /// Decide which tier the store should run on.
    #[must_use]
    pub fn decide(&self, current: BackendKind, metrics: BackendMetrics) -> ScaleDecision {
        let (ideal, reason) = self.ideal_tier(current, metrics);
        let decision = if ideal > current {
            ScaleDecision {
                current,
                target: ideal,
                action: ScaleAction::Upgrade,
                reason,
                metrics,
            }
        } else if ideal < current && self.config.allow_downgrade {
            ScaleDecision {
                current,
                target: ideal,
                action: ScaleAction::Downgrade,
                reason,
                metrics,
            }
        } else if ideal < current {
            ScaleDecision {
                reason: ScaleReason::DowngradeDisabled,
                ..ScaleDecision::stay(current, metrics)
            }
        } else {
            ScaleDecision::stay(current, metrics)
        };

        tracing::debug!(
            backend = %current,
            target = %decision.target,
            documents = metrics.document_count,
            writers = metrics.writer_count,
            "scale decision"
        );
        decision
    }

    fn ideal_tier(&self, current: BackendKind, m: BackendMetrics) -> (BackendKind, ScaleReason) {
        let c = &self.config;
        let docs = m.document_count;
        let busy = m.writer_count >= c.database_up_writers;

        match current {
            BackendKind::EmbeddedDatabase => {
                if busy || docs >= c.database_down_documents {
                    (current, ScaleReason::WithinBand)
                } else if docs >= c.hybrid_down_documents {
                    (BackendKind::IndexedHybrid, ScaleReason::DocumentCount)
                } else {
                    (BackendKind::FlatFile, ScaleReason::DocumentCount)
                }
            }
            BackendKind::FlatFile | BackendKind::IndexedHybrid => {
                if docs >= c.database_up_documents {
                    (BackendKind::EmbeddedDatabase, ScaleReason::DocumentCount)
                } else if busy {
                    (BackendKind::EmbeddedDatabase, ScaleReason::ConcurrentWriters)
                } else if docs >= c.hybrid_up_documents {
                    (BackendKind::IndexedHybrid, ScaleReason::DocumentCount)
                } else if current == BackendKind::IndexedHybrid && docs >= c.hybrid_down_documents
                {
                    (current, ScaleReason::WithinBand)
                } else if current == BackendKind::IndexedHybrid {
                    (BackendKind::FlatFile, ScaleReason::DocumentCount)
                } else {
                    (current, ScaleReason::WithinBand)
                }
            }
        }
    }
}
