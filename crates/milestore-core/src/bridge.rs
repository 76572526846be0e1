//! Planning/execution reconciliation.
//!
//! A planning process and an execution process each maintain their own view
//! of a work unit. When planning hands over to execution, both views are
//! submitted; once both are present the bridge merges them exactly once and
//! appends the result as a `reconciled` event, which becomes the baseline
//! every later event builds on.
//!
//! # Merge Semantics
//!
//! - **status**: execution's value wins once execution has started;
//!   planning never moves status backward. The result is then checked
//!   against the merged phases (see [`crate::progress::reconcile_status`]).
//! - **phases**: union by name, planning order first. A phase on both sides
//!   takes execution's status, completion and deliverables and planning's
//!   weight. Merged weights must still sum to 1.0.
//! - **dependencies**: union of both sides, then checked against the whole
//!   store graph. A cycle fails the merge; no edge is ever dropped.
//! - **title**: planning's. **blockers**: execution's.
//!
//! Before committing, the merge is settled against the unit's logged state
//! ([`settle_against_log`]): committed edges, open blockers and deliverables
//! are kept, and a phase the views show behind its logged progress makes
//! the views irreconcilable. The committed status is derived from the
//! settled phases, so it never moves backward.
//!
//! Failures are [`StoreError::IrreconcilableState`] and are never resolved
//! by guessing: the views stay on disk until a corrected one is submitted.
//!
//! Pending views live in `<root>/views/<id>/{planning,execution}.json`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{IoContext, StoreError};
use crate::event::{Committed, EventLog, EventPayload, Expected, ReconciledData};
use crate::graph::DependencyGraph;
use crate::graph::cycles::detect_cycle_on_add_all;
use crate::lock::StoreLock;
use crate::model::{Phase, WorkUnit, WorkUnitId, validate_phase_specs};
use crate::progress;

pub const VIEWS_DIR: &str = "views";

const SUBMIT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Which collaborator produced a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewKind {
    Planning,
    Execution,
}

impl ViewKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Execution => "execution",
        }
    }

    const fn other(self) -> Self {
        match self {
            Self::Planning => Self::Execution,
            Self::Execution => Self::Planning,
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of submitting one view.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Stored; the other view has not arrived yet.
    Pending { waiting_for: ViewKind },
    /// Both views were present and the merge was committed.
    Reconciled(Committed),
}

fn irreconcilable(id: &WorkUnitId, reason: impl Into<String>) -> StoreError {
    StoreError::IrreconcilableState {
        work_unit: id.clone(),
        reason: reason.into(),
    }
}

/// Merge two views of one work unit into the canonical document.
///
/// The result keeps the execution view's `last_sequence`, which is the
/// token the reconciliation is committed against.
///
/// # Errors
///
/// [`StoreError::IrreconcilableState`] when the views name different
/// units, either side is already reconciled, the merged weights do not
/// sum to 1.0, or the unit would depend on itself.
pub fn merge(planning: &WorkUnit, execution: &WorkUnit) -> Result<WorkUnit, StoreError> {
    let id = &execution.id;
    if planning.id != execution.id {
        return Err(irreconcilable(
            id,
            format!("planning view is for {}", planning.id),
        ));
    }
    if planning.reconciled || execution.reconciled {
        return Err(irreconcilable(id, "work unit was already reconciled"));
    }

    let mut phases: Vec<Phase> = Vec::with_capacity(planning.phases.len());
    for planned in &planning.phases {
        let merged = match execution.phase(&planned.name) {
            Some(executed) => Phase {
                weight: planned.weight,
                ..executed.clone()
            },
            None => planned.clone(),
        };
        phases.push(merged);
    }
    for executed in &execution.phases {
        if planning.phase(&executed.name).is_none() {
            phases.push(executed.clone());
        }
    }
    validate_phase_specs(phases.iter().map(|p| (p.name.as_str(), p.weight)))
        .map_err(|reason| irreconcilable(id, format!("merged phases: {reason}")))?;

    let dependencies = planning
        .dependencies
        .union(&execution.dependencies)
        .cloned()
        .collect::<BTreeSet<_>>();
    if dependencies.contains(id) {
        return Err(irreconcilable(id, "merged dependencies include the unit itself"));
    }

    let mut merged = WorkUnit {
        id: id.clone(),
        title: planning.title.clone(),
        status: execution.status,
        created_at: execution.created_at.min(planning.created_at),
        updated_at: execution.updated_at.max(planning.updated_at),
        progress_percent: progress::compute_percent(&phases),
        phases,
        dependencies,
        blockers: execution.blockers.clone(),
        last_sequence: execution.last_sequence,
        reconciled: true,
    };
    let execution_wins =
        execution.execution_started() || execution.status.rank() >= planning.status.rank();
    let proposed = if execution_wins {
        execution.status
    } else {
        planning.status
    };
    merged.status = progress::reconcile_status(proposed, &merged);
    Ok(merged)
}

/// Fold the unit's logged state into a merged document.
///
/// # Errors
///
/// [`StoreError::IrreconcilableState`] when the merge drops a logged phase
/// or shows one behind its logged status or completion.
pub fn settle_against_log(
    stored: &WorkUnit,
    mut merged: WorkUnit,
) -> Result<WorkUnit, StoreError> {
    let id = &stored.id;
    for logged in &stored.phases {
        let Some(phase) = merged.phase_mut(&logged.name) else {
            return Err(irreconcilable(
                id,
                format!("views drop logged phase '{}'", logged.name),
            ));
        };
        if phase.falls_behind(logged) {
            return Err(irreconcilable(
                id,
                format!(
                    "views show phase '{}' as {} ({:.2}) but the log has {} ({:.2})",
                    phase.name, phase.status, phase.completion, logged.status, logged.completion
                ),
            ));
        }
        phase.deliverables.extend(logged.deliverables.iter().cloned());
    }
    merged.dependencies.extend(stored.dependencies.iter().cloned());
    for (blocker, reason) in &stored.blockers {
        merged
            .blockers
            .entry(blocker.clone())
            .or_insert_with(|| reason.clone());
    }
    merged.progress_percent = progress::compute_percent(&merged.phases);
    merged.status = progress::reconcile_status(merged.status, &merged);
    Ok(merged)
}

/// Reject a merged document whose dependency union closes a cycle in the
/// store graph.
///
/// # Errors
///
/// [`StoreError::IrreconcilableState`] naming the cycle.
pub fn check_acyclic(graph: &DependencyGraph, merged: &WorkUnit) -> Result<(), StoreError> {
    let existing: BTreeSet<&WorkUnitId> = graph.dependencies_of(&merged.id).collect();
    let added = merged.dependencies.iter().filter(|d| !existing.contains(d));
    match detect_cycle_on_add_all(graph, &merged.id, added) {
        Some(cycle) => Err(irreconcilable(&merged.id, format!("dependency {cycle}"))),
        None => Ok(()),
    }
}

/// Stores pending views and runs the merge once both are in.
#[derive(Debug, Clone)]
pub struct StateBridge {
    log: EventLog,
    dir: PathBuf,
}

impl StateBridge {
    #[must_use]
    pub fn new(log: EventLog) -> Self {
        let dir = log.router().root().join(VIEWS_DIR);
        Self { log, dir }
    }

    fn unit_dir(&self, id: &WorkUnitId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    fn view_path(&self, id: &WorkUnitId, kind: ViewKind) -> PathBuf {
        self.unit_dir(id).join(format!("{kind}.json"))
    }

    /// The pending view of `kind`, if one was submitted.
    ///
    /// # Errors
    ///
    /// I/O failures or an unparsable view file.
    pub fn pending_view(
        &self,
        id: &WorkUnitId,
        kind: ViewKind,
    ) -> Result<Option<WorkUnit>, StoreError> {
        read_view(&self.view_path(id, kind))
    }

    /// # Errors
    ///
    /// See [`StateBridge::submit`].
    pub fn submit_planning_view(
        &self,
        view: &WorkUnit,
        writer: &str,
    ) -> Result<SubmitOutcome, StoreError> {
        self.submit(ViewKind::Planning, view, writer)
    }

    /// # Errors
    ///
    /// See [`StateBridge::submit`].
    pub fn submit_execution_view(
        &self,
        view: &WorkUnit,
        writer: &str,
    ) -> Result<SubmitOutcome, StoreError> {
        self.submit(ViewKind::Execution, view, writer)
    }

    /// Store `view`, replacing an earlier one of the same kind, and
    /// reconcile if the other view is already present.
    ///
    /// On [`StoreError::Conflict`] the stale execution view is dropped so a
    /// fresh one can be submitted; the planning view is kept.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] for a unit that was never created
    /// - [`StoreError::IrreconcilableState`] when the merge is impossible
    /// - [`StoreError::Conflict`] when the unit moved past the execution view
    /// - lease and storage failures
    pub fn submit(
        &self,
        kind: ViewKind,
        view: &WorkUnit,
        writer: &str,
    ) -> Result<SubmitOutcome, StoreError> {
        let id = &view.id;
        let active = self.log.router().active();
        let current = active.get_document(id)?.ok_or_else(|| StoreError::NotFound {
            work_unit: id.clone(),
            backend: active.kind(),
        })?;
        if current.reconciled {
            return Err(irreconcilable(id, "work unit was already reconciled"));
        }

        let unit_dir = self.unit_dir(id);
        fs::create_dir_all(&unit_dir).at(&unit_dir)?;
        let _lock = StoreLock::acquire(&unit_dir.join("submit.lock"), SUBMIT_LOCK_TIMEOUT)?;
        write_view(&self.view_path(id, kind), view)?;
        tracing::info!(work_unit = %id, view = %kind, writer = %writer, "view submitted");

        let Some(other) = self.pending_view(id, kind.other())? else {
            return Ok(SubmitOutcome::Pending {
                waiting_for: kind.other(),
            });
        };
        let (planning, execution) = match kind {
            ViewKind::Planning => (view, &other),
            ViewKind::Execution => (&other, view),
        };

        match self.reconcile(planning, execution, writer) {
            Ok(committed) => {
                remove_dir(&unit_dir)?;
                Ok(SubmitOutcome::Reconciled(committed))
            }
            Err(err @ StoreError::Conflict { .. }) => {
                remove_file(&self.view_path(id, ViewKind::Execution))?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn reconcile(
        &self,
        planning: &WorkUnit,
        execution: &WorkUnit,
        writer: &str,
    ) -> Result<Committed, StoreError> {
        let merged = merge(planning, execution)?;
        let docs = self.log.router().active().list_documents()?;
        let stored = docs
            .iter()
            .find(|d| d.id == merged.id)
            .ok_or_else(|| StoreError::NotFound {
                work_unit: merged.id.clone(),
                backend: self.log.router().active().kind(),
            })?;
        // A stale execution view is left to the commit, which reports it
        // as a conflict.
        let merged = if stored.last_sequence == execution.last_sequence {
            settle_against_log(stored, merged)?
        } else {
            merged
        };
        let graph = DependencyGraph::from_documents(&docs);
        check_acyclic(&graph, &merged)?;

        let payload = EventPayload::Reconciled(ReconciledData {
            title: merged.title.clone(),
            phases: merged.phases.clone(),
            dependencies: merged.dependencies.clone(),
            blockers: merged.blockers.clone(),
        });
        let committed = self
            .log
            .commit(
                &merged.id,
                vec![payload],
                writer,
                Expected::Sequence(execution.last_sequence),
            )
            .map_err(|err| match err {
                StoreError::CycleDetected { work_unit, cycle } => StoreError::IrreconcilableState {
                    work_unit,
                    reason: format!("dependency {cycle}"),
                },
                other => other,
            })?;
        tracing::info!(
            work_unit = %merged.id,
            sequence = committed.document.last_sequence,
            phases = committed.document.phases.len(),
            "views reconciled"
        );
        Ok(committed)
    }
}

fn read_view(path: &Path) -> Result<Option<WorkUnit>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: err.to_string(),
            }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

fn write_view(path: &Path, view: &WorkUnit) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(view)?).at(&tmp)?;
    fs::rename(&tmp, path).at(path)
}

fn remove_file(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

fn remove_dir(path: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PhaseStatus, Status};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn uid(raw: &str) -> WorkUnitId {
        WorkUnitId::parse(raw).unwrap()
    }

    fn phase(name: &str, weight: f64, status: PhaseStatus) -> Phase {
        Phase {
            name: name.into(),
            weight,
            status,
            completion: if status == PhaseStatus::Completed { 1.0 } else { 0.0 },
            deliverables: BTreeSet::new(),
        }
    }

    fn view(phases: Vec<Phase>, deps: &[&str]) -> WorkUnit {
        let now = Utc::now();
        let mut doc = WorkUnit {
            id: uid("M1"),
            title: "t".into(),
            status: Status::Planned,
            created_at: now,
            updated_at: now,
            phases,
            progress_percent: 0,
            dependencies: deps.iter().map(|d| uid(d)).collect(),
            blockers: BTreeMap::new(),
            last_sequence: 0,
            reconciled: false,
        };
        doc.progress_percent = progress::compute_percent(&doc.phases);
        doc.status = progress::derive_status(&doc);
        doc
    }

    #[test]
    fn phases_union_with_planning_weights() {
        let planning = view(
            vec![
                phase("design", 0.2, PhaseStatus::Pending),
                phase("execute", 0.5, PhaseStatus::Pending),
                phase("review", 0.3, PhaseStatus::Pending),
            ],
            &["A"],
        );
        let mut execution = view(
            vec![
                phase("design", 0.3, PhaseStatus::Completed),
                phase("execute", 0.7, PhaseStatus::Active),
            ],
            &["B"],
        );
        execution.phases[0].deliverables.insert("docs/design.md".into());
        execution.last_sequence = 4;
        execution.status = Status::Active;

        let merged = merge(&planning, &execution).unwrap();
        let names: Vec<_> = merged.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["design", "execute", "review"]);
        assert!((merged.phases[0].weight - 0.2).abs() < f64::EPSILON);
        assert_eq!(merged.phases[0].status, PhaseStatus::Completed);
        assert!(merged.phases[0].deliverables.contains("docs/design.md"));
        assert_eq!(merged.dependencies.len(), 2);
        assert_eq!(merged.status, Status::Active);
        assert_eq!(merged.progress_percent, 20);
        assert_eq!(merged.last_sequence, 4);
        assert!(merged.reconciled);
    }

    #[test]
    fn planning_cannot_regress_started_execution() {
        let planning = view(vec![phase("only", 1.0, PhaseStatus::Pending)], &[]);
        let mut execution = view(vec![phase("only", 1.0, PhaseStatus::Active)], &[]);
        execution.status = Status::Active;
        assert_eq!(merge(&planning, &execution).unwrap().status, Status::Active);
    }

    #[test]
    fn bad_weights_and_second_merge_are_irreconcilable() {
        let planning = view(
            vec![phase("a", 0.5, PhaseStatus::Pending), phase("b", 0.5, PhaseStatus::Pending)],
            &[],
        );
        let execution = view(
            vec![phase("a", 0.5, PhaseStatus::Pending), phase("c", 0.5, PhaseStatus::Pending)],
            &[],
        );
        let err = merge(&planning, &execution).unwrap_err();
        assert!(matches!(err, StoreError::IrreconcilableState { .. }));

        let mut done = view(vec![phase("a", 1.0, PhaseStatus::Pending)], &[]);
        done.reconciled = true;
        let err = merge(&done, &done.clone()).unwrap_err();
        assert!(err.to_string().contains("already reconciled"));
    }

    #[test]
    fn cycle_through_store_graph_is_irreconcilable() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&uid("A"), &uid("M1"));
        let merged = view(vec![phase("only", 1.0, PhaseStatus::Pending)], &["A"]);
        let err = check_acyclic(&graph, &merged).unwrap_err();
        assert!(matches!(err, StoreError::IrreconcilableState { .. }));

        let unrelated = view(vec![phase("only", 1.0, PhaseStatus::Pending)], &["B"]);
        assert!(check_acyclic(&graph, &unrelated).is_ok());
    }

    #[test]
    fn settling_restores_what_the_log_committed() {
        let mut stored = view(
            vec![
                phase("design", 0.4, PhaseStatus::Completed),
                phase("build", 0.6, PhaseStatus::Active),
            ],
            &["A"],
        );
        stored.phases[0].deliverables.insert("spec.md".into());
        stored.blockers.insert("B1".into(), "review".into());

        let merged = view(
            vec![
                phase("design", 0.4, PhaseStatus::Completed),
                phase("build", 0.6, PhaseStatus::Active),
            ],
            &["C"],
        );
        let settled = settle_against_log(&stored, merged).unwrap();
        assert_eq!(settled.dependencies, BTreeSet::from([uid("A"), uid("C")]));
        assert_eq!(settled.blockers.get("B1").map(String::as_str), Some("review"));
        assert!(settled.phases[0].deliverables.contains("spec.md"));
        assert_eq!(settled.status, Status::Blocked);
        assert_eq!(settled.progress_percent, 40);

        let behind = view(
            vec![
                phase("design", 0.4, PhaseStatus::Active),
                phase("build", 0.6, PhaseStatus::Active),
            ],
            &[],
        );
        let err = settle_against_log(&stored, behind).unwrap_err();
        assert!(matches!(err, StoreError::IrreconcilableState { .. }));

        let dropped = view(vec![phase("design", 1.0, PhaseStatus::Completed)], &[]);
        assert!(settle_against_log(&stored, dropped).is_err());
    }
}
