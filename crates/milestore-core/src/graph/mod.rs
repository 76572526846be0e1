//! Dependency graph across work units.
//!
//! Edges point from a unit to the units it depends on. The graph is kept
//! acyclic: [`cycles::detect_cycle_on_add`] runs before any
//! `dependency_added` event (or `created` event with initial dependencies)
//! is committed, and the state bridge checks merged dependency sets the
//! same way.
//!
//! ## Submodules
//!
//! - [`cycles`]: cycle detection for proposed edges and whole graphs.

pub mod cycles;

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Status, WorkUnit, WorkUnitId};

/// In-memory adjacency view of `depends_on` edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// unit → set of units it depends on.
    depends_on: BTreeMap<WorkUnitId, BTreeSet<WorkUnitId>>,
    /// unit → status, for readiness queries.
    status: BTreeMap<WorkUnitId, Status>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from projected documents. Archived units keep their
    /// edges: archiving never re-opens a cycle check.
    pub fn from_documents<'a>(docs: impl IntoIterator<Item = &'a WorkUnit>) -> Self {
        let mut graph = Self::new();
        for doc in docs {
            graph.status.insert(doc.id.clone(), doc.status);
            let entry = graph.depends_on.entry(doc.id.clone()).or_default();
            entry.extend(doc.dependencies.iter().cloned());
        }
        graph
    }

    /// Insert an edge `from → to` without checking for cycles.
    pub fn add_edge(&mut self, from: &WorkUnitId, to: &WorkUnitId) {
        self.depends_on
            .entry(from.clone())
            .or_default()
            .insert(to.clone());
        self.depends_on.entry(to.clone()).or_default();
    }

    /// Whether `id` is a known node.
    #[must_use]
    pub fn contains(&self, id: &WorkUnitId) -> bool {
        self.depends_on.contains_key(id)
    }

    /// Direct dependencies of `id`.
    pub fn dependencies_of(&self, id: &WorkUnitId) -> impl Iterator<Item = &WorkUnitId> {
        self.depends_on.get(id).into_iter().flatten()
    }

    /// Units that depend directly on `id`, ordered by id.
    #[must_use]
    pub fn dependents_of(&self, id: &WorkUnitId) -> Vec<&WorkUnitId> {
        self.depends_on
            .iter()
            .filter(|(_, deps)| deps.contains(id))
            .map(|(unit, _)| unit)
            .collect()
    }

    /// Units whose dependencies are all completed or archived, excluding
    /// units that are themselves completed or archived.
    #[must_use]
    pub fn ready_units(&self) -> Vec<&WorkUnitId> {
        let done = |id: &WorkUnitId| {
            matches!(
                self.status.get(id),
                Some(Status::Completed | Status::Archived)
            )
        };
        self.depends_on
            .iter()
            .filter(|(unit, _)| self.status.contains_key(*unit) && !done(unit))
            .filter(|(_, deps)| deps.iter().all(done))
            .map(|(unit, _)| unit)
            .collect()
    }

    pub fn all_ids(&self) -> impl Iterator<Item = &WorkUnitId> {
        self.depends_on.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.depends_on.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.depends_on.is_empty()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.depends_on.values().map(BTreeSet::len).sum()
    }
}
