//! Cycle detection for the dependency graph.
//!
//! # Design
//!
//! - **DFS-based**: depth-first search from the target of a proposed edge,
//!   looking for a path back to its source. That path plus the new edge is
//!   the cycle the edge would close.
//! - **Reject, don't warn**: unlike advisory link checks, a cycle here is a
//!   hard error. Callers turn a [`CycleWarning`] into
//!   [`StoreError::CycleDetected`](crate::StoreError::CycleDetected) or
//!   [`StoreError::IrreconcilableState`](crate::StoreError::IrreconcilableState).
//! - **O(V+E)**: each check visits every node and edge at most once.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::DependencyGraph;
use crate::model::WorkUnitId;

// ---------------------------------------------------------------------------
// CycleWarning
// ---------------------------------------------------------------------------

/// A cycle found in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleWarning {
    /// Units forming the loop; the first and last entries are the same unit.
    ///
    /// Adding `A → B` to `B → C → A` gives `["A", "B", "C", "A"]`.
    pub cycle_path: Vec<WorkUnitId>,

    /// The dependent side of the edge that closes the cycle.
    pub edge_from: WorkUnitId,

    /// The dependency side of the edge that closes the cycle.
    pub edge_to: WorkUnitId,
}

impl CycleWarning {
    /// Number of distinct units in the cycle.
    #[must_use]
    pub fn cycle_len(&self) -> usize {
        self.cycle_path.len().saturating_sub(1)
    }

    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.edge_from == self.edge_to
    }
}

impl fmt::Display for CycleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_self_loop() {
            return write!(f, "cycle: '{}' depends on itself", self.edge_from);
        }
        let path = self
            .cycle_path
            .iter()
            .map(WorkUnitId::as_str)
            .collect::<Vec<_>>()
            .join(" -> ");
        write!(f, "cycle ({} units): {path}", self.cycle_len())
    }
}

// ---------------------------------------------------------------------------
// Core detection
// ---------------------------------------------------------------------------

/// Detect whether adding `from → to` (`from` depends on `to`) would close a
/// cycle, i.e. whether `to` already reaches `from`.
#[must_use]
pub fn detect_cycle_on_add(
    graph: &DependencyGraph,
    from: &WorkUnitId,
    to: &WorkUnitId,
) -> Option<CycleWarning> {
    if from == to {
        return Some(CycleWarning {
            cycle_path: vec![from.clone(), from.clone()],
            edge_from: from.clone(),
            edge_to: to.clone(),
        });
    }

    let mut visited = BTreeSet::new();
    let mut parent_map = BTreeMap::new();

    if dfs_find_path(graph, to, from, &mut visited, &mut parent_map) {
        let mut path = vec![from.clone()];
        let mut chain = Vec::new();
        let mut current = from.clone();
        while &current != to {
            chain.push(current.clone());
            match parent_map.get(&current) {
                Some(parent) => current = (*parent).clone(),
                None => break,
            }
        }
        chain.push(to.clone());
        chain.reverse();
        path.extend(chain);

        Some(CycleWarning {
            cycle_path: path,
            edge_from: from.clone(),
            edge_to: to.clone(),
        })
    } else {
        None
    }
}

/// Check a batch of proposed edges, adding each to a scratch copy of the
/// graph before checking the next. Returns the first cycle found.
#[must_use]
pub fn detect_cycle_on_add_all<'a>(
    graph: &DependencyGraph,
    from: &WorkUnitId,
    targets: impl IntoIterator<Item = &'a WorkUnitId>,
) -> Option<CycleWarning> {
    let mut scratch = graph.clone();
    for to in targets {
        if let Some(warning) = detect_cycle_on_add(&scratch, from, to) {
            return Some(warning);
        }
        scratch.add_edge(from, to);
    }
    None
}

/// Find one cycle anywhere in the graph, if any exists.
#[must_use]
pub fn find_cycle(graph: &DependencyGraph) -> Option<CycleWarning> {
    let mut color: BTreeMap<&WorkUnitId, Color> =
        graph.all_ids().map(|id| (id, Color::White)).collect();
    let mut parent_map = BTreeMap::new();

    for node in graph.all_ids() {
        if color.get(node) == Some(&Color::White) {
            if let Some(warning) = dfs_find_back_edge(graph, node, &mut color, &mut parent_map) {
                return Some(warning);
            }
        }
    }
    None
}

/// Whether the graph contains any cycle.
#[must_use]
pub fn has_cycles(graph: &DependencyGraph) -> bool {
    find_cycle(graph).is_some()
}

// ---------------------------------------------------------------------------
// DFS internals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    /// On the DFS stack.
    Gray,
    Black,
}

fn dfs_find_path<'g>(
    graph: &'g DependencyGraph,
    current: &'g WorkUnitId,
    target: &WorkUnitId,
    visited: &mut BTreeSet<&'g WorkUnitId>,
    parent_map: &mut BTreeMap<&'g WorkUnitId, &'g WorkUnitId>,
) -> bool {
    if current == target {
        return true;
    }
    if !visited.insert(current) {
        return false;
    }

    for neighbor in graph.dependencies_of(current) {
        if !visited.contains(neighbor) {
            parent_map.insert(neighbor, current);
            if dfs_find_path(graph, neighbor, target, visited, parent_map) {
                return true;
            }
        }
    }
    false
}

fn dfs_find_back_edge<'g>(
    graph: &'g DependencyGraph,
    node: &'g WorkUnitId,
    color: &mut BTreeMap<&'g WorkUnitId, Color>,
    parent_map: &mut BTreeMap<&'g WorkUnitId, &'g WorkUnitId>,
) -> Option<CycleWarning> {
    color.insert(node, Color::Gray);

    for neighbor in graph.dependencies_of(node) {
        match color.get(neighbor).copied().unwrap_or(Color::White) {
            Color::White => {
                parent_map.insert(neighbor, node);
                if let Some(found) = dfs_find_back_edge(graph, neighbor, color, parent_map) {
                    return Some(found);
                }
            }
            Color::Gray => {
                // node → neighbor closes neighbor → ... → node.
                let mut cycle_path = vec![node.clone()];
                let mut cur = node;
                while cur != neighbor {
                    match parent_map.get(cur) {
                        Some(&parent) => {
                            cur = parent;
                            cycle_path.push(cur.clone());
                        }
                        None => break,
                    }
                }
                cycle_path.reverse();
                cycle_path.push(neighbor.clone());
                return Some(CycleWarning {
                    cycle_path,
                    edge_from: node.clone(),
                    edge_to: neighbor.clone(),
                });
            }
            Color::Black => {}
        }
    }

    color.insert(node, Color::Black);
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> WorkUnitId {
        WorkUnitId::parse(raw).unwrap()
    }

    fn build(edges: &[(&str, &[&str])]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (from, tos) in edges {
            for to in *tos {
                graph.add_edge(&id(from), &id(to));
            }
        }
        graph
    }

    #[test]
    fn self_loop_detected() {
        let graph = DependencyGraph::new();
        let warning = detect_cycle_on_add(&graph, &id("A"), &id("A")).unwrap();
        assert!(warning.is_self_loop());
        assert_eq!(warning.cycle_len(), 1);
        assert!(warning.to_string().contains("depends on itself"));
    }

    #[test]
    fn three_node_cycle_detected_with_path() {
        let graph = build(&[("B", &["C"]), ("C", &["A"])]);
        let warning = detect_cycle_on_add(&graph, &id("A"), &id("B")).unwrap();
        assert_eq!(
            warning.cycle_path,
            vec![id("A"), id("B"), id("C"), id("A")]
        );
        assert_eq!(warning.cycle_len(), 3);
        assert_eq!(warning.to_string(), "cycle (3 units): A -> B -> C -> A");
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let graph = build(&[("A", &["B", "C"]), ("B", &["D"]), ("C", &["D"])]);
        assert!(detect_cycle_on_add(&graph, &id("A"), &id("D")).is_none());
        assert!(!has_cycles(&graph));
    }

    #[test]
    fn batch_detects_cycle_through_earlier_proposed_edge() {
        let graph = build(&[("B", &["A"])]);
        assert!(detect_cycle_on_add_all(&graph, &id("C"), [&id("B")]).is_none());
        let warning = detect_cycle_on_add_all(&graph, &id("A"), [&id("C"), &id("B")]).unwrap();
        assert_eq!(warning.edge_to, id("B"));
    }

    #[test]
    fn find_cycle_reports_existing_loop() {
        let graph = build(&[("A", &["B"]), ("B", &["C"]), ("C", &["A"])]);
        let warning = find_cycle(&graph).unwrap();
        assert_eq!(warning.cycle_len(), 3);
        assert_eq!(warning.cycle_path.first(), warning.cycle_path.last());
    }

    #[test]
    fn long_chain_without_cycle() {
        let mut graph = DependencyGraph::new();
        let ids: Vec<_> = (0..500).map(|i| id(&format!("u{i}"))).collect();
        for pair in ids.windows(2) {
            graph.add_edge(&pair[0], &pair[1]);
        }
        assert!(!has_cycles(&graph));
        assert!(detect_cycle_on_add(&graph, &ids[499], &ids[0]).is_some());
        assert!(detect_cycle_on_add(&graph, &ids[0], &ids[499]).is_none());
    }
}
