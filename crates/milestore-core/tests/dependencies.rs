//! The dependency graph stays acyclic whatever order edges are proposed in.

use milestore_core::graph::DependencyGraph;
use milestore_core::graph::cycles::{detect_cycle_on_add, has_cycles};
use milestore_core::{ErrorCode, PhaseSpec, Store, WorkUnitId};
use proptest::prelude::*;
use std::collections::BTreeSet;
use tempfile::TempDir;

const NODES: usize = 6;

fn node(n: usize) -> WorkUnitId {
    WorkUnitId::parse(format!("n{n}")).expect("valid id")
}

fn store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::init(dir.path()).unwrap();
    for n in 0..NODES {
        store
            .create_work_unit_with_id(
                &node(n),
                "node",
                vec![PhaseSpec::new("only", 1.0)],
                BTreeSet::new(),
                "seed",
            )
            .unwrap();
    }
    (dir, store)
}

fn graph(store: &Store) -> DependencyGraph {
    DependencyGraph::from_documents(&store.list_documents().unwrap())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn proposed_edges_never_close_a_cycle(
        edges in prop::collection::vec((0..NODES, 0..NODES), 1..20)
    ) {
        let (_dir, store) = store();
        for (from, to) in edges {
            let before = graph(&store);
            let would_cycle = detect_cycle_on_add(&before, &node(from), &node(to)).is_some();
            match store.add_dependency(&node(from), &node(to), "planner") {
                Ok(_) => prop_assert!(!would_cycle, "accepted {from} -> {to}"),
                Err(err) if from == to => {
                    prop_assert_eq!(err.code(), ErrorCode::InvalidEvent);
                }
                Err(err) => {
                    prop_assert!(would_cycle, "rejected {from} -> {to}: {err}");
                    prop_assert_eq!(err.code(), ErrorCode::CycleDetected);
                    prop_assert_eq!(graph(&store), before);
                }
            }
            prop_assert!(!has_cycles(&graph(&store)));
        }

        // Dependents queries agree with the documents.
        let docs = store.list_documents().unwrap();
        for n in 0..NODES {
            let target = node(n);
            let expected: BTreeSet<_> = docs
                .iter()
                .filter(|d| d.dependencies.contains(&target))
                .map(|d| d.id.clone())
                .collect();
            let actual: BTreeSet<_> = store
                .query_by_dependency(&target)
                .unwrap()
                .into_iter()
                .map(|d| d.id)
                .collect();
            prop_assert_eq!(actual, expected);
        }
    }
}

#[test]
fn unknown_dependency_target_is_not_found() {
    let (_dir, store) = store();
    let err = store
        .add_dependency(&node(0), &WorkUnitId::parse("nowhere").unwrap(), "planner")
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::WorkUnitNotFound);
}

#[test]
fn cycle_error_names_the_path() {
    let (_dir, store) = store();
    store.add_dependency(&node(0), &node(1), "p").unwrap();
    store.add_dependency(&node(1), &node(2), "p").unwrap();
    let err = store.add_dependency(&node(2), &node(0), "p").unwrap_err();
    assert_eq!(err.code(), ErrorCode::CycleDetected);
    let text = err.to_string();
    for n in 0..3 {
        assert!(text.contains(&format!("n{n}")), "{text}");
    }
}

#[test]
fn ready_units_follow_completed_dependencies() {
    let (_dir, store) = store();
    store.add_dependency(&node(1), &node(0), "p").unwrap();
    let ready: Vec<WorkUnitId> = graph(&store).ready_units().into_iter().cloned().collect();
    assert!(ready.contains(&node(0)));
    assert!(!ready.contains(&node(1)));

    store
        .complete_phase(&node(0), "only", BTreeSet::new(), "w")
        .unwrap();
    let ready: Vec<WorkUnitId> = graph(&store).ready_units().into_iter().cloned().collect();
    assert!(ready.contains(&node(1)));
    assert!(!ready.contains(&node(0)));
}
