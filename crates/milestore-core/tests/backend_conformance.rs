//! Every backend answers the same calls with the same results.
//!
//! The same event histories are committed to a flat-file, an indexed-hybrid
//! and an embedded-database backend; documents, queries, paged reads and
//! contiguity checks must agree across all three.

use chrono::DateTime;
use milestore_core::backend::{BackendKind, BackendOptions, StorageBackend, open_backend};
use milestore_core::event::{
    BlockerRaisedData, BlockerResolvedData, CreatedData, DependencyData, PhaseCompletedData,
    PhaseStartedData,
};
use milestore_core::migrate::{conformance_digests, diff_digests};
use milestore_core::projection;
use milestore_core::{Event, EventPayload, PhaseSpec, Status, StoreError, WorkUnit, WorkUnitId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

const KINDS: [BackendKind; 3] = [
    BackendKind::FlatFile,
    BackendKind::IndexedHybrid,
    BackendKind::EmbeddedDatabase,
];

fn id(raw: &str) -> WorkUnitId {
    WorkUnitId::parse(raw).expect("valid id")
}

fn event(unit: &WorkUnitId, sequence: u64, payload: EventPayload) -> Event {
    Event {
        sequence,
        timestamp: DateTime::from_timestamp(1_700_000_000 + i64::try_from(sequence).unwrap(), 0)
            .unwrap(),
        work_unit_id: unit.clone(),
        kind: payload.kind(),
        payload,
        writer_id: "conformance".into(),
    }
}

fn created(title: &str, deps: &[&WorkUnitId]) -> EventPayload {
    EventPayload::Created(CreatedData {
        title: title.into(),
        phases: vec![PhaseSpec::new("design", 0.25), PhaseSpec::new("build", 0.75)],
        dependencies: deps.iter().map(|d| (*d).clone()).collect(),
    })
}

fn started(phase: &str) -> EventPayload {
    EventPayload::PhaseStarted(PhaseStartedData {
        phase: phase.into(),
    })
}

fn completed(phase: &str) -> EventPayload {
    EventPayload::PhaseCompleted(PhaseCompletedData {
        phase: phase.into(),
        deliverables: BTreeSet::new(),
    })
}

/// Commit `payloads` one at a time, projecting as the event log would.
fn commit_all(
    backend: &dyn StorageBackend,
    unit: &WorkUnitId,
    payloads: Vec<EventPayload>,
) -> WorkUnit {
    let mut doc: Option<WorkUnit> = backend.get_document(unit).unwrap();
    let mut next = backend.last_sequence(unit).unwrap().map_or(0, |s| s + 1);
    for payload in payloads {
        let ev = event(unit, next, payload);
        let projected = projection::apply(doc, &ev).unwrap();
        backend.commit(std::slice::from_ref(&ev), &projected).unwrap();
        doc = Some(projected);
        next += 1;
    }
    doc.unwrap()
}

/// Three units: `alpha` planned, `beta` active and depending on `alpha`,
/// `gamma` completed, blocked history included.
fn seed(backend: &dyn StorageBackend) {
    let (a, b, c) = (id("alpha"), id("beta"), id("gamma"));
    commit_all(backend, &a, vec![created("Alpha", &[])]);
    commit_all(backend, &b, vec![created("Beta", &[&a]), started("design")]);
    commit_all(
        backend,
        &c,
        vec![
            created("Gamma", &[]),
            started("design"),
            EventPayload::BlockerRaised(BlockerRaisedData {
                blocker: "infra".into(),
                reason: "cluster down".into(),
            }),
            EventPayload::BlockerResolved(BlockerResolvedData {
                blocker: "infra".into(),
            }),
            completed("design"),
            completed("build"),
        ],
    );
}

fn open(kind: BackendKind) -> (TempDir, Arc<dyn StorageBackend>) {
    let dir = TempDir::new().unwrap();
    let backend = open_backend(kind, &dir.path().join(kind.as_str()), BackendOptions::default())
        .unwrap();
    (dir, backend)
}

#[test]
fn documents_and_queries_agree() {
    for kind in KINDS {
        let (_dir, backend) = open(kind);
        seed(&*backend);

        let ids: Vec<String> = backend
            .list_ids()
            .unwrap()
            .iter()
            .map(|i| i.as_str().to_string())
            .collect();
        assert_eq!(ids, ["alpha", "beta", "gamma"], "{kind}");

        let gamma = backend.get_document(&id("gamma")).unwrap().unwrap();
        assert_eq!(gamma.status, Status::Completed, "{kind}");
        assert_eq!(gamma.progress_percent, 100, "{kind}");
        assert_eq!(gamma.last_sequence, 5, "{kind}");
        assert!(gamma.blockers.is_empty(), "{kind}");

        let active: Vec<_> = backend
            .query_by_status(Status::Active)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(active, vec![id("beta")], "{kind}");

        let dependents = backend.query_by_dependency(&id("alpha")).unwrap();
        assert_eq!(dependents.len(), 1, "{kind}");
        assert_eq!(dependents[0].id, id("beta"), "{kind}");

        assert!(backend.get_document(&id("missing")).unwrap().is_none(), "{kind}");
        assert_eq!(backend.last_sequence(&id("missing")).unwrap(), None, "{kind}");
    }
}

#[test]
fn paged_reads_return_gapless_sequences() {
    for kind in KINDS {
        let (_dir, backend) = open(kind);
        seed(&*backend);
        let gamma = id("gamma");

        let first = backend.read_events(&gamma, 0, 4).unwrap();
        let rest = backend.read_events(&gamma, 4, 4).unwrap();
        assert_eq!(first.len(), 4, "{kind}");
        assert_eq!(rest.len(), 2, "{kind}");
        let seqs: Vec<u64> = first.iter().chain(&rest).map(|e| e.sequence).collect();
        assert_eq!(seqs, (0..6).collect::<Vec<_>>(), "{kind}");

        assert!(backend.read_events(&gamma, 6, 4).unwrap().is_empty(), "{kind}");
        assert_eq!(backend.read_all_events(&gamma, 2, 1).unwrap().len(), 4, "{kind}");
    }
}

#[test]
fn non_contiguous_commit_is_rejected_without_side_effects() {
    for kind in KINDS {
        let (_dir, backend) = open(kind);
        seed(&*backend);
        let alpha = id("alpha");
        let before = backend.get_document(&alpha).unwrap().unwrap();

        let next = event(&alpha, 1, started("design"));
        let projected = projection::apply(Some(before.clone()), &next).unwrap();
        let gap = Event {
            sequence: 5,
            ..next
        };
        let err = backend.commit(&[gap], &projected).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }), "{kind}: {err}");

        assert_eq!(backend.get_document(&alpha).unwrap().unwrap(), before, "{kind}");
        assert_eq!(backend.last_sequence(&alpha).unwrap(), Some(0), "{kind}");
    }
}

#[test]
fn purge_removes_unit_everywhere() {
    for kind in KINDS {
        let (_dir, backend) = open(kind);
        seed(&*backend);
        assert!(backend.purge(&id("gamma")).unwrap(), "{kind}");
        assert!(!backend.purge(&id("gamma")).unwrap(), "{kind}");
        assert!(backend.get_document(&id("gamma")).unwrap().is_none(), "{kind}");
        assert!(backend.read_events(&id("gamma"), 0, 10).unwrap().is_empty(), "{kind}");
        assert_eq!(backend.list_ids().unwrap().len(), 2, "{kind}");
    }
}

#[test]
fn appended_dependency_is_queryable() {
    for kind in KINDS {
        let (_dir, backend) = open(kind);
        seed(&*backend);
        let doc = commit_all(
            &*backend,
            &id("gamma"),
            vec![EventPayload::DependencyAdded(DependencyData {
                depends_on: id("alpha"),
            })],
        );
        assert!(doc.dependencies.contains(&id("alpha")), "{kind}");
        assert_eq!(backend.query_by_dependency(&id("alpha")).unwrap().len(), 2, "{kind}");
    }
}

#[test]
fn query_digests_match_across_backends() {
    let mut digests = Vec::new();
    let mut dirs = Vec::new();
    for kind in KINDS {
        let (dir, backend) = open(kind);
        seed(&*backend);
        digests.push(conformance_digests(&*backend).unwrap());
        dirs.push(dir);
    }
    for other in &digests[1..] {
        assert!(diff_digests(&digests[0], other).is_empty());
    }
}

#[test]
fn metrics_count_documents() {
    for kind in KINDS {
        let (_dir, backend) = open(kind);
        seed(&*backend);
        let metrics = backend.metrics().unwrap();
        assert_eq!(metrics.document_count, 3, "{kind}");
    }
}
