//! Online migration between backends while writers keep appending.

use milestore_core::config::StoreConfig;
use milestore_core::migrate::{MigrationStage, conformance_digests, diff_digests};
use milestore_core::monitor::ScaleDecision;
use milestore_core::{
    BackendKind, ErrorCode, EventPayload, PhaseSpec, Store, StoreError, WorkUnitId,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const UNITS: usize = 30;
const WRITERS: usize = 5;
const APPENDS_PER_WRITER: usize = 12;

fn unit(n: usize) -> WorkUnitId {
    WorkUnitId::parse(format!("unit-{n:03}")).expect("valid id")
}

fn phases() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec::new("design", 0.2),
        PhaseSpec::new("build", 0.5),
        PhaseSpec::new("verify", 0.3),
    ]
}

fn seeded(config: StoreConfig) -> (TempDir, Store) {
    let dir = TempDir::new().expect("tempdir");
    Store::init(dir.path()).expect("init");
    let store = Store::open_with(dir.path(), config).expect("open");
    for n in 0..UNITS {
        store
            .create_work_unit_with_id(
                &unit(n),
                &format!("Unit {n}"),
                phases(),
                BTreeSet::new(),
                "seed",
            )
            .expect("create");
        if n % 3 == 0 {
            store.start_phase(&unit(n), "design", "seed").expect("start");
        }
    }
    (dir, store)
}

fn reports(store: &Store, id: &WorkUnitId) -> usize {
    store
        .read_from(id, 0)
        .unwrap()
        .map(Result::unwrap)
        .filter(|e| matches!(&e.payload, EventPayload::ProgressUpdated(p) if p.phase.is_some()))
        .count()
}

fn spawn_writers(root: &Path) -> Vec<thread::JoinHandle<()>> {
    (0..WRITERS)
        .map(|w| {
            let root = root.to_path_buf();
            thread::spawn(move || {
                let store = Store::open(&root).unwrap();
                for i in 0..APPENDS_PER_WRITER {
                    // Each writer owns every WRITERS-th unit.
                    let target = unit((w + i * WRITERS) % UNITS);
                    let fraction = 0.05 * (i + 1) as f64;
                    store
                        .report_progress(&target, "build", fraction, &format!("writer-{w}"))
                        .unwrap();
                }
            })
        })
        .collect()
}

#[test]
fn flat_to_hybrid_under_concurrent_writes_loses_nothing() {
    let (dir, store) = seeded(StoreConfig::default());
    let before = conformance_digests(&*store.router().active()).unwrap();

    let writers = spawn_writers(dir.path());
    let report = store
        .migrate_to(BackendKind::IndexedHybrid)
        .unwrap()
        .expect("a migration ran");
    for w in writers {
        w.join().unwrap();
    }

    assert_eq!(report.from, BackendKind::FlatFile);
    assert_eq!(report.to, BackendKind::IndexedHybrid);
    assert_eq!(report.units, UNITS);
    assert!(report.verified_queries > 0);
    assert_eq!(store.backend_kind().unwrap(), BackendKind::IndexedHybrid);

    let total: usize = (0..UNITS).map(|n| reports(&store, &unit(n))).sum();
    assert_eq!(total, WRITERS * APPENDS_PER_WRITER);

    for n in 0..UNITS {
        let id = unit(n);
        let replayed = store.log().replay(&id).unwrap().unwrap();
        assert_eq!(replayed, store.require_document(&id).unwrap(), "{id}");
    }

    // Writes after cutover go to the new backend only.
    let manifest = store.router().manifest();
    assert!(manifest.mirror.is_none());
    assert_eq!(manifest.retired.len(), 1);
    assert_eq!(manifest.retired[0].backend, report.retired);
    let after = conformance_digests(&*store.router().active()).unwrap();
    assert!(diff_digests(&before, &after).contains("status:active"));
}

#[test]
fn reads_answer_identically_before_and_after_migration() {
    let (_dir, store) = seeded(StoreConfig::default());
    let before = conformance_digests(&*store.router().active()).unwrap();
    store.migrate_to(BackendKind::EmbeddedDatabase).unwrap().unwrap();
    let after = conformance_digests(&*store.router().active()).unwrap();
    assert!(diff_digests(&before, &after).is_empty());

    store.migrate_to(BackendKind::FlatFile).unwrap().unwrap();
    let back = conformance_digests(&*store.router().active()).unwrap();
    assert!(diff_digests(&before, &back).is_empty());
    assert_eq!(store.router().manifest().retired.len(), 2);
}

#[test]
fn cancelled_migration_keeps_source_authoritative() {
    let (dir, store) = seeded(StoreConfig::default());
    let engine = store.migration_engine();
    engine.cancel_flag().store(true, Ordering::SeqCst);

    let decision = ScaleDecision::forced(
        BackendKind::FlatFile,
        BackendKind::IndexedHybrid,
        store.metrics().unwrap(),
    );
    let err = engine.migrate(&decision).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MigrationCancelled);

    let manifest = store.router().manifest();
    assert_eq!(manifest.active.kind, BackendKind::FlatFile);
    assert!(manifest.mirror.is_none());
    let backends: Vec<_> = std::fs::read_dir(dir.path().join("backends"))
        .unwrap()
        .collect();
    assert_eq!(backends.len(), 1);

    store.start_phase(&unit(1), "design", "after-cancel").unwrap();
    assert!(store.migrate_to(BackendKind::IndexedHybrid).unwrap().is_some());
}

#[test]
fn held_lease_makes_catch_up_time_out_and_roll_back() {
    let mut config = StoreConfig::default();
    config.migration.catch_up_timeout_ms = 300;
    config.lease.acquire_timeout_ms = 50;
    let (_dir, store) = seeded(config);

    let blocker = store.log().lease(&unit(7), "long-running-worker").unwrap();
    let err = store.migrate_to(BackendKind::EmbeddedDatabase).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CatchUpTimeout);
    assert!(err.is_retryable());

    let manifest = store.router().manifest();
    assert_eq!(manifest.active.kind, BackendKind::FlatFile);
    assert!(manifest.mirror.is_none());

    drop(blocker);
    let report = store.migrate_to(BackendKind::EmbeddedDatabase).unwrap().unwrap();
    assert_eq!(report.units, UNITS);
}

#[test]
fn divergent_target_fails_verification_and_rolls_back() {
    let (dir, store) = seeded(StoreConfig::default());
    let victim = unit(4);
    let events_before: Vec<usize> = (0..UNITS)
        .map(|n| store.read_from(&unit(n), 0).unwrap().count())
        .collect();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let router = Arc::clone(store.router());
    let engine = store.migration_engine().with_stage_observer({
        let seen = Arc::clone(&seen);
        let victim = victim.clone();
        Arc::new(move |stage| {
            seen.lock().unwrap().push(stage);
            if stage == MigrationStage::Verify {
                // The new backend is active now; edit it behind the log.
                let target = router.active();
                let mut doc = target.get_document(&victim).unwrap().unwrap();
                doc.title = "edited outside the event log".into();
                target.put_document(&doc).unwrap();
            }
        })
    });

    let decision = ScaleDecision::forced(
        BackendKind::FlatFile,
        BackendKind::IndexedHybrid,
        store.metrics().unwrap(),
    );
    let err = engine.migrate(&decision).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MigrationVerificationFailed);
    match &err {
        StoreError::MigrationVerificationFailed { divergences, .. } => {
            assert!(divergences.contains(&format!("document:{victim}")), "{divergences:?}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        *seen.lock().unwrap(),
        [
            MigrationStage::Snapshot,
            MigrationStage::BulkLoad,
            MigrationStage::DualWrite,
            MigrationStage::Cutover,
            MigrationStage::Verify,
        ]
    );

    // The source is authoritative again and the target is gone.
    let manifest = store.router().manifest();
    assert_eq!(manifest.active.kind, BackendKind::FlatFile);
    assert!(manifest.mirror.is_none());
    assert!(manifest.retired.is_empty());
    let backends = std::fs::read_dir(dir.path().join("backends")).unwrap().count();
    assert_eq!(backends, 1);

    let events_after: Vec<usize> = (0..UNITS)
        .map(|n| store.read_from(&unit(n), 0).unwrap().count())
        .collect();
    assert_eq!(events_after, events_before);
    assert_eq!(store.require_document(&victim).unwrap().title, "Unit 4");
    for n in 0..UNITS {
        let id = unit(n);
        assert_eq!(
            store.log().replay(&id).unwrap().unwrap(),
            store.require_document(&id).unwrap()
        );
    }

    store.start_phase(&victim, "design", "after-rollback").unwrap();
    assert!(store.migrate_to(BackendKind::IndexedHybrid).unwrap().is_some());
}

#[test]
fn monitor_triggers_upgrade_once_past_threshold() {
    let (_dir, store) = seeded(StoreConfig::default());
    let decision = store.scale_decision().unwrap();
    assert_eq!(decision.target, BackendKind::IndexedHybrid);
    assert!(store.auto_scale().unwrap().is_some());
    // Inside the hybrid band nothing moves.
    assert!(store.auto_scale().unwrap().is_none());
}

#[test]
fn sweep_deletes_retired_backends_after_grace() {
    let mut config = StoreConfig::default();
    config.migration.grace_period_secs = 0;
    let (dir, store) = seeded(config);
    store.migrate_to(BackendKind::IndexedHybrid).unwrap().unwrap();

    thread::sleep(Duration::from_millis(10));
    let swept = store.sweep_retired(chrono::Utc::now()).unwrap();
    assert_eq!(swept.retired_removed.len(), 1);
    assert!(store.router().manifest().retired.is_empty());
    let remaining = std::fs::read_dir(dir.path().join("backends")).unwrap().count();
    assert_eq!(remaining, 1);
}
