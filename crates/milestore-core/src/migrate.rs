//! Online backend-to-backend migration.
//!
//! # Stages
//!
//! 1. **Snapshot**: record each unit's watermark on the active backend `A`
//!    and rebuild its document by replaying up to it.
//! 2. **Bulk load** the snapshot into a fresh backend `B`. Nothing reads `B`
//!    yet, so no leases are taken.
//! 3. **Dual write**: the manifest names `B` as mirror. Writers re-read the
//!    manifest under their lease and commit to both. A catch-up loop levels
//!    each unit under its lease until one full round finds zero lag.
//! 4. **Cutover**: `B` becomes active and `A` the mirror.
//! 5. **Verify**: the conformance query set is run on both sides and the
//!    BLAKE3 digests of the results compared.
//! 6. **Decommission**: the mirror is dropped and `A` retired with a grace
//!    deadline. [`MigrationEngine::sweep_retired`] deletes it afterwards.
//!
//! Any failure before step 6 rolls the manifest back to `A` and discards
//! `B`. `A` is never destructively modified; a cancellation flag is honored
//! up to cutover.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{BackendHandle, BackendKind, StorageBackend};
use crate::config::MigrationConfig;
use crate::error::{IoContext, StoreError};
use crate::lock::{LeaseManager, LockError, StoreLock};
use crate::model::{Status, WorkUnitId};
use crate::monitor::ScaleDecision;
use crate::projection;
use crate::router::{BACKENDS_DIR, BackendRef, BackendRouter, RetiredBackend};

/// Held for the whole of a migration and while sweeping orphans.
pub const MIGRATION_LOCK: &str = "migration.lock";

/// Consecutive verification rounds a query must diverge in before the
/// divergence is reported. Concurrent writers can make a single unleased
/// read of both sides disagree momentarily.
const VERIFY_CONFIRMATIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStage {
    Snapshot,
    BulkLoad,
    DualWrite,
    Cutover,
    Verify,
    Decommission,
}

impl MigrationStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::BulkLoad => "bulk-load",
            Self::DualWrite => "dual-write",
            Self::Cutover => "cutover",
            Self::Verify => "verify",
            Self::Decommission => "decommission",
        }
    }
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a completed migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from: BackendKind,
    pub to: BackendKind,
    pub units: usize,
    /// Events written by the bulk load.
    pub events_loaded: u64,
    /// Events copied by the catch-up loop.
    pub events_caught_up: u64,
    pub catch_up_rounds: u32,
    pub verified_queries: usize,
    pub retired: BackendRef,
    pub delete_after: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Storage removed by [`MigrationEngine::sweep_retired`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub retired_removed: Vec<BackendRef>,
    pub orphans_removed: Vec<String>,
}

/// Digest of one conformance query's result.
pub type QueryDigests = BTreeMap<String, blake3::Hash>;

/// Called on the migrating thread as each stage begins.
pub type StageObserver = Arc<dyn Fn(MigrationStage) + Send + Sync>;

/// Runs migrations for one store.
#[derive(Clone)]
pub struct MigrationEngine {
    router: Arc<BackendRouter>,
    leases: LeaseManager,
    config: MigrationConfig,
    acquire_timeout: Duration,
    cancel: Arc<AtomicBool>,
    holder: String,
    observer: Option<StageObserver>,
}

impl fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("root", &self.router.root())
            .field("holder", &self.holder)
            .field("observed", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl MigrationEngine {
    #[must_use]
    pub fn new(
        router: Arc<BackendRouter>,
        leases: LeaseManager,
        config: MigrationConfig,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            router,
            leases,
            config,
            acquire_timeout,
            cancel: Arc::new(AtomicBool::new(false)),
            holder: format!("migration-{}", std::process::id()),
            observer: None,
        }
    }

    /// Report each stage to `observer` as it begins.
    #[must_use]
    pub fn with_stage_observer(mut self, observer: StageObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn enter(&self, stage: MigrationStage) {
        tracing::debug!(%stage, "migration stage");
        if let Some(observer) = &self.observer {
            observer(stage);
        }
    }

    /// Share `flag` as the cancellation signal.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Set this to `true` to abort a running migration before cutover.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Carry out `decision`. Returns `None` when it asks for no move or the
    /// store already runs on the target tier.
    ///
    /// # Errors
    ///
    /// - [`StoreError::MigrationCancelled`] when the flag is raised before cutover
    /// - [`StoreError::CatchUpTimeout`] when the dual-write window does not converge
    /// - [`StoreError::VerificationTimeout`] / [`StoreError::MigrationVerificationFailed`]
    ///   after cutover; the store is rolled back to the source backend
    /// - [`StoreError::LeaseTimeout`] when another migration holds `migration.lock`
    /// - storage failures
    pub fn migrate(&self, decision: &ScaleDecision) -> Result<Option<MigrationReport>, StoreError> {
        if !decision.requires_migration() {
            return Ok(None);
        }
        let root = self.router.root().to_path_buf();
        let _lock = StoreLock::try_acquire(&root.join(MIGRATION_LOCK))?;

        self.router.refresh()?;
        self.settle_stale_mirror()?;

        let manifest = self.router.manifest();
        if manifest.active.kind == decision.target {
            return Ok(None);
        }
        if manifest.active.kind != decision.current {
            tracing::warn!(
                expected = %decision.current,
                actual = %manifest.active.kind,
                "scale decision was made against a different backend"
            );
        }
        let source_ref = manifest.active.clone();
        let target_ref = BackendRef::fresh(decision.target, Utc::now());
        let source = self.router.active();
        let target = self.router.handle(&target_ref)?;
        let started = Instant::now();
        tracing::info!(
            from = %source_ref.kind,
            to = %target_ref.kind,
            dir = %target_ref.dir,
            "migration started"
        );

        self.enter(MigrationStage::Snapshot);
        let loaded = match self.load(&*source, &*target, source_ref.kind, target_ref.kind) {
            Ok(loaded) => loaded,
            Err(err) => {
                self.discard(&target_ref, &target);
                return Err(err);
            }
        };

        self.enter(MigrationStage::DualWrite);
        let caught_up = match self.dual_write(&source_ref, &target_ref) {
            Ok(caught_up) => caught_up,
            Err(err) => {
                self.abort_dual_write(&target_ref, &target);
                return Err(err);
            }
        };

        self.enter(MigrationStage::Cutover);
        let cancelled =
            self.check_cancel(source_ref.kind, target_ref.kind, MigrationStage::Cutover);
        if let Err(err) = cancelled {
            self.abort_dual_write(&target_ref, &target);
            return Err(err);
        }
        if let Err(err) = self.router.update_manifest(|m| {
            m.active = target_ref.clone();
            m.mirror = Some(source_ref.clone());
            Ok(())
        }) {
            self.abort_dual_write(&target_ref, &target);
            return Err(err);
        }
        tracing::info!(
            from = %source_ref.kind,
            to = %target_ref.kind,
            stage = %MigrationStage::Verify,
            "cutover complete"
        );
        self.enter(MigrationStage::Verify);

        let verified_queries = match self.verify(&source, &target, source_ref.kind, target_ref.kind)
        {
            Ok(count) => count,
            Err(err) => {
                self.roll_back(&source_ref, &target_ref, &target);
                return Err(err);
            }
        };

        self.enter(MigrationStage::Decommission);
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.config.grace_period())
            .unwrap_or_else(|_| chrono::Duration::weeks(1));
        let delete_after = now + grace;
        tracing::debug!(
            stage = %MigrationStage::Decommission,
            dir = %source_ref.dir,
            "retiring source"
        );
        self.router.update_manifest(|m| {
            m.mirror = None;
            m.retired.push(RetiredBackend {
                backend: source_ref.clone(),
                retired_at: now,
                delete_after,
            });
            Ok(())
        })?;

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            from = %source_ref.kind,
            to = %target_ref.kind,
            units = loaded.units,
            events_loaded = loaded.events,
            events_caught_up = caught_up.events,
            elapsed_ms,
            "migration complete"
        );
        Ok(Some(MigrationReport {
            from: source_ref.kind,
            to: target_ref.kind,
            units: loaded.units,
            events_loaded: loaded.events,
            events_caught_up: caught_up.events,
            catch_up_rounds: caught_up.rounds,
            verified_queries,
            retired: source_ref,
            delete_after,
            elapsed_ms,
        }))
    }

    fn check_cancel(
        &self,
        from: BackendKind,
        to: BackendKind,
        stage: MigrationStage,
    ) -> Result<(), StoreError> {
        if self.cancel.load(Ordering::SeqCst) {
            tracing::warn!(%from, %to, %stage, "migration cancelled");
            return Err(StoreError::MigrationCancelled {
                from,
                to,
                stage: stage.as_str(),
            });
        }
        Ok(())
    }

    /// Snapshot and bulk load.
    fn load(
        &self,
        source: &dyn StorageBackend,
        target: &dyn StorageBackend,
        from: BackendKind,
        to: BackendKind,
    ) -> Result<Loaded, StoreError> {
        self.check_cancel(from, to, MigrationStage::Snapshot)?;
        let mut watermarks = Vec::new();
        for id in source.list_ids()? {
            if let Some(last) = source.last_sequence(&id)? {
                watermarks.push((id, last));
            }
        }

        self.enter(MigrationStage::BulkLoad);
        let mut loaded = Loaded {
            units: watermarks.len(),
            events: 0,
        };
        for (id, watermark) in watermarks {
            self.check_cancel(from, to, MigrationStage::BulkLoad)?;
            let mut events = source.read_all_events(&id, 0, self.router.page_size())?;
            events.retain(|e| e.sequence <= watermark);
            let Some(doc) = projection::replay(&events)? else {
                continue;
            };
            target.commit(&events, &doc)?;
            loaded.events += u64::try_from(events.len()).unwrap_or(u64::MAX);
        }
        tracing::info!(
            %from,
            %to,
            units = loaded.units,
            events = loaded.events,
            "bulk load complete"
        );
        Ok(loaded)
    }

    /// Publish the mirror and level every unit until a round finds no lag.
    fn dual_write(
        &self,
        source_ref: &BackendRef,
        target_ref: &BackendRef,
    ) -> Result<CaughtUp, StoreError> {
        let (from, to) = (source_ref.kind, target_ref.kind);
        self.check_cancel(from, to, MigrationStage::DualWrite)?;
        self.router.update_manifest(|m| {
            m.mirror = Some(target_ref.clone());
            Ok(())
        })?;

        let deadline = Instant::now() + self.config.catch_up_timeout();
        let mut caught_up = CaughtUp::default();
        loop {
            self.check_cancel(from, to, MigrationStage::DualWrite)?;
            caught_up.rounds += 1;
            let round = self.level_all(deadline)?;
            caught_up.events += round.copied;
            tracing::debug!(
                round = caught_up.rounds,
                copied = round.copied,
                lagging = round.lagging,
                "catch-up round"
            );
            if round.lagging == 0 {
                return Ok(caught_up);
            }
            if Instant::now() >= deadline {
                return Err(StoreError::CatchUpTimeout {
                    from,
                    to,
                    lagging: round.lagging,
                    waited: self.config.catch_up_timeout(),
                });
            }
            thread::sleep(self.config.catch_up_poll());
        }
    }

    /// One pass over every unit on either side. A unit counts as lagging
    /// when events had to be copied or its lease could not be taken.
    fn level_all(&self, deadline: Instant) -> Result<Round, StoreError> {
        let mut ids: BTreeSet<WorkUnitId> = self.router.active().list_ids()?.into_iter().collect();
        if let Some(mirror) = self.router.mirror() {
            ids.extend(mirror.list_ids()?);
        }

        let mut round = Round::default();
        for id in ids {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(self.acquire_timeout);
            let lease = match self.leases.acquire(id.as_str(), &self.holder, wait) {
                Ok(lease) => lease,
                Err(LockError::Timeout { .. }) => {
                    round.lagging += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            self.router.refresh()?;
            let copied = self.router.sync_unit(&id)?;
            drop(lease);
            if copied > 0 {
                round.copied += copied;
                round.lagging += 1;
            }
        }
        Ok(round)
    }

    /// Compare the conformance query set on both sides. Returns the number
    /// of queries compared.
    fn verify(
        &self,
        source: &BackendHandle,
        target: &BackendHandle,
        from: BackendKind,
        to: BackendKind,
    ) -> Result<usize, StoreError> {
        let timeout = self.config.verification_timeout();
        let deadline = Instant::now() + timeout;
        let timed_out = || StoreError::VerificationTimeout {
            from,
            to,
            waited: timeout,
        };

        // Per-unit checks run under the unit's lease and are definitive.
        let mut compared = 0;
        let mut divergences = Vec::new();
        let ids: BTreeSet<WorkUnitId> = source
            .list_ids()?
            .into_iter()
            .chain(target.list_ids()?)
            .collect();
        for id in &ids {
            let lease = loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(timed_out());
                }
                match self
                    .leases
                    .acquire(id.as_str(), &self.holder, remaining.min(self.acquire_timeout))
                {
                    Ok(lease) => break lease,
                    Err(LockError::Timeout { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            };
            self.router.refresh()?;
            self.router.sync_unit(id)?;
            for (name, a, b) in [
                (
                    format!("events:{id}"),
                    events_digest(&**source, id, self.router.page_size())?,
                    events_digest(&**target, id, self.router.page_size())?,
                ),
                (
                    format!("document:{id}"),
                    digest_json(&source.get_document(id)?)?,
                    digest_json(&target.get_document(id)?)?,
                ),
            ] {
                compared += 1;
                if a != b {
                    divergences.push(name);
                }
            }
            drop(lease);
        }
        if !divergences.is_empty() {
            return Err(verification_failed(from, to, divergences));
        }

        // Set queries run unleased; a divergence must persist across
        // several rounds before it counts.
        let mut streak: BTreeMap<String, u32> = BTreeMap::new();
        loop {
            if Instant::now() >= deadline {
                return Err(timed_out());
            }
            let a = conformance_digests(&**source)?;
            let b = conformance_digests(&**target)?;
            let diverging = diff_digests(&a, &b);
            if diverging.is_empty() {
                tracing::info!(%from, %to, queries = compared + a.len(), "verification passed");
                return Ok(compared + a.len());
            }
            streak.retain(|name, _| diverging.contains(name));
            for name in &diverging {
                *streak.entry(name.clone()).or_insert(0) += 1;
            }
            let confirmed: Vec<String> = streak
                .iter()
                .filter(|(_, n)| **n >= VERIFY_CONFIRMATIONS)
                .map(|(name, _)| name.clone())
                .collect();
            if !confirmed.is_empty() {
                return Err(verification_failed(from, to, confirmed));
            }
            thread::sleep(self.config.catch_up_poll());
        }
    }

    /// Abort before cutover: drop the mirror and discard `B`.
    fn abort_dual_write(&self, target_ref: &BackendRef, target: &BackendHandle) {
        let cleared = self.router.update_manifest(|m| {
            if m.mirror.as_ref() == Some(target_ref) {
                m.mirror = None;
            }
            Ok(())
        });
        match cleared {
            Ok(()) => self.discard(target_ref, target),
            Err(err) => tracing::error!(
                dir = %target_ref.dir,
                error = %err,
                "could not clear mirror after aborted migration; next migration will settle it"
            ),
        }
    }

    /// Undo a cutover: `A` becomes active again, post-cutover writes are
    /// copied back, then `B` is dropped. If some unit cannot be levelled `B`
    /// stays as mirror so no write is lost; writers and the next migration
    /// finish the job.
    fn roll_back(&self, source_ref: &BackendRef, target_ref: &BackendRef, target: &BackendHandle) {
        tracing::warn!(from = %source_ref.kind, to = %target_ref.kind, "rolling back cutover");
        if let Err(err) = self.router.update_manifest(|m| {
            m.active = source_ref.clone();
            m.mirror = Some(target_ref.clone());
            Ok(())
        }) {
            tracing::error!(error = %err, "rollback could not rewrite the manifest");
            return;
        }
        let deadline = Instant::now() + self.config.catch_up_timeout();
        loop {
            match self.level_all(deadline) {
                Ok(round) if round.lagging == 0 => break,
                Ok(_) if Instant::now() < deadline => thread::sleep(self.config.catch_up_poll()),
                Ok(round) => {
                    tracing::error!(
                        lagging = round.lagging,
                        "rollback catch-up did not converge; keeping mirror"
                    );
                    return;
                }
                Err(err) => {
                    tracing::error!(error = %err, "rollback catch-up failed; keeping mirror");
                    return;
                }
            }
        }
        self.abort_dual_write(target_ref, target);
    }

    /// A mirror left behind by a crashed migration: level every unit, then
    /// retire it with the usual grace period.
    fn settle_stale_mirror(&self) -> Result<(), StoreError> {
        let Some(stale) = self.router.manifest().mirror else {
            return Ok(());
        };
        tracing::warn!(dir = %stale.dir, "settling mirror left by an interrupted migration");
        let deadline = Instant::now() + self.config.catch_up_timeout();
        loop {
            let round = self.level_all(deadline)?;
            if round.lagging == 0 {
                break;
            }
            if Instant::now() >= deadline {
                let active = self.router.manifest().active.kind;
                return Err(StoreError::CatchUpTimeout {
                    from: active,
                    to: stale.kind,
                    lagging: round.lagging,
                    waited: self.config.catch_up_timeout(),
                });
            }
            thread::sleep(self.config.catch_up_poll());
        }
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.config.grace_period())
            .unwrap_or_else(|_| chrono::Duration::weeks(1));
        self.router.update_manifest(|m| {
            if let Some(mirror) = m.mirror.take() {
                m.retired.push(RetiredBackend {
                    backend: mirror,
                    retired_at: now,
                    delete_after: now + grace,
                });
            }
            Ok(())
        })
    }

    fn discard(&self, backend: &BackendRef, handle: &BackendHandle) {
        if let Err(err) = handle.discard() {
            tracing::warn!(dir = %backend.dir, error = %err, "discard failed; sweep will retry");
        }
        self.router.evict(backend);
        tracing::info!(dir = %backend.dir, backend = %backend.kind, "backend discarded");
    }

    /// Delete retired backends past their deadline and, when no migration
    /// is running, backend directories the manifest no longer references.
    ///
    /// # Errors
    ///
    /// Manifest and I/O failures.
    pub fn sweep_retired(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        self.router.refresh()?;
        let any_expired = self
            .router
            .manifest()
            .retired
            .iter()
            .any(|r| r.delete_after <= now);
        let expired = if any_expired {
            self.router.update_manifest(|m| {
                let (expired, kept): (Vec<_>, Vec<_>) =
                    m.retired.drain(..).partition(|r| r.delete_after <= now);
                m.retired = kept;
                Ok(expired)
            })?
        } else {
            Vec::new()
        };
        for retired in expired {
            let handle = self.router.handle(&retired.backend)?;
            handle.discard()?;
            self.router.evict(&retired.backend);
            tracing::info!(dir = %retired.backend.dir, "retired backend deleted");
            report.retired_removed.push(retired.backend);
        }

        let root = self.router.root();
        let _lock = match StoreLock::try_acquire(&root.join(MIGRATION_LOCK)) {
            Ok(lock) => lock,
            Err(LockError::Timeout { .. }) => {
                tracing::debug!("migration in progress; orphan sweep skipped");
                return Ok(report);
            }
            Err(err) => return Err(err.into()),
        };
        self.router.refresh()?;
        let manifest = self.router.manifest();
        let referenced: BTreeSet<&str> = manifest.referenced().map(|b| b.dir.as_str()).collect();
        let backends = root.join(BACKENDS_DIR);
        let entries = match fs::read_dir(&backends) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(err) => return Err(StoreError::io(&backends, err)),
        };
        for entry in entries {
            let entry = entry.at(&backends)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = format!("{BACKENDS_DIR}/{name}");
            if referenced.contains(rel.as_str()) {
                continue;
            }
            let path = entry.path();
            fs::remove_dir_all(&path).at(&path)?;
            tracing::info!(dir = %rel, "orphaned backend directory deleted");
            report.orphans_removed.push(rel);
        }
        Ok(report)
    }
}

#[derive(Debug, Default)]
struct Loaded {
    units: usize,
    events: u64,
}

#[derive(Debug, Default)]
struct CaughtUp {
    rounds: u32,
    events: u64,
}

#[derive(Debug, Default)]
struct Round {
    copied: u64,
    lagging: usize,
}

fn verification_failed(from: BackendKind, to: BackendKind, divergences: Vec<String>) -> StoreError {
    tracing::error!(%from, %to, divergent = divergences.len(), "verification found divergence");
    StoreError::MigrationVerificationFailed {
        from,
        to,
        divergences,
    }
}

fn digest_json<T: Serialize>(value: &T) -> Result<blake3::Hash, StoreError> {
    Ok(blake3::hash(&serde_json::to_vec(value)?))
}

fn events_digest(
    backend: &dyn StorageBackend,
    id: &WorkUnitId,
    page_size: usize,
) -> Result<blake3::Hash, StoreError> {
    let mut hasher = blake3::Hasher::new();
    for event in backend.read_all_events(id, 0, page_size)? {
        hasher.update(event.to_line()?.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hasher.finalize())
}

/// Digests of the store-wide queries: the id list, every status query and
/// a dependency query per depended-upon unit.
///
/// # Errors
///
/// Storage failures.
pub fn conformance_digests(backend: &dyn StorageBackend) -> Result<QueryDigests, StoreError> {
    let mut digests = QueryDigests::new();
    digests.insert("list_ids".into(), digest_json(&backend.list_ids()?)?);

    let docs = backend.list_documents()?;
    let targets: BTreeSet<&WorkUnitId> = docs.iter().flat_map(|d| &d.dependencies).collect();
    for status in Status::ALL {
        digests.insert(
            format!("status:{status}"),
            digest_json(&backend.query_by_status(status)?)?,
        );
    }
    for target in targets {
        digests.insert(
            format!("dependency:{target}"),
            digest_json(&backend.query_by_dependency(target)?)?,
        );
    }
    Ok(digests)
}

/// Names of queries whose digests differ or exist on one side only.
#[must_use]
pub fn diff_digests(a: &QueryDigests, b: &QueryDigests) -> BTreeSet<String> {
    a.keys()
        .chain(b.keys())
        .filter(|name| a.get(*name) != b.get(*name))
        .cloned()
        .collect()
}
