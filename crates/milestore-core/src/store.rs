//! The store facade.
//!
//! [`Store`] wires the router, event log, broker, monitor, migration engine
//! and state bridge together over one directory:
//!
//! ```text
//! <root>/
//!   config.toml       optional settings
//!   manifest.json     active / mirror / retired backends
//!   backends/<kind>-<timestamp>/
//!   leases/           per-unit lease records
//!   views/<id>/       pending planning and execution views
//!   feed.jsonl        cross-process append notifications
//!   feed.1.jsonl      the previous feed segment, after a rotation
//!   feed.lock         serializes feed appends and rotation
//! ```
//!
//! Every mutation goes through [`EventLog::commit`]; reads go straight to
//! the active backend and never take a lease.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::BackendKind;
use crate::bridge::{StateBridge, SubmitOutcome, ViewKind};
use crate::broker::{Broker, FeedCursor, Subscription, SubscriptionFilter};
use crate::config::{self, StoreConfig};
use crate::error::StoreError;
use crate::event::{
    ArchivedData, BlockerRaisedData, BlockerResolvedData, Committed, CreatedData,
    DependencyData, Event, EventLog, EventPayload, EventStream, Expected, PhaseCompletedData,
    PhaseStartedData, ProgressData, RecomputeReport,
};
use crate::lock::LeaseManager;
use crate::metrics::BackendMetrics;
use crate::migrate::{MigrationEngine, MigrationReport, SweepReport};
use crate::model::{PhaseSpec, Status, WorkUnit, WorkUnitId};
use crate::monitor::{ScaleDecision, ScaleMonitor};
use crate::progress::{self, PhaseContribution};
use crate::recovery::HealthCheckResult;
use crate::router::BackendRouter;

pub const LEASES_DIR: &str = "leases";

/// Length of the hex part of derived ids; grows on collision.
const DERIVED_ID_LEN: usize = 6;

/// Handle to one store directory. Cheap to share behind an `Arc`; every
/// method takes `&self`.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    config: StoreConfig,
    router: Arc<BackendRouter>,
    log: EventLog,
    monitor: ScaleMonitor,
    bridge: StateBridge,
}

fn config_error(root: &Path, err: &anyhow::Error) -> StoreError {
    StoreError::Config {
        path: root.join(config::CONFIG_FILE),
        reason: format!("{err:#}"),
    }
}

impl Store {
    /// Create the store at `root` if needed and open it. An existing
    /// `config.toml` is kept; otherwise the defaults are written.
    ///
    /// # Errors
    ///
    /// Config, I/O and backend open failures.
    pub fn init(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root).map_err(|err| StoreError::io(root, err))?;
        let config = config::load_config(root).map_err(|err| config_error(root, &err))?;
        config::write_default_config(root, &config).map_err(|err| config_error(root, &err))?;
        let router = BackendRouter::initialize(
            root,
            config.storage.initial_backend,
            config.backend_options(),
            config.storage.read_page_size,
        )?;
        Ok(Self::assemble(root, config, router))
    }

    /// Open an initialized store.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotInitialized`] when `root` holds no store, config and
    /// backend open failures otherwise.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let config = config::load_config(root).map_err(|err| config_error(root, &err))?;
        Self::open_with(root, config)
    }

    /// Open with an explicit configuration instead of `config.toml`.
    ///
    /// # Errors
    ///
    /// See [`Store::open`].
    pub fn open_with(root: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate().map_err(|err| config_error(root, &err))?;
        let router = BackendRouter::open(
            root,
            config.backend_options(),
            config.storage.read_page_size,
        )?;
        Ok(Self::assemble(root, config, router))
    }

    fn assemble(root: &Path, config: StoreConfig, router: BackendRouter) -> Self {
        let router = Arc::new(router);
        let leases = LeaseManager::new(root.join(LEASES_DIR), config.lease.ttl());
        let broker =
            Arc::new(Broker::new(root).with_feed_limit(config.storage.feed_max_bytes));
        let log = EventLog::new(
            Arc::clone(&router),
            leases,
            broker,
            config.lease.acquire_timeout(),
        );
        let bridge = StateBridge::new(log.clone());
        let monitor = ScaleMonitor::new(config.scale.clone());
        tracing::debug!(root = %root.display(), backend = %router.active().kind(), "store opened");
        Self {
            root: root.to_path_buf(),
            config,
            router,
            log,
            monitor,
            bridge,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub const fn log(&self) -> &EventLog {
        &self.log
    }

    #[must_use]
    pub fn router(&self) -> &Arc<BackendRouter> {
        &self.router
    }

    /// Kind of the authoritative backend, as of the latest manifest.
    ///
    /// # Errors
    ///
    /// Manifest read failures.
    pub fn backend_kind(&self) -> Result<BackendKind, StoreError> {
        self.router.refresh()?;
        Ok(self.router.active().kind())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Append one event with an explicit concurrency token.
    ///
    /// # Errors
    ///
    /// See [`EventLog::commit`].
    pub fn append(
        &self,
        id: &WorkUnitId,
        payload: EventPayload,
        writer: &str,
        expected: Expected,
    ) -> Result<Event, StoreError> {
        self.log.append(id, payload, writer, expected)
    }

    /// Create a work unit under a derived `ms-…` id.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidEvent`] for a bad phase template, plus
    /// everything [`Store::create_work_unit_with_id`] returns.
    pub fn create_work_unit(
        &self,
        title: &str,
        phases: Vec<PhaseSpec>,
        dependencies: BTreeSet<WorkUnitId>,
        writer: &str,
    ) -> Result<WorkUnit, StoreError> {
        let nonce = Utc::now()
            .timestamp_nanos_opt()
            .map_or(0, |n| n.unsigned_abs().into())
            ^ (u128::from(std::process::id()) << 64);
        let mut len = DERIVED_ID_LEN;
        loop {
            let id = WorkUnitId::derive(title, nonce, len);
            let created = self.create_work_unit_with_id(
                &id,
                title,
                phases.clone(),
                dependencies.clone(),
                writer,
            );
            match created {
                Err(StoreError::AlreadyExists { .. }) if len < 32 => len += 2,
                other => return other,
            }
        }
    }

    /// Create a work unit under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`], [`StoreError::InvalidEvent`],
    /// [`StoreError::CycleDetected`], [`StoreError::NotFound`] for an unknown
    /// dependency, lease and storage failures.
    pub fn create_work_unit_with_id(
        &self,
        id: &WorkUnitId,
        title: &str,
        phases: Vec<PhaseSpec>,
        dependencies: BTreeSet<WorkUnitId>,
        writer: &str,
    ) -> Result<WorkUnit, StoreError> {
        let payload = EventPayload::Created(CreatedData {
            title: title.to_string(),
            phases,
            dependencies,
        });
        Ok(self
            .log
            .commit(id, vec![payload], writer, Expected::NoStream)?
            .document)
    }

    fn mutate(
        &self,
        id: &WorkUnitId,
        payload: EventPayload,
        writer: &str,
    ) -> Result<Committed, StoreError> {
        self.log.commit(id, vec![payload], writer, Expected::Any)
    }

    /// # Errors
    ///
    /// See [`EventLog::commit`].
    pub fn start_phase(
        &self,
        id: &WorkUnitId,
        phase: &str,
        writer: &str,
    ) -> Result<Committed, StoreError> {
        self.mutate(
            id,
            EventPayload::PhaseStarted(PhaseStartedData {
                phase: phase.to_string(),
            }),
            writer,
        )
    }

    /// # Errors
    ///
    /// See [`EventLog::commit`].
    pub fn complete_phase(
        &self,
        id: &WorkUnitId,
        phase: &str,
        deliverables: BTreeSet<String>,
        writer: &str,
    ) -> Result<Committed, StoreError> {
        self.mutate(
            id,
            EventPayload::PhaseCompleted(PhaseCompletedData {
                phase: phase.to_string(),
                deliverables,
            }),
            writer,
        )
    }

    /// Record a worker's partial completion of one phase.
    ///
    /// # Errors
    ///
    /// See [`EventLog::commit`].
    pub fn report_progress(
        &self,
        id: &WorkUnitId,
        phase: &str,
        fraction: f64,
        writer: &str,
    ) -> Result<Committed, StoreError> {
        self.mutate(
            id,
            EventPayload::ProgressUpdated(ProgressData::report(phase, fraction)),
            writer,
        )
    }

    /// # Errors
    ///
    /// See [`EventLog::commit`].
    pub fn raise_blocker(
        &self,
        id: &WorkUnitId,
        blocker: &str,
        reason: &str,
        writer: &str,
    ) -> Result<Committed, StoreError> {
        self.mutate(
            id,
            EventPayload::BlockerRaised(BlockerRaisedData {
                blocker: blocker.to_string(),
                reason: reason.to_string(),
            }),
            writer,
        )
    }

    /// # Errors
    ///
    /// See [`EventLog::commit`].
    pub fn resolve_blocker(
        &self,
        id: &WorkUnitId,
        blocker: &str,
        writer: &str,
    ) -> Result<Committed, StoreError> {
        self.mutate(
            id,
            EventPayload::BlockerResolved(BlockerResolvedData {
                blocker: blocker.to_string(),
            }),
            writer,
        )
    }

    /// # Errors
    ///
    /// [`StoreError::CycleDetected`] when the edge would close a cycle, plus
    /// everything [`EventLog::commit`] returns.
    pub fn add_dependency(
        &self,
        id: &WorkUnitId,
        depends_on: &WorkUnitId,
        writer: &str,
    ) -> Result<Committed, StoreError> {
        self.mutate(
            id,
            EventPayload::DependencyAdded(DependencyData {
                depends_on: depends_on.clone(),
            }),
            writer,
        )
    }

    /// Soft-delete a work unit.
    ///
    /// # Errors
    ///
    /// See [`EventLog::commit`].
    pub fn archive(
        &self,
        id: &WorkUnitId,
        reason: Option<String>,
        writer: &str,
    ) -> Result<Committed, StoreError> {
        self.mutate(id, EventPayload::Archived(ArchivedData { reason }), writer)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// Storage failures.
    pub fn get_document(&self, id: &WorkUnitId) -> Result<Option<WorkUnit>, StoreError> {
        self.router.refresh()?;
        self.router.active().get_document(id)
    }

    /// Like [`Store::get_document`] but a missing unit is an error.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] and storage failures.
    pub fn require_document(&self, id: &WorkUnitId) -> Result<WorkUnit, StoreError> {
        self.get_document(id)?.ok_or_else(|| StoreError::NotFound {
            work_unit: id.clone(),
            backend: self.router.active().kind(),
        })
    }

    /// # Errors
    ///
    /// Storage failures.
    pub fn list_documents(&self) -> Result<Vec<WorkUnit>, StoreError> {
        self.router.refresh()?;
        self.router.active().list_documents()
    }

    /// # Errors
    ///
    /// Storage failures.
    pub fn query_by_status(&self, status: Status) -> Result<Vec<WorkUnit>, StoreError> {
        self.router.refresh()?;
        self.router.active().query_by_status(status)
    }

    /// # Errors
    ///
    /// Storage failures.
    pub fn query_by_dependency(
        &self,
        depends_on: &WorkUnitId,
    ) -> Result<Vec<WorkUnit>, StoreError> {
        self.router.refresh()?;
        self.router.active().query_by_dependency(depends_on)
    }

    /// # Errors
    ///
    /// [`StoreError::NotFound`] and storage failures.
    pub fn phase_breakdown(&self, id: &WorkUnitId) -> Result<Vec<PhaseContribution>, StoreError> {
        Ok(progress::phase_breakdown(&self.require_document(id)?))
    }

    /// Lazily read `id`'s events from `from` on.
    ///
    /// # Errors
    ///
    /// Manifest read failures; read errors surface from the stream.
    pub fn read_from(&self, id: &WorkUnitId, from: u64) -> Result<EventStream, StoreError> {
        self.router.refresh()?;
        Ok(self.log.read_from(id, from))
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    /// Subscribe to events committed through this process.
    #[must_use]
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.log
            .broker()
            .subscribe(filter, self.config.storage.subscriber_capacity)
    }

    /// A cursor over the cross-process feed, starting after its current end.
    ///
    /// # Errors
    ///
    /// I/O failures reading the feed length.
    pub fn follow_feed(&self, filter: SubscriptionFilter) -> Result<FeedCursor, StoreError> {
        Ok(FeedCursor::from_end(self.log.broker().feed_path())?.with_filter(filter))
    }

    // -----------------------------------------------------------------------
    // Scale and migration
    // -----------------------------------------------------------------------

    /// Active backend metrics, with the writer count widened to every
    /// process that appended to the feed inside the monitoring window.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn metrics(&self) -> Result<BackendMetrics, StoreError> {
        self.router.refresh()?;
        let mut metrics = self.router.active().metrics()?;
        let feed_writers = self
            .log
            .broker()
            .recent_writers(self.config.scale.writer_window())?;
        metrics.writer_count = metrics.writer_count.max(feed_writers.len());
        Ok(metrics)
    }

    /// # Errors
    ///
    /// Storage failures.
    pub fn scale_decision(&self) -> Result<ScaleDecision, StoreError> {
        let metrics = self.metrics()?;
        Ok(self.monitor.decide(self.router.active().kind(), metrics))
    }

    /// A migration engine sharing this store's router and leases. Keep it
    /// to reach [`MigrationEngine::cancel_flag`] while it runs.
    #[must_use]
    pub fn migration_engine(&self) -> MigrationEngine {
        MigrationEngine::new(
            Arc::clone(&self.router),
            self.log.leases().clone(),
            self.config.migration.clone(),
            self.config.lease.acquire_timeout(),
        )
    }

    /// Carry out `decision`.
    ///
    /// # Errors
    ///
    /// See [`MigrationEngine::migrate`].
    pub fn migrate(&self, decision: &ScaleDecision) -> Result<Option<MigrationReport>, StoreError> {
        self.migration_engine().migrate(decision)
    }

    /// Move to `target` regardless of thresholds.
    ///
    /// # Errors
    ///
    /// See [`MigrationEngine::migrate`].
    pub fn migrate_to(&self, target: BackendKind) -> Result<Option<MigrationReport>, StoreError> {
        let metrics = self.metrics()?;
        let decision = ScaleDecision::forced(self.router.active().kind(), target, metrics);
        self.migrate(&decision)
    }

    /// Ask the monitor and migrate if it says so.
    ///
    /// # Errors
    ///
    /// See [`MigrationEngine::migrate`].
    pub fn auto_scale(&self) -> Result<Option<MigrationReport>, StoreError> {
        let decision = self.scale_decision()?;
        tracing::info!(%decision, "auto-scale");
        self.migrate(&decision)
    }

    /// # Errors
    ///
    /// See [`MigrationEngine::sweep_retired`].
    pub fn sweep_retired(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        self.migration_engine().sweep_retired(now)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// See [`EventLog::recompute`].
    pub fn recompute(&self, id: &WorkUnitId, writer: &str) -> Result<RecomputeReport, StoreError> {
        self.log.recompute(id, writer)
    }

    /// [`Store::recompute`] every unit that is not archived.
    ///
    /// # Errors
    ///
    /// The first failure.
    pub fn recompute_all(&self, writer: &str) -> Result<Vec<RecomputeReport>, StoreError> {
        self.list_documents()?
            .into_iter()
            .filter(|doc| !doc.is_archived())
            .map(|doc| self.recompute(&doc.id, writer))
            .collect()
    }

    /// Repair the active backend. Run it while no writer is active.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn repair(&self) -> Result<HealthCheckResult, StoreError> {
        self.router.refresh()?;
        self.router.active().repair()
    }

    /// Physically remove archived units whose last change is older than
    /// `older_than`. Units another live unit depends on are kept.
    ///
    /// # Errors
    ///
    /// Lease and storage failures.
    pub fn purge_archived(
        &self,
        older_than: Duration,
        writer: &str,
    ) -> Result<Vec<WorkUnitId>, StoreError> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let docs = self.list_documents()?;
        let referenced: BTreeSet<&WorkUnitId> = docs
            .iter()
            .filter(|d| !d.is_archived())
            .flat_map(|d| &d.dependencies)
            .collect();

        let mut purged = Vec::new();
        for doc in docs.iter().filter(|d| d.is_archived() && d.updated_at <= cutoff) {
            if referenced.contains(&doc.id) {
                tracing::debug!(work_unit = %doc.id, "archived unit still referenced; kept");
                continue;
            }
            let lease = self.log.lease(&doc.id, writer)?;
            self.router.refresh()?;
            lease.ensure_valid()?;
            let mut removed = self.router.active().purge(&doc.id)?;
            if let Some(mirror) = self.router.mirror() {
                removed |= mirror.purge(&doc.id)?;
            }
            drop(lease);
            if removed {
                tracing::info!(work_unit = %doc.id, writer = %writer, "archived unit purged");
                purged.push(doc.id.clone());
            }
        }
        Ok(purged)
    }

    // -----------------------------------------------------------------------
    // State bridge
    // -----------------------------------------------------------------------

    /// A view waiting for its counterpart.
    ///
    /// # Errors
    ///
    /// I/O failures or an unparsable view file.
    pub fn pending_view(
        &self,
        id: &WorkUnitId,
        kind: ViewKind,
    ) -> Result<Option<WorkUnit>, StoreError> {
        self.bridge.pending_view(id, kind)
    }

    /// # Errors
    ///
    /// See [`StateBridge::submit`].
    pub fn submit_planning_view(
        &self,
        view: &WorkUnit,
        writer: &str,
    ) -> Result<SubmitOutcome, StoreError> {
        self.router.refresh()?;
        self.bridge.submit_planning_view(view, writer)
    }

    /// # Errors
    ///
    /// See [`StateBridge::submit`].
    pub fn submit_execution_view(
        &self,
        view: &WorkUnit,
        writer: &str,
    ) -> Result<SubmitOutcome, StoreError> {
        self.router.refresh()?;
        self.bridge.submit_execution_view(view, writer)
    }
}
