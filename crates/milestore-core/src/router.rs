//! Store manifest and backend routing.
//!
//! `<root>/manifest.json` names the authoritative backend, the mirror that
//! receives dual writes during a migration, and retired backends waiting
//! out their grace period. Every rewrite bumps `generation` and happens
//! under `manifest.lock`.
//!
//! Writers call [`BackendRouter::refresh`] after taking a unit's lease, so
//! a manifest change is observed by the next commit to every unit. Before
//! committing they level the unit across active and mirror with
//! [`BackendRouter::sync_unit`]; the mirror commit that follows is then
//! always contiguous.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::backend::{BackendHandle, BackendKind, BackendOptions, StorageBackend, open_backend};
use crate::error::{IoContext, StoreError};
use crate::lock::StoreLock;
use crate::model::WorkUnitId;
use crate::projection;

pub const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_LOCK: &str = "manifest.lock";
pub const BACKENDS_DIR: &str = "backends";

/// Manifest rewrites are tiny; waiting longer than this means a stuck holder.
const MANIFEST_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// A backend instance: its kind and directory relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendRef {
    pub kind: BackendKind,
    pub dir: String,
}

impl BackendRef {
    /// A fresh, timestamped directory for a new backend of `kind`.
    #[must_use]
    pub fn fresh(kind: BackendKind, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            dir: format!("{BACKENDS_DIR}/{kind}-{}", now.format("%Y%m%dT%H%M%S%6fZ")),
        }
    }

    #[must_use]
    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(&self.dir)
    }
}

/// A decommissioned backend kept until `delete_after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredBackend {
    pub backend: BackendRef,
    pub retired_at: DateTime<Utc>,
    pub delete_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub generation: u64,
    pub active: BackendRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<BackendRef>,
    #[serde(default)]
    pub retired: Vec<RetiredBackend>,
    pub updated_at: DateTime<Utc>,
}

impl StoreManifest {
    #[must_use]
    pub fn initial(kind: BackendKind, now: DateTime<Utc>) -> Self {
        Self {
            generation: 1,
            active: BackendRef::fresh(kind, now),
            mirror: None,
            retired: Vec::new(),
            updated_at: now,
        }
    }

    /// Read the manifest, `None` if the store was never initialized.
    ///
    /// # Errors
    ///
    /// I/O failures or an unparsable manifest.
    pub fn load(root: &Path) -> Result<Option<Self>, StoreError> {
        let path = root.join(MANIFEST_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|err| StoreError::Corrupt {
                    path,
                    reason: err.to_string(),
                }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(path, err)),
        }
    }

    /// Atomically replace the manifest. Callers hold `manifest.lock`.
    fn save(&self, root: &Path) -> Result<(), StoreError> {
        let path = root.join(MANIFEST_FILE);
        let tmp = root.join(format!("{MANIFEST_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, json).at(&tmp)?;
        fs::rename(&tmp, &path).at(&path)
    }

    /// Every backend directory the manifest still references.
    pub fn referenced(&self) -> impl Iterator<Item = &BackendRef> {
        std::iter::once(&self.active)
            .chain(self.mirror.as_ref())
            .chain(self.retired.iter().map(|r| &r.backend))
    }
}

#[derive(Debug)]
struct Routes {
    manifest: StoreManifest,
    active: BackendHandle,
    mirror: Option<BackendHandle>,
}

/// Resolves the manifest into open backend handles.
#[derive(Debug)]
pub struct BackendRouter {
    root: PathBuf,
    options: BackendOptions,
    page_size: usize,
    routes: RwLock<Routes>,
    handles: Mutex<HashMap<BackendRef, BackendHandle>>,
}

impl BackendRouter {
    /// Open an initialized store.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotInitialized`] without a manifest; backend open
    /// failures otherwise.
    pub fn open(
        root: &Path,
        options: BackendOptions,
        page_size: usize,
    ) -> Result<Self, StoreError> {
        let manifest = StoreManifest::load(root)?.ok_or_else(|| StoreError::NotInitialized {
            root: root.to_path_buf(),
        })?;
        Self::from_manifest(root, options, page_size, manifest)
    }

    /// Create the manifest with a fresh `kind` backend unless one exists,
    /// then open the store.
    ///
    /// # Errors
    ///
    /// I/O failures writing the manifest, backend open failures.
    pub fn initialize(
        root: &Path,
        kind: BackendKind,
        options: BackendOptions,
        page_size: usize,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(root).at(root)?;
        let _lock = manifest_lock(root)?;
        let manifest = if let Some(existing) = StoreManifest::load(root)? {
            existing
        } else {
            let manifest = StoreManifest::initial(kind, Utc::now());
            manifest.save(root)?;
            tracing::info!(root = %root.display(), backend = %kind, "store initialized");
            manifest
        };
        Self::from_manifest(root, options, page_size, manifest)
    }

    fn from_manifest(
        root: &Path,
        options: BackendOptions,
        page_size: usize,
        manifest: StoreManifest,
    ) -> Result<Self, StoreError> {
        let active = open_backend(manifest.active.kind, &manifest.active.path(root), options)?;
        let handles = HashMap::from([(manifest.active.clone(), active.clone())]);
        let router = Self {
            root: root.to_path_buf(),
            options,
            page_size: page_size.max(1),
            routes: RwLock::new(Routes {
                manifest: manifest.clone(),
                active,
                mirror: None,
            }),
            handles: Mutex::new(handles),
        };
        router.install(manifest)?;
        Ok(router)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Open (or reuse) the backend a manifest entry points at.
    ///
    /// # Errors
    ///
    /// Backend open failures.
    pub fn handle(&self, backend: &BackendRef) -> Result<BackendHandle, StoreError> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handles.get(backend) {
            return Ok(handle.clone());
        }
        let handle = open_backend(backend.kind, &backend.path(&self.root), self.options)?;
        handles.insert(backend.clone(), handle.clone());
        Ok(handle)
    }

    /// Forget a cached handle, e.g. after its storage was discarded.
    pub fn evict(&self, backend: &BackendRef) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(backend);
    }

    fn install(&self, manifest: StoreManifest) -> Result<(), StoreError> {
        let active = self.handle(&manifest.active)?;
        let mirror = manifest
            .mirror
            .as_ref()
            .map(|m| self.handle(m))
            .transpose()?;
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(
            generation = manifest.generation,
            active = %manifest.active.kind,
            mirror = ?manifest.mirror.as_ref().map(|m| m.kind),
            "routes installed"
        );
        *routes = Routes {
            manifest,
            active,
            mirror,
        };
        Ok(())
    }

    /// Re-read the manifest and switch routes if its generation moved.
    ///
    /// # Errors
    ///
    /// Manifest read failures or backend open failures.
    pub fn refresh(&self) -> Result<(), StoreError> {
        let manifest = StoreManifest::load(&self.root)?.ok_or_else(|| StoreError::NotInitialized {
            root: self.root.clone(),
        })?;
        if manifest.generation == self.generation() {
            return Ok(());
        }
        self.install(manifest)
    }

    fn generation(&self) -> u64 {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .manifest
            .generation
    }

    #[must_use]
    pub fn manifest(&self) -> StoreManifest {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .manifest
            .clone()
    }

    #[must_use]
    pub fn active(&self) -> BackendHandle {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .clone()
    }

    #[must_use]
    pub fn mirror(&self) -> Option<BackendHandle> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .mirror
            .clone()
    }

    /// Rewrite the manifest under `manifest.lock`. `f` sees the latest
    /// on-disk manifest; the generation is bumped and routes reinstalled.
    ///
    /// # Errors
    ///
    /// Lock, I/O or backend open failures, or whatever `f` returns.
    pub fn update_manifest<R>(
        &self,
        f: impl FnOnce(&mut StoreManifest) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let _lock = manifest_lock(&self.root)?;
        let mut manifest = StoreManifest::load(&self.root)?.ok_or_else(|| {
            StoreError::NotInitialized {
                root: self.root.clone(),
            }
        })?;
        let out = f(&mut manifest)?;
        manifest.generation += 1;
        manifest.updated_at = Utc::now();
        manifest.save(&self.root)?;
        self.install(manifest)?;
        Ok(out)
    }

    /// Bring active and mirror to the same last sequence for `id`, copying
    /// from whichever side is ahead. Returns the number of events copied.
    /// The caller must hold the unit's lease.
    ///
    /// # Errors
    ///
    /// Read, projection or commit failures on either side.
    pub fn sync_unit(&self, id: &WorkUnitId) -> Result<u64, StoreError> {
        let Some(mirror) = self.mirror() else {
            return Ok(0);
        };
        let active = self.active();
        let ahead = active.last_sequence(id)?;
        let behind = mirror.last_sequence(id)?;
        match ahead.cmp(&behind) {
            std::cmp::Ordering::Equal => Ok(0),
            std::cmp::Ordering::Greater => copy_missing(&*active, &*mirror, id, self.page_size),
            std::cmp::Ordering::Less => copy_missing(&*mirror, &*active, id, self.page_size),
        }
    }

    /// Commit to the active backend, then to the mirror if one is set.
    ///
    /// A mirror failure is logged and left to the next [`Self::sync_unit`]:
    /// the active backend is authoritative.
    ///
    /// # Errors
    ///
    /// Failures of the active commit.
    pub fn commit(
        &self,
        events: &[crate::event::Event],
        doc: &crate::model::WorkUnit,
    ) -> Result<(), StoreError> {
        let (active, mirror) = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
            (routes.active.clone(), routes.mirror.clone())
        };
        active.commit(events, doc)?;
        if let Some(mirror) = mirror {
            if let Err(err) = mirror.commit(events, doc) {
                tracing::warn!(
                    work_unit = %doc.id,
                    sequence = doc.last_sequence,
                    backend = %mirror.kind(),
                    error = %err,
                    "mirror commit failed; catch-up will copy it"
                );
            }
        }
        Ok(())
    }
}

/// Take `manifest.lock` for `root`.
///
/// # Errors
///
/// [`StoreError::LeaseTimeout`] if another process holds it too long.
pub fn manifest_lock(root: &Path) -> Result<StoreLock, StoreError> {
    Ok(StoreLock::acquire(
        &root.join(MANIFEST_LOCK),
        MANIFEST_LOCK_TIMEOUT,
    )?)
}

/// Copy the events `target` is missing for `id` from `source`, projecting
/// them onto the target's document. Returns the number of events copied.
///
/// # Errors
///
/// Read, projection or commit failures.
pub fn copy_missing(
    source: &dyn StorageBackend,
    target: &dyn StorageBackend,
    id: &WorkUnitId,
    page_size: usize,
) -> Result<u64, StoreError> {
    let from = target.last_sequence(id)?.map_or(0, |s| s + 1);
    let events = source.read_all_events(id, from, page_size)?;
    if events.is_empty() {
        return Ok(0);
    }
    let mut doc = target.get_document(id)?;
    for event in &events {
        doc = Some(projection::apply(doc, event)?);
    }
    let Some(doc) = doc else {
        return Ok(0);
    };
    target.commit(&events, &doc)?;
    tracing::debug!(
        work_unit = %id,
        from = %source.kind(),
        to = %target.kind(),
        copied = events.len(),
        "events copied"
    );
    Ok(u64::try_from(events.len()).unwrap_or(u64::MAX))
}
