//! Coordination primitives: advisory store locks and per-unit leases.
//!
//! Two layers, both built on `fs2` advisory locks:
//!
//! - [`StoreLock`] is a plain exclusive lock on a file, held for the
//!   lifetime of the guard. It protects short critical sections such as
//!   rewriting the store manifest, and marks a running migration.
//! - [`LeaseManager`] hands out [`Lease`]s: named, TTL-bounded claims
//!   recorded in `leases/<key>.lease`. The record is read and written under
//!   a short [`StoreLock`] on `leases/<key>.lock`, so a lease survives the
//!   acquiring call and can be reclaimed once its deadline passes even if
//!   the holder died without releasing it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Reserved lease key serializing dependency inserts across units.
///
/// Work unit ids may not start with `_`, so this never collides.
pub const GRAPH_LEASE_KEY: &str = "_graph";

/// Longest a single lease-record read-modify-write may wait on the record's
/// file lock.
const RECORD_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lock and lease failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock on {key} not acquired after {waited:?}")]
    Timeout {
        key: String,
        waited: Duration,
        holder: Option<String>,
    },

    #[error("lease on {key} held by {holder} has expired")]
    Expired { key: String, holder: String },

    #[error("lock I/O error at {}: {source}", .path.display())]
    IoError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::IoError {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug)]
struct FileGuard {
    file: File,
    path: PathBuf,
}

impl FileGuard {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let parent = path.parent().ok_or_else(|| {
            LockError::io(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "lock path has no parent"),
            )
        })?;
        fs::create_dir_all(parent).map_err(|e| LockError::io(parent, e))?;

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)
                .map_err(|e| LockError::io(path, e))?;

            if file.try_lock_exclusive().is_ok() {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    key: path.display().to_string(),
                    waited: start.elapsed(),
                    holder: None,
                });
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// RAII guard for an exclusive store-level lock.
#[derive(Debug)]
pub struct StoreLock {
    guard: FileGuard,
}

impl StoreLock {
    /// Acquire an exclusive advisory lock, polling until `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if another holder keeps the lock, or
    /// [`LockError::IoError`] if the lock file cannot be opened.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        Ok(Self {
            guard: FileGuard::acquire(path, timeout)?,
        })
    }

    /// Take the lock only if it is free right now.
    ///
    /// # Errors
    ///
    /// Same as [`StoreLock::acquire`] with a zero timeout.
    pub fn try_acquire(path: &Path) -> Result<Self, LockError> {
        Self::acquire(path, Duration::ZERO)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.guard.path
    }
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// On-disk lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Issues TTL leases keyed by work unit id (or [`GRAPH_LEASE_KEY`]).
#[derive(Debug, Clone)]
pub struct LeaseManager {
    dir: PathBuf,
    ttl: Duration,
}

impl LeaseManager {
    /// Leases live under `dir` and expire `ttl` after acquisition.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.lease"))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.lock"))
    }

    /// Acquire the lease on `key` for `holder`, waiting up to `timeout` for a
    /// live lease held by someone else to be released or to expire.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] naming the current holder when the
    /// lease stays taken, or [`LockError::IoError`] on filesystem failure.
    pub fn acquire(&self, key: &str, holder: &str, timeout: Duration) -> Result<Lease, LockError> {
        let start = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            let guard = FileGuard::acquire(&self.lock_path(key), remaining.min(RECORD_LOCK_TIMEOUT))
                .map_err(|err| match err {
                    LockError::Timeout { .. } => LockError::Timeout {
                        key: key.to_string(),
                        waited: start.elapsed(),
                        holder: None,
                    },
                    other => other,
                })?;

            let now = Utc::now();
            let current = self.read_record(key)?;
            let blocking_holder = match &current {
                Some(record) if !record.is_expired(now) => Some(record.holder.clone()),
                Some(record) => {
                    debug!(
                        lease = key,
                        previous_holder = %record.holder,
                        "reclaiming expired lease"
                    );
                    None
                }
                None => None,
            };

            if blocking_holder.is_none() {
                let record = LeaseRecord {
                    holder: holder.to_string(),
                    token: new_token(key, holder),
                    acquired_at: now,
                    expires_at: now + self.ttl_as_chrono(),
                };
                self.write_record(key, &record)?;
                drop(guard);
                debug!(lease = key, holder, "lease acquired");
                return Ok(Lease {
                    manager: self.clone(),
                    key: key.to_string(),
                    record,
                    released: false,
                });
            }
            drop(guard);

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: start.elapsed(),
                    holder: blocking_holder,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Current holder of `key`, if the lease is live.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::IoError`] if the record cannot be read.
    pub fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let now = Utc::now();
        Ok(self
            .read_record(key)?
            .filter(|record| !record.is_expired(now))
            .map(|record| record.holder))
    }

    fn ttl_as_chrono(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.ttl).unwrap_or(ChronoDuration::MAX)
    }

    fn read_record(&self, key: &str) -> Result<Option<LeaseRecord>, LockError> {
        let path = self.record_path(key);
        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(record) => Ok(Some(record)),
                Err(err) => {
                    // A torn record cannot name a live holder.
                    warn!(lease = key, error = %err, "discarding unreadable lease record");
                    Ok(None)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(LockError::io(&path, err)),
        }
    }

    /// Replace the record via rename so unlocked readers never see a torn
    /// file. Callers hold the key's record lock.
    fn write_record(&self, key: &str, record: &LeaseRecord) -> Result<(), LockError> {
        let path = self.record_path(key);
        let tmp = self.dir.join(format!("{key}.lease.tmp"));
        let json = serde_json::to_vec(record)
            .map_err(|e| LockError::io(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        fs::write(&tmp, json).map_err(|e| LockError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| LockError::io(&path, e))
    }

    fn remove_record_if(&self, key: &str, token: &str) -> Result<(), LockError> {
        let _guard = FileGuard::acquire(&self.lock_path(key), RECORD_LOCK_TIMEOUT)?;
        if let Some(record) = self.read_record(key)? {
            if record.token == token {
                let path = self.record_path(key);
                fs::remove_file(&path).map_err(|e| LockError::io(&path, e))?;
            }
        }
        Ok(())
    }
}

fn new_token(key: &str, holder: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(holder.as_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    hasher.update(&nanos.to_le_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

/// A held lease. Released when dropped.
#[derive(Debug)]
pub struct Lease {
    manager: LeaseManager,
    key: String,
    record: LeaseRecord,
    released: bool,
}

impl Lease {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.record.holder
    }

    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.record.expires_at
    }

    /// Confirm this lease is still the live record for its key.
    ///
    /// Called right before a commit: if the TTL ran out and another worker
    /// reclaimed the key, committing would break the per-unit total order.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Expired`] if the deadline passed or the record
    /// now belongs to another holder.
    pub fn ensure_valid(&self) -> Result<(), LockError> {
        let expired = || LockError::Expired {
            key: self.key.clone(),
            holder: self.record.holder.clone(),
        };
        if self.record.is_expired(Utc::now()) {
            return Err(expired());
        }
        match self.manager.read_record(&self.key)? {
            Some(current) if current.token == self.record.token => Ok(()),
            _ => Err(expired()),
        }
    }

    /// Push the deadline out by one TTL from now.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Expired`] if the lease was already lost.
    pub fn renew(&mut self) -> Result<(), LockError> {
        let _guard = FileGuard::acquire(&self.manager.lock_path(&self.key), RECORD_LOCK_TIMEOUT)?;
        self.ensure_valid()?;
        self.record.expires_at = Utc::now() + self.manager.ttl_as_chrono();
        self.manager.write_record(&self.key, &self.record)
    }

    /// Release explicitly. Also happens on drop.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::IoError`] if the record cannot be removed.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.manager.remove_record_if(&self.key, &self.record.token)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.manager.remove_record_if(&self.key, &self.record.token) {
            warn!(lease = %self.key, error = %err, "failed to release lease; it will expire");
        } else {
            debug!(lease = %self.key, "lease released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{GRAPH_LEASE_KEY, LeaseManager, LockError, StoreLock};
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };
    use tempfile::TempDir;

    fn manager(dir: &TempDir, ttl_ms: u64) -> LeaseManager {
        LeaseManager::new(dir.path().join("leases"), Duration::from_millis(ttl_ms))
    }

    #[test]
    fn store_lock_times_out_when_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.lock");
        let _guard = StoreLock::acquire(&path, Duration::from_millis(50)).unwrap();
        let err = StoreLock::try_acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[test]
    fn store_lock_release_allows_follow_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("migration.lock");
        {
            let lock = StoreLock::acquire(&path, Duration::from_millis(50)).unwrap();
            assert_eq!(lock.path(), path.as_path());
        }
        assert!(StoreLock::try_acquire(&path).is_ok());
    }

    #[test]
    fn lease_blocks_second_holder_and_names_first() {
        let dir = TempDir::new().unwrap();
        let leases = manager(&dir, 30_000);
        let first = leases.acquire("M1", "worker-a", Duration::from_millis(50)).unwrap();
        assert_eq!(first.holder(), "worker-a");

        let err = leases
            .acquire("M1", "worker-b", Duration::from_millis(30))
            .unwrap_err();
        match err {
            LockError::Timeout { key, holder, .. } => {
                assert_eq!(key, "M1");
                assert_eq!(holder.as_deref(), Some("worker-a"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(leases.holder("M1").unwrap().as_deref(), Some("worker-a"));
    }

    #[test]
    fn different_keys_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let leases = manager(&dir, 30_000);
        let _graph = leases
            .acquire(GRAPH_LEASE_KEY, "w", Duration::from_millis(50))
            .unwrap();
        let _unit = leases.acquire("M1", "w", Duration::from_millis(50)).unwrap();
        let _other = leases.acquire("M2", "w", Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn dropping_lease_releases_it() {
        let dir = TempDir::new().unwrap();
        let leases = manager(&dir, 30_000);
        {
            let _lease = leases.acquire("M1", "worker-a", Duration::from_millis(50)).unwrap();
        }
        assert!(leases.holder("M1").unwrap().is_none());
        let lease = leases.acquire("M1", "worker-b", Duration::from_millis(50)).unwrap();
        lease.release().unwrap();
    }

    #[test]
    fn expired_lease_is_reclaimed_and_invalidated() {
        let dir = TempDir::new().unwrap();
        let short = manager(&dir, 20);
        let long = manager(&dir, 30_000);
        let stale = short.acquire("M1", "worker-a", Duration::from_millis(50)).unwrap();
        thread::sleep(Duration::from_millis(40));

        let fresh = long.acquire("M1", "worker-b", Duration::from_millis(200)).unwrap();
        assert!(matches!(stale.ensure_valid(), Err(LockError::Expired { .. })));

        // The stale holder's drop must not remove the new record.
        drop(stale);
        fresh.ensure_valid().unwrap();
        assert_eq!(long.holder("M1").unwrap().as_deref(), Some("worker-b"));
    }

    #[test]
    fn renew_extends_deadline() {
        let dir = TempDir::new().unwrap();
        let leases = manager(&dir, 10_000);
        let mut lease = leases.acquire("M1", "w", Duration::from_millis(50)).unwrap();
        let before = lease.expires_at();
        thread::sleep(Duration::from_millis(5));
        lease.renew().unwrap();
        assert!(lease.expires_at() > before);
        lease.ensure_valid().unwrap();
    }

    #[test]
    fn waiter_acquires_after_holder_releases() {
        let dir = TempDir::new().unwrap();
        let leases = manager(&dir, 30_000);
        let held = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let (held_t, release_t, leases_t) =
            (Arc::clone(&held), Arc::clone(&release), leases.clone());
        let handle = thread::spawn(move || {
            let lease = leases_t.acquire("M1", "holder", Duration::from_millis(200)).unwrap();
            held_t.wait();
            release_t.wait();
            drop(lease);
        });

        held.wait();
        assert!(leases.acquire("M1", "waiter", Duration::from_millis(20)).is_err());
        release.wait();
        handle.join().unwrap();
        let lease = leases.acquire("M1", "waiter", Duration::from_millis(500)).unwrap();
        assert_eq!(lease.holder(), "waiter");
    }
}
