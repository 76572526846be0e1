use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::backend::{BackendKind, BackendOptions};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub scale: ScaleConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl LeaseConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_catch_up_timeout_ms")]
    pub catch_up_timeout_ms: u64,
    #[serde(default = "default_verification_timeout_ms")]
    pub verification_timeout_ms: u64,
    /// How long a decommissioned backend is kept before `sweep` deletes it.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Pause between catch-up rounds that still found lag.
    #[serde(default = "default_catch_up_poll_ms")]
    pub catch_up_poll_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            catch_up_timeout_ms: default_catch_up_timeout_ms(),
            verification_timeout_ms: default_verification_timeout_ms(),
            grace_period_secs: default_grace_period_secs(),
            catch_up_poll_ms: default_catch_up_poll_ms(),
        }
    }
}

impl MigrationConfig {
    #[must_use]
    pub const fn catch_up_timeout(&self) -> Duration {
        Duration::from_millis(self.catch_up_timeout_ms)
    }

    #[must_use]
    pub const fn verification_timeout(&self) -> Duration {
        Duration::from_millis(self.verification_timeout_ms)
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    #[must_use]
    pub const fn catch_up_poll(&self) -> Duration {
        Duration::from_millis(self.catch_up_poll_ms)
    }
}

/// Backend selection thresholds. Each tier has a higher bound to move up
/// and a lower bound to move back down, so a count hovering around one
/// bound does not flap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleConfig {
    #[serde(default = "default_hybrid_up_documents")]
    pub hybrid_up_documents: usize,
    #[serde(default = "default_hybrid_down_documents")]
    pub hybrid_down_documents: usize,
    #[serde(default = "default_database_up_documents")]
    pub database_up_documents: usize,
    #[serde(default = "default_database_down_documents")]
    pub database_down_documents: usize,
    #[serde(default = "default_database_up_writers")]
    pub database_up_writers: usize,
    #[serde(default = "default_true")]
    pub allow_downgrade: bool,
    #[serde(default = "default_writer_window_secs")]
    pub writer_window_secs: u64,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            hybrid_up_documents: default_hybrid_up_documents(),
            hybrid_down_documents: default_hybrid_down_documents(),
            database_up_documents: default_database_up_documents(),
            database_down_documents: default_database_down_documents(),
            database_up_writers: default_database_up_writers(),
            allow_downgrade: default_true(),
            writer_window_secs: default_writer_window_secs(),
        }
    }
}

impl ScaleConfig {
    #[must_use]
    pub const fn writer_window(&self) -> Duration {
        Duration::from_secs(self.writer_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_initial_backend")]
    pub initial_backend: BackendKind,
    /// fsync documents, logs and databases on every commit.
    #[serde(default)]
    pub durable: bool,
    #[serde(default = "default_read_page_size")]
    pub read_page_size: usize,
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    /// `feed.jsonl` rotates once it reaches this size.
    #[serde(default = "default_feed_max_bytes")]
    pub feed_max_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            initial_backend: default_initial_backend(),
            durable: false,
            read_page_size: default_read_page_size(),
            subscriber_capacity: default_subscriber_capacity(),
            feed_max_bytes: default_feed_max_bytes(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            durable: self.storage.durable,
            writer_window: self.scale.writer_window(),
        }
    }

    /// Reject settings the store cannot run with.
    ///
    /// # Errors
    ///
    /// Describes the first inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scale;
        if s.hybrid_down_documents >= s.hybrid_up_documents {
            bail!(
                "scale.hybrid_down_documents ({}) must be below scale.hybrid_up_documents ({})",
                s.hybrid_down_documents,
                s.hybrid_up_documents
            );
        }
        if s.database_down_documents >= s.database_up_documents {
            bail!(
                "scale.database_down_documents ({}) must be below scale.database_up_documents ({})",
                s.database_down_documents,
                s.database_up_documents
            );
        }
        if s.database_up_documents <= s.hybrid_up_documents {
            bail!("scale.database_up_documents must exceed scale.hybrid_up_documents");
        }
        if self.lease.ttl_ms == 0 {
            bail!("lease.ttl_ms must be positive");
        }
        if self.storage.read_page_size == 0 {
            bail!("storage.read_page_size must be positive");
        }
        if self.storage.feed_max_bytes == 0 {
            bail!("storage.feed_max_bytes must be positive");
        }
        Ok(())
    }
}

/// Load `<root>/config.toml`, falling back to defaults when it is absent.
///
/// # Errors
///
/// Unreadable or unparsable file, or settings rejected by
/// [`StoreConfig::validate`].
pub fn load_config(root: &Path) -> Result<StoreConfig> {
    let path = root.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(StoreConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<StoreConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid settings in {}", path.display()))?;
    Ok(config)
}

/// Write `config` to `<root>/config.toml` unless a file is already there.
///
/// # Errors
///
/// Serialization or write failures.
pub fn write_default_config(root: &Path, config: &StoreConfig) -> Result<bool> {
    let path = root.join(CONFIG_FILE);
    if path.exists() {
        return Ok(false);
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

const fn default_true() -> bool {
    true
}

const fn default_ttl_ms() -> u64 {
    30_000
}

const fn default_acquire_timeout_ms() -> u64 {
    5_000
}

const fn default_catch_up_timeout_ms() -> u64 {
    10_000
}

const fn default_verification_timeout_ms() -> u64 {
    30_000
}

const fn default_grace_period_secs() -> u64 {
    3_600
}

const fn default_catch_up_poll_ms() -> u64 {
    20
}

const fn default_hybrid_up_documents() -> usize {
    25
}

const fn default_hybrid_down_documents() -> usize {
    15
}

const fn default_database_up_documents() -> usize {
    100
}

const fn default_database_down_documents() -> usize {
    80
}

const fn default_database_up_writers() -> usize {
    8
}

const fn default_writer_window_secs() -> u64 {
    300
}

const fn default_initial_backend() -> BackendKind {
    BackendKind::FlatFile
}

const fn default_read_page_size() -> usize {
    256
}

const fn default_subscriber_capacity() -> usize {
    1024
}

const fn default_feed_max_bytes() -> u64 {
    crate::broker::DEFAULT_FEED_MAX_BYTES
}
