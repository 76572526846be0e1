use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::BackendKind;
use crate::graph::cycles::CycleWarning;
use crate::lock::LockError;
use crate::model::WorkUnitId;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    WorkUnitNotFound,
    AlreadyExists,
    InvalidEvent,
    CycleDetected,
    IrreconcilableState,
    Conflict,
    LeaseTimeout,
    LeaseExpired,
    CatchUpTimeout,
    VerificationTimeout,
    MigrationVerificationFailed,
    MigrationCancelled,
    StorageIo,
    CorruptStore,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::WorkUnitNotFound => "E2001",
            Self::AlreadyExists => "E2002",
            Self::InvalidEvent => "E2003",
            Self::CycleDetected => "E2004",
            Self::IrreconcilableState => "E2005",
            Self::Conflict => "E3001",
            Self::LeaseTimeout => "E3002",
            Self::LeaseExpired => "E3003",
            Self::CatchUpTimeout => "E4001",
            Self::VerificationTimeout => "E4002",
            Self::MigrationVerificationFailed => "E4003",
            Self::MigrationCancelled => "E4004",
            Self::StorageIo => "E5001",
            Self::CorruptStore => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Store not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::WorkUnitNotFound => "Work unit not found",
            Self::AlreadyExists => "Work unit already exists",
            Self::InvalidEvent => "Event rejected by projection rules",
            Self::CycleDetected => "Dependency cycle would be created",
            Self::IrreconcilableState => "Planning and execution views cannot be merged",
            Self::Conflict => "Optimistic concurrency conflict",
            Self::LeaseTimeout => "Lease acquisition timed out",
            Self::LeaseExpired => "Lease expired before commit",
            Self::CatchUpTimeout => "Dual-write catch-up did not converge",
            Self::VerificationTimeout => "Migration verification timed out",
            Self::MigrationVerificationFailed => "Migration verification found divergence",
            Self::MigrationCancelled => "Migration cancelled",
            Self::StorageIo => "Storage I/O failure",
            Self::CorruptStore => "Corrupt store data",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `ms init` to initialize the store directory."),
            Self::ConfigParseError => Some("Fix syntax in config.toml and retry."),
            Self::WorkUnitNotFound => None,
            Self::AlreadyExists => Some("Pick a different id or append to the existing unit."),
            Self::InvalidEvent => {
                Some("Re-read the document and send an event valid for its state.")
            }
            Self::CycleDetected => Some("Remove/adjust dependency links to keep the graph acyclic."),
            Self::IrreconcilableState => {
                Some("Resolve the views manually and resubmit them to the bridge.")
            }
            Self::Conflict => Some("Re-read the work unit and retry with the new sequence token."),
            Self::LeaseTimeout => Some("Retry with backoff; another worker holds the lease."),
            Self::LeaseExpired => Some("The lease TTL is shorter than the operation; retry."),
            Self::CatchUpTimeout => {
                Some("Retry the migration when write volume is lower or raise the timeout.")
            }
            Self::VerificationTimeout => Some("Raise migration.verification_timeout_ms and retry."),
            Self::MigrationVerificationFailed => {
                Some("The source backend stays authoritative; inspect the divergent queries.")
            }
            Self::MigrationCancelled => None,
            Self::StorageIo => Some("Check disk space and write permissions."),
            Self::CorruptStore => Some("Run `ms recompute` or restore the damaged file."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Every failure an operation on the store can report.
///
/// Each variant carries enough context (work unit, sequence numbers,
/// backend) to be acted on without reading logs.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(
        "conflict on {work_unit}: expected last sequence {}, found {} ({backend})",
        fmt_seq(.expected),
        fmt_seq(.actual)
    )]
    Conflict {
        work_unit: WorkUnitId,
        expected: Option<u64>,
        actual: Option<u64>,
        backend: BackendKind,
    },

    #[error("lease on {key} not acquired after {waited:?}{}", holder_suffix(.holder))]
    LeaseTimeout {
        key: String,
        waited: Duration,
        holder: Option<String>,
    },

    #[error("lease on {key} held by {holder} expired before commit")]
    LeaseExpired { key: String, holder: String },

    #[error("catch-up from {from} to {to} did not converge within {waited:?} ({lagging} units lagging)")]
    CatchUpTimeout {
        from: BackendKind,
        to: BackendKind,
        lagging: usize,
        waited: Duration,
    },

    #[error("verification of {from} -> {to} did not finish within {waited:?}")]
    VerificationTimeout {
        from: BackendKind,
        to: BackendKind,
        waited: Duration,
    },

    #[error("migration {from} -> {to} rolled back: {} divergent queries ({})", .divergences.len(), .divergences.join(", "))]
    MigrationVerificationFailed {
        from: BackendKind,
        to: BackendKind,
        divergences: Vec<String>,
    },

    #[error("migration {from} -> {to} cancelled during {stage}")]
    MigrationCancelled {
        from: BackendKind,
        to: BackendKind,
        stage: &'static str,
    },

    #[error("cannot reconcile {work_unit}: {reason}")]
    IrreconcilableState { work_unit: WorkUnitId, reason: String },

    #[error("dependency rejected on {work_unit}: {cycle}")]
    CycleDetected {
        work_unit: WorkUnitId,
        cycle: CycleWarning,
    },

    #[error("no store at {}", .root.display())]
    NotInitialized { root: PathBuf },

    #[error("invalid config {}: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },

    #[error("work unit {work_unit} not found ({backend})")]
    NotFound {
        work_unit: WorkUnitId,
        backend: BackendKind,
    },

    #[error("work unit {work_unit} already exists")]
    AlreadyExists { work_unit: WorkUnitId },

    #[error("invalid event #{sequence} for {work_unit}: {reason}")]
    InvalidEvent {
        work_unit: WorkUnitId,
        sequence: u64,
        reason: String,
    },

    #[error("corrupt data in {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("sqlite error ({backend}): {source}")]
    Sqlite {
        backend: BackendKind,
        #[source]
        source: rusqlite::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn fmt_seq(seq: &Option<u64>) -> String {
    seq.map_or_else(|| "none".to_string(), |s| s.to_string())
}

fn holder_suffix(holder: &Option<String>) -> String {
    holder
        .as_deref()
        .map_or_else(String::new, |h| format!(" (held by {h})"))
}

impl StoreError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Conflict { .. } => ErrorCode::Conflict,
            Self::LeaseTimeout { .. } => ErrorCode::LeaseTimeout,
            Self::LeaseExpired { .. } => ErrorCode::LeaseExpired,
            Self::CatchUpTimeout { .. } => ErrorCode::CatchUpTimeout,
            Self::VerificationTimeout { .. } => ErrorCode::VerificationTimeout,
            Self::MigrationVerificationFailed { .. } => ErrorCode::MigrationVerificationFailed,
            Self::MigrationCancelled { .. } => ErrorCode::MigrationCancelled,
            Self::IrreconcilableState { .. } => ErrorCode::IrreconcilableState,
            Self::CycleDetected { .. } => ErrorCode::CycleDetected,
            Self::NotInitialized { .. } => ErrorCode::NotInitialized,
            Self::Config { .. } => ErrorCode::ConfigParseError,
            Self::NotFound { .. } => ErrorCode::WorkUnitNotFound,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::InvalidEvent { .. } => ErrorCode::InvalidEvent,
            Self::Corrupt { .. } | Self::Serde(_) => ErrorCode::CorruptStore,
            Self::Io { .. } | Self::Sqlite { .. } => ErrorCode::StorageIo,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Whether retrying the same call later can succeed without operator
    /// intervention.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::LeaseTimeout { .. }
                | Self::LeaseExpired { .. }
                | Self::CatchUpTimeout { .. }
                | Self::VerificationTimeout { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn sqlite(backend: BackendKind) -> impl Fn(rusqlite::Error) -> Self {
        move |source| Self::Sqlite { backend, source }
    }
}

impl From<LockError> for StoreError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout {
                key,
                waited,
                holder,
            } => Self::LeaseTimeout {
                key,
                waited,
                holder,
            },
            LockError::Expired { key, holder } => Self::LeaseExpired { key, holder },
            LockError::IoError { path, source } => Self::Io { path, source },
        }
    }
}

/// Attach a path to `io::Result` failures.
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> Result<T, StoreError>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &std::path::Path) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::io(path, source))
    }
}
