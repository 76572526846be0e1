//! milestore-core library.
//!
//! An event-sourced state store for multi-phase work units. The append-only
//! event log is the source of truth; documents are projections of it, stored
//! in one of three interchangeable backends that the migration engine can
//! swap online as the store grows.
//!
//! # Conventions
//!
//! - **Errors**: operations return [`error::StoreError`]; setup paths
//!   (opening a store, loading config) use `anyhow::Result`.
//! - **Logging**: use `tracing` macros with structured fields
//!   (`work_unit`, `sequence`, `backend`, `writer`).

#![forbid(unsafe_code)]

pub mod backend;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod lock;
pub mod metrics;
pub mod migrate;
pub mod model;
pub mod monitor;
pub mod progress;
pub mod projection;
pub mod recovery;
pub mod router;
pub mod store;

pub use backend::{BackendKind, StorageBackend};
pub use error::{ErrorCode, StoreError};
pub use event::{Event, EventKind, EventPayload, Expected};
pub use model::{Phase, PhaseSpec, PhaseStatus, Status, WorkUnit, WorkUnitId};
pub use store::Store;
