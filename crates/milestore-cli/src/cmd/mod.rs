//! Subcommand implementations. Each module owns its clap `Args` and a
//! `run_*` entry point that renders through [`crate::output`].

pub mod init;
pub mod maintain;
pub mod read;
pub mod scale;
pub mod unit;
pub mod view;

use crate::output::OutputMode;
use anyhow::Context as _;
use milestore_core::{Store, WorkUnitId};
use std::path::PathBuf;

/// Global flags every command sees.
#[derive(Debug, Clone)]
pub struct Context {
    pub root: PathBuf,
    pub writer: String,
    pub output: OutputMode,
}

impl Context {
    /// Open the store at `--root`.
    pub fn open_store(&self) -> anyhow::Result<Store> {
        Ok(Store::open(&self.root)?)
    }
}

/// Parse a work-unit id argument.
pub fn parse_id(raw: &str) -> anyhow::Result<WorkUnitId> {
    WorkUnitId::parse(raw).with_context(|| format!("invalid work unit id '{raw}'"))
}
