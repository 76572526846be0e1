//! `ms submit-view`: hand a planning or execution view to the state bridge.

use crate::cmd::Context;
use crate::output::{pretty_kv, render};
use anyhow::Context as _;
use clap::{Args, ValueEnum};
use milestore_core::bridge::{SubmitOutcome, ViewKind};
use milestore_core::{Status, WorkUnit, WorkUnitId};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ViewArg {
    Planning,
    Execution,
}

impl From<ViewArg> for ViewKind {
    fn from(arg: ViewArg) -> Self {
        match arg {
            ViewArg::Planning => Self::Planning,
            ViewArg::Execution => Self::Execution,
        }
    }
}

#[derive(Args, Debug)]
pub struct SubmitViewArgs {
    /// Which collaborator produced the view.
    #[arg(value_enum)]
    pub kind: ViewArg,

    /// JSON work-unit document, or `-` for stdin.
    pub file: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum SubmitOutput {
    Pending {
        id: WorkUnitId,
        waiting_for: ViewKind,
    },
    Reconciled {
        id: WorkUnitId,
        sequence: u64,
        status: Status,
        progress_percent: u8,
    },
}

fn read_view(path: &Path) -> anyhow::Result<WorkUnit> {
    let mut raw = String::new();
    if path.as_os_str() == "-" {
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read view from stdin")?;
    } else {
        raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
    }
    serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a work-unit document", path.display()))
}

pub fn run_submit_view(args: &SubmitViewArgs, ctx: &Context) -> anyhow::Result<()> {
    let view = read_view(&args.file)?;
    let store = ctx.open_store()?;
    let outcome = match ViewKind::from(args.kind) {
        ViewKind::Planning => store.submit_planning_view(&view, &ctx.writer)?,
        ViewKind::Execution => store.submit_execution_view(&view, &ctx.writer)?,
    };

    let out = match outcome {
        SubmitOutcome::Pending { waiting_for } => SubmitOutput::Pending {
            id: view.id,
            waiting_for,
        },
        SubmitOutcome::Reconciled(committed) => SubmitOutput::Reconciled {
            id: committed.document.id,
            sequence: committed.document.last_sequence,
            status: committed.document.status,
            progress_percent: committed.document.progress_percent,
        },
    };

    render(ctx.output, &out, |o, w| match o {
        SubmitOutput::Pending { id, waiting_for } => {
            writeln!(w, "Stored view of {id}; waiting for the {waiting_for} view")
        }
        SubmitOutput::Reconciled {
            id,
            sequence,
            status,
            progress_percent,
        } => {
            writeln!(w, "Reconciled {id}")?;
            pretty_kv(w, "Status", status.as_str())?;
            pretty_kv(w, "Progress", format!("{progress_percent}%"))?;
            pretty_kv(w, "Sequence", sequence.to_string())
        }
    })
}
