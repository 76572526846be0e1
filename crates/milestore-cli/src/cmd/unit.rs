//! Write commands: create a work unit and append lifecycle events to it.

use crate::cmd::{Context, parse_id};
use crate::output::{pretty_kv, render};
use anyhow::bail;
use clap::Args;
use milestore_core::event::Committed;
use milestore_core::{PhaseSpec, Status, WorkUnit, WorkUnitId};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Human-readable title.
    pub title: String,

    /// Phase as `name:weight`, in execution order. Weights must sum to 1.
    #[arg(long = "phase", required = true, value_parser = parse_phase)]
    pub phases: Vec<PhaseSpec>,

    /// Work unit this one depends on. Repeatable.
    #[arg(long = "depends-on")]
    pub depends_on: Vec<String>,

    /// Explicit id instead of a derived `ms-…` one.
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(Args, Debug)]
pub struct PhaseArgs {
    pub id: String,
    pub phase: String,
}

#[derive(Args, Debug)]
pub struct CompleteArgs {
    pub id: String,
    pub phase: String,

    /// Deliverable produced by the phase. Repeatable.
    #[arg(long = "deliverable")]
    pub deliverables: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ProgressArgs {
    pub id: String,
    pub phase: String,

    /// Completed fraction of the phase, between 0 and 1.
    #[arg(value_parser = parse_fraction)]
    pub fraction: f64,
}

#[derive(Args, Debug)]
pub struct BlockArgs {
    pub id: String,

    /// Blocker key, used again to resolve it.
    pub blocker: String,

    #[arg(long, default_value = "")]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct UnblockArgs {
    pub id: String,
    pub blocker: String,
}

#[derive(Args, Debug)]
pub struct DependArgs {
    /// The dependent unit.
    pub id: String,
    /// The unit it waits on.
    pub depends_on: String,
}

#[derive(Args, Debug)]
pub struct ArchiveArgs {
    pub id: String,

    #[arg(long)]
    pub reason: Option<String>,
}

fn parse_phase(raw: &str) -> Result<PhaseSpec, String> {
    let (name, weight) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("expected name:weight, got '{raw}'"))?;
    let weight: f64 = weight
        .trim()
        .parse()
        .map_err(|_| format!("invalid weight in '{raw}'"))?;
    if name.trim().is_empty() {
        return Err(format!("missing phase name in '{raw}'"));
    }
    Ok(PhaseSpec::new(name.trim(), weight))
}

fn parse_fraction(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .parse()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("fraction must be between 0 and 1, got {value}"))
    }
}

/// Summary of one write, shared by every write command.
#[derive(Debug, Serialize)]
pub struct WriteOutput {
    pub id: WorkUnitId,
    pub sequence: u64,
    pub events: Vec<String>,
    pub status: Status,
    pub progress_percent: u8,
}

impl WriteOutput {
    fn from_committed(committed: &Committed) -> Self {
        Self {
            id: committed.document.id.clone(),
            sequence: committed.document.last_sequence,
            events: committed
                .events
                .iter()
                .map(|e| e.kind.as_str().to_string())
                .collect(),
            status: committed.document.status,
            progress_percent: committed.document.progress_percent,
        }
    }

    fn from_document(doc: &WorkUnit) -> Self {
        Self {
            id: doc.id.clone(),
            sequence: doc.last_sequence,
            events: vec!["created".to_string()],
            status: doc.status,
            progress_percent: doc.progress_percent,
        }
    }
}

fn render_write(ctx: &Context, out: &WriteOutput, verb: &str) -> anyhow::Result<()> {
    render(ctx.output, out, |o, w| {
        writeln!(w, "{verb} {}", o.id)?;
        pretty_kv(w, "Status", o.status.as_str())?;
        pretty_kv(w, "Progress", format!("{}%", o.progress_percent))?;
        pretty_kv(w, "Sequence", o.sequence.to_string())
    })
}

fn render_committed(ctx: &Context, committed: &Committed, verb: &str) -> anyhow::Result<()> {
    render_write(ctx, &WriteOutput::from_committed(committed), verb)
}

pub fn run_create(args: &CreateArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let deps = args
        .depends_on
        .iter()
        .map(|raw| parse_id(raw))
        .collect::<anyhow::Result<BTreeSet<_>>>()?;

    let doc = match &args.id {
        Some(raw) => store.create_work_unit_with_id(
            &parse_id(raw)?,
            &args.title,
            args.phases.clone(),
            deps,
            &ctx.writer,
        )?,
        None => store.create_work_unit(&args.title, args.phases.clone(), deps, &ctx.writer)?,
    };
    render_write(ctx, &WriteOutput::from_document(&doc), "Created")
}

pub fn run_start(args: &PhaseArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let committed = store.start_phase(&parse_id(&args.id)?, &args.phase, &ctx.writer)?;
    render_committed(ctx, &committed, "Started phase of")
}

pub fn run_complete(args: &CompleteArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let deliverables = args.deliverables.iter().cloned().collect();
    let committed =
        store.complete_phase(&parse_id(&args.id)?, &args.phase, deliverables, &ctx.writer)?;
    render_committed(ctx, &committed, "Completed phase of")
}

pub fn run_progress(args: &ProgressArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let committed =
        store.report_progress(&parse_id(&args.id)?, &args.phase, args.fraction, &ctx.writer)?;
    render_committed(ctx, &committed, "Reported progress on")
}

pub fn run_block(args: &BlockArgs, ctx: &Context) -> anyhow::Result<()> {
    if args.blocker.trim().is_empty() {
        bail!("blocker key must not be empty");
    }
    let store = ctx.open_store()?;
    let committed =
        store.raise_blocker(&parse_id(&args.id)?, &args.blocker, &args.reason, &ctx.writer)?;
    render_committed(ctx, &committed, "Blocked")
}

pub fn run_unblock(args: &UnblockArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let committed = store.resolve_blocker(&parse_id(&args.id)?, &args.blocker, &ctx.writer)?;
    render_committed(ctx, &committed, "Unblocked")
}

pub fn run_depend(args: &DependArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let target = parse_id(&args.depends_on)?;
    let committed = store.add_dependency(&parse_id(&args.id)?, &target, &ctx.writer)?;
    render_committed(ctx, &committed, "Added dependency to")
}

pub fn run_archive(args: &ArchiveArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let committed = store.archive(&parse_id(&args.id)?, args.reason.clone(), &ctx.writer)?;
    render_committed(ctx, &committed, "Archived")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_specs_parse_name_and_weight() {
        let spec = parse_phase("design:0.25").unwrap();
        assert_eq!(spec.name, "design");
        assert!((spec.weight - 0.25).abs() < f64::EPSILON);

        let spec = parse_phase("phase:two:0.5").unwrap();
        assert_eq!(spec.name, "phase:two");

        assert!(parse_phase("design").is_err());
        assert!(parse_phase(":0.5").is_err());
        assert!(parse_phase("design:lots").is_err());
    }

    #[test]
    fn fractions_are_bounded() {
        assert!(parse_fraction("0").is_ok());
        assert!(parse_fraction("1").is_ok());
        assert!(parse_fraction("1.5").is_err());
        assert!(parse_fraction("-0.1").is_err());
        assert!(parse_fraction("half").is_err());
    }
}
