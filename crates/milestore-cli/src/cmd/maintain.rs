//! Maintenance commands: `recompute`, `repair` and `purge`.

use crate::cmd::{Context, parse_id};
use crate::output::{pretty_kv, render};
use clap::{ArgGroup, Args};
use milestore_core::WorkUnitId;
use milestore_core::event::RecomputeReport;
use serde::Serialize;
use std::time::Duration;

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("scope").required(true).args(["id", "all"])))]
pub struct RecomputeArgs {
    /// Work unit to recompute.
    pub id: Option<String>,

    /// Recompute every unit that is not archived.
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct PurgeArgs {
    /// Only purge units archived at least this many days ago.
    #[arg(long, default_value_t = 30)]
    pub older_than_days: u64,
}

#[derive(Debug, Serialize)]
struct RecomputeRow {
    id: WorkUnitId,
    stored_percent: u8,
    recorded_percent: Option<u8>,
    computed_percent: u8,
    document_repaired: bool,
    correction_sequence: Option<u64>,
}

impl From<RecomputeReport> for RecomputeRow {
    fn from(report: RecomputeReport) -> Self {
        Self {
            id: report.work_unit_id,
            stored_percent: report.stored_percent,
            recorded_percent: report.recorded_percent,
            computed_percent: report.computed_percent,
            document_repaired: report.document_repaired,
            correction_sequence: report.correction.map(|event| event.sequence),
        }
    }
}

pub fn run_recompute(args: &RecomputeArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let reports = match &args.id {
        Some(raw) => vec![store.recompute(&parse_id(raw)?, &ctx.writer)?],
        None => store.recompute_all(&ctx.writer)?,
    };
    let rows: Vec<RecomputeRow> = reports.into_iter().map(RecomputeRow::from).collect();

    render(ctx.output, &rows, |rows, w| {
        let fixed = rows
            .iter()
            .filter(|r| r.document_repaired || r.correction_sequence.is_some())
            .count();
        for row in rows {
            let mark = match (row.document_repaired, row.correction_sequence) {
                (_, Some(seq)) => format!("corrected at #{seq}"),
                (true, None) => "document rewritten".to_string(),
                (false, None) => "ok".to_string(),
            };
            writeln!(
                w,
                "{:<20} {:>3}% -> {:>3}%  {mark}",
                row.id.as_str(),
                row.stored_percent,
                row.computed_percent
            )?;
        }
        writeln!(w, "{} checked, {fixed} repaired", rows.len())
    })
}

#[derive(Debug, Serialize)]
struct RepairOutput {
    torn_writes_repaired: usize,
    needs_rebuild: Vec<WorkUnitId>,
    warnings: Vec<String>,
}

pub fn run_repair(ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let health = store.repair()?;
    for (path, offset) in &health.torn_write_repairs {
        tracing::info!(path = %path.display(), offset, "torn write truncated");
    }
    let out = RepairOutput {
        torn_writes_repaired: health.torn_write_repairs.len(),
        needs_rebuild: health.needs_rebuild,
        warnings: health.warnings,
    };

    render(ctx.output, &out, |o, w| {
        pretty_kv(w, "Torn writes", o.torn_writes_repaired.to_string())?;
        if !o.needs_rebuild.is_empty() {
            let ids: Vec<&str> = o.needs_rebuild.iter().map(WorkUnitId::as_str).collect();
            pretty_kv(w, "Needs rebuild", ids.join(", "))?;
        }
        for warning in &o.warnings {
            writeln!(w, "warning: {warning}")?;
        }
        Ok(())
    })
}

#[derive(Debug, Serialize)]
struct PurgeOutput {
    purged: Vec<WorkUnitId>,
}

pub fn run_purge(args: &PurgeArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let age = Duration::from_secs(args.older_than_days.saturating_mul(24 * 60 * 60));
    let out = PurgeOutput {
        purged: store.purge_archived(age, &ctx.writer)?,
    };

    render(ctx.output, &out, |o, w| {
        if o.purged.is_empty() {
            return writeln!(w, "Nothing to purge.");
        }
        for id in &o.purged {
            writeln!(w, "Purged {id}")?;
        }
        Ok(())
    })
}
