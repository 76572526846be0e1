//! Scale commands: inspect the monitor, migrate between backends, sweep
//! retired storage.

use crate::cmd::Context;
use crate::output::{pretty_kv, pretty_section, render};
use chrono::Utc;
use clap::{ArgGroup, Args};
use milestore_core::BackendKind;
use milestore_core::migrate::MigrationReport;
use milestore_core::monitor::ScaleDecision;
use milestore_core::router::StoreManifest;
use serde::Serialize;

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("target").required(true).args(["to", "auto"])))]
pub struct MigrateArgs {
    /// Backend to move to, regardless of thresholds.
    #[arg(long, value_parser = clap::value_parser!(BackendKind))]
    pub to: Option<BackendKind>,

    /// Migrate only if the scale monitor asks for it.
    #[arg(long)]
    pub auto: bool,
}

#[derive(Debug, Serialize)]
struct ScaleOutput {
    decision: ScaleDecision,
    manifest: StoreManifest,
}

pub fn run_scale(ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let out = ScaleOutput {
        decision: store.scale_decision()?,
        manifest: store.router().manifest(),
    };

    render(ctx.output, &out, |o, w| {
        let m = &o.decision.metrics;
        pretty_section(w, "Backend")?;
        pretty_kv(w, "Active", o.manifest.active.kind.as_str())?;
        pretty_kv(w, "Generation", o.manifest.generation.to_string())?;
        if let Some(mirror) = &o.manifest.mirror {
            pretty_kv(w, "Mirror", format!("{} ({})", mirror.kind, mirror.dir))?;
        }
        pretty_kv(w, "Documents", m.document_count.to_string())?;
        pretty_kv(w, "Writers", m.writer_count.to_string())?;
        pretty_kv(w, "Avg write", format!("{}us", m.avg_write_latency_us))?;
        pretty_kv(w, "Decision", o.decision.to_string())?;
        if !o.manifest.retired.is_empty() {
            writeln!(w)?;
            writeln!(w, "Retired:")?;
            for retired in &o.manifest.retired {
                writeln!(
                    w,
                    "  {} delete after {}",
                    retired.backend.dir,
                    retired.delete_after.format("%Y-%m-%d %H:%M:%S")
                )?;
            }
        }
        Ok(())
    })
}

#[derive(Debug, Serialize)]
struct MigrateOutput {
    migrated: bool,
    backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<MigrationReport>,
}

pub fn run_migrate(args: &MigrateArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let report = match args.to {
        Some(target) => store.migrate_to(target)?,
        None => store.auto_scale()?,
    };
    let out = MigrateOutput {
        migrated: report.is_some(),
        backend: store.backend_kind()?,
        report,
    };

    render(ctx.output, &out, |o, w| {
        let Some(report) = &o.report else {
            return writeln!(w, "No migration needed; staying on {}", o.backend);
        };
        writeln!(w, "Migrated {} -> {}", report.from, report.to)?;
        pretty_kv(w, "Units", report.units.to_string())?;
        pretty_kv(w, "Bulk events", report.events_loaded.to_string())?;
        pretty_kv(
            w,
            "Caught up",
            format!(
                "{} events in {} rounds",
                report.events_caught_up, report.catch_up_rounds
            ),
        )?;
        pretty_kv(w, "Verified", format!("{} queries", report.verified_queries))?;
        pretty_kv(w, "Elapsed", format!("{}ms", report.elapsed_ms))?;
        pretty_kv(
            w,
            "Retired",
            format!(
                "{} (delete after {})",
                report.retired.dir,
                report.delete_after.format("%Y-%m-%d %H:%M:%S")
            ),
        )
    })
}

pub fn run_sweep(ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let report = store.sweep_retired(Utc::now())?;

    render(ctx.output, &report, |r, w| {
        if r.retired_removed.is_empty() && r.orphans_removed.is_empty() {
            return writeln!(w, "Nothing to sweep.");
        }
        for backend in &r.retired_removed {
            writeln!(w, "Removed retired {} ({})", backend.dir, backend.kind)?;
        }
        for orphan in &r.orphans_removed {
            writeln!(w, "Removed orphan {orphan}")?;
        }
        Ok(())
    })
}
