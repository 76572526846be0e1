//! Read commands: `show`, `list`, `events` and `watch`.

use crate::cmd::{Context, parse_id};
use crate::output::{pretty_kv, pretty_rule, pretty_section, render};
use clap::Args;
use milestore_core::broker::SubscriptionFilter;
use milestore_core::graph::DependencyGraph;
use milestore_core::progress::PhaseContribution;
use milestore_core::{Event, EventKind, Status, WorkUnit, WorkUnitId};
use serde::Serialize;
use std::io::{self, Write};
use std::time::{Duration, Instant};

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only units in this status.
    #[arg(long, value_parser = clap::value_parser!(Status))]
    pub status: Option<Status>,

    /// Only units that depend on this id.
    #[arg(long = "depends-on", conflicts_with = "status")]
    pub depends_on: Option<String>,

    /// Only units whose dependencies are all completed.
    #[arg(long, conflicts_with_all = ["status", "depends_on"])]
    pub ready: bool,
}

#[derive(Args, Debug)]
pub struct EventsArgs {
    pub id: String,

    /// First sequence number to print.
    #[arg(long, default_value_t = 0)]
    pub from: u64,

    /// Stop after this many events.
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Only events for this work unit.
    #[arg(long)]
    pub unit: Option<String>,

    /// Only events of this kind. Repeatable.
    #[arg(long = "kind", value_parser = clap::value_parser!(EventKind))]
    pub kinds: Vec<EventKind>,

    /// Exit after this many events.
    #[arg(long)]
    pub count: Option<usize>,

    /// Exit after this many seconds without reaching `--count`.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

const WATCH_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize)]
struct ShowOutput {
    #[serde(flatten)]
    document: WorkUnit,
    breakdown: Vec<PhaseContribution>,
    dependents: Vec<WorkUnitId>,
}

pub fn run_show(args: &ShowArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let id = parse_id(&args.id)?;
    let document = store.require_document(&id)?;
    let out = ShowOutput {
        breakdown: store.phase_breakdown(&id)?,
        dependents: store
            .query_by_dependency(&id)?
            .into_iter()
            .map(|doc| doc.id)
            .collect(),
        document,
    };

    render(ctx.output, &out, |o, w| {
        let doc = &o.document;
        pretty_section(w, &format!("{}  {}", doc.id, doc.title))?;
        pretty_kv(w, "Status", doc.status.as_str())?;
        pretty_kv(w, "Progress", format!("{}%", doc.progress_percent))?;
        pretty_kv(w, "Created", doc.created_at.format("%Y-%m-%d %H:%M:%S").to_string())?;
        pretty_kv(w, "Updated", doc.updated_at.format("%Y-%m-%d %H:%M:%S").to_string())?;
        pretty_kv(w, "Sequence", doc.last_sequence.to_string())?;
        if doc.reconciled {
            pretty_kv(w, "Reconciled", "yes")?;
        }
        if !doc.dependencies.is_empty() {
            pretty_kv(w, "Depends on", join_ids(doc.dependencies.iter()))?;
        }
        if !o.dependents.is_empty() {
            pretty_kv(w, "Needed by", join_ids(o.dependents.iter()))?;
        }

        writeln!(w)?;
        writeln!(
            w,
            "{:<16} {:>6} {:<10} {:>6} {:>8}",
            "PHASE", "WEIGHT", "STATUS", "DONE", "SHARE"
        )?;
        pretty_rule(w)?;
        for row in &o.breakdown {
            writeln!(
                w,
                "{:<16} {:>6.2} {:<10} {:>5.0}% {:>7.1}%",
                row.name,
                row.weight,
                row.status.as_str(),
                row.fraction * 100.0,
                row.contribution * 100.0
            )?;
        }

        if !doc.blockers.is_empty() {
            writeln!(w)?;
            writeln!(w, "Blockers:")?;
            for (key, reason) in &doc.blockers {
                writeln!(w, "  {key}: {reason}")?;
            }
        }
        Ok(())
    })
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a WorkUnitId>) -> String {
    ids.map(WorkUnitId::as_str).collect::<Vec<_>>().join(", ")
}

pub fn run_list(args: &ListArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let docs = if let Some(status) = args.status {
        store.query_by_status(status)?
    } else if let Some(raw) = &args.depends_on {
        store.query_by_dependency(&parse_id(raw)?)?
    } else if args.ready {
        let all = store.list_documents()?;
        let ready: Vec<WorkUnitId> = DependencyGraph::from_documents(&all)
            .ready_units()
            .into_iter()
            .cloned()
            .collect();
        all.into_iter().filter(|doc| ready.contains(&doc.id)).collect()
    } else {
        store.list_documents()?
    };

    render(ctx.output, &docs, |docs, w| {
        if docs.is_empty() {
            return writeln!(w, "No work units.");
        }
        writeln!(w, "{:<20} {:<10} {:>5}  TITLE", "ID", "STATUS", "DONE")?;
        pretty_rule(w)?;
        for doc in docs {
            writeln!(
                w,
                "{:<20} {:<10} {:>4}%  {}",
                doc.id.as_str(),
                doc.status.as_str(),
                doc.progress_percent,
                doc.title
            )?;
        }
        Ok(())
    })
}

pub fn run_events(args: &EventsArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let id = parse_id(&args.id)?;
    // Reading an unknown unit yields an empty stream; report it instead.
    store.require_document(&id)?;

    let stream = store.read_from(&id, args.from)?;
    let events = match args.limit {
        Some(limit) => stream.take(limit).collect::<Result<Vec<Event>, _>>()?,
        None => stream.collect::<Result<Vec<Event>, _>>()?,
    };

    render(ctx.output, &events, |events, w| {
        for event in events {
            writeln!(w, "{event}")?;
        }
        Ok(())
    })
}

pub fn run_watch(args: &WatchArgs, ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    let filter = match &args.unit {
        Some(raw) => SubscriptionFilter::unit(parse_id(raw)?),
        None => SubscriptionFilter::all(),
    }
    .with_kinds(args.kinds.iter().copied());
    let mut cursor = store.follow_feed(filter)?;

    let deadline = args
        .timeout_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut seen = 0usize;
    let stdout = io::stdout();

    loop {
        for notice in cursor.poll()? {
            let mut out = stdout.lock();
            if ctx.output.is_json() {
                writeln!(out, "{}", serde_json::to_string(&notice)?)?;
            } else {
                writeln!(
                    out,
                    "{}  {:<20} #{:<5} {:<18} {}",
                    notice.timestamp.format("%H:%M:%S"),
                    notice.work_unit_id.as_str(),
                    notice.sequence,
                    notice.kind.as_str(),
                    notice.writer_id
                )?;
            }
            out.flush()?;
            seen += 1;
            if args.count.is_some_and(|count| seen >= count) {
                return Ok(());
            }
        }
        if deadline.is_some_and(|at| Instant::now() >= at) {
            tracing::debug!(seen, "watch timed out");
            return Ok(());
        }
        std::thread::sleep(WATCH_POLL);
    }
}
