#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{CliError, OutputMode, render_error};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "ms: operate a milestore work-unit state store",
    long_about = None
)]
struct Cli {
    /// Store directory.
    #[arg(long, global = true, env = "MILESTORE_ROOT", default_value = ".milestore")]
    root: PathBuf,

    /// Writer identity recorded on appended events.
    #[arg(long, global = true, env = "MILESTORE_WRITER")]
    writer: Option<String>,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    const fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }

    fn writer(&self) -> String {
        self.writer
            .clone()
            .unwrap_or_else(|| format!("ms-{}", std::process::id()))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Store",
        about = "Initialize a store",
        after_help = "EXAMPLES:\n    ms init\n    ms --root /srv/milestones init --backend embedded-database"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Write",
        about = "Create a work unit",
        after_help = "EXAMPLES:\n    ms create \"Ship v2\" --phase design:0.3 --phase build:0.7\n    ms create \"Docs\" --phase write:1 --depends-on ms-1a2b3c --json"
    )]
    Create(cmd::unit::CreateArgs),

    #[command(next_help_heading = "Write", about = "Mark a phase as started")]
    Start(cmd::unit::PhaseArgs),

    #[command(next_help_heading = "Write", about = "Mark a phase as completed")]
    Complete(cmd::unit::CompleteArgs),

    #[command(
        next_help_heading = "Write",
        about = "Report partial completion of a phase",
        after_help = "EXAMPLES:\n    ms progress ms-1a2b3c build 0.5"
    )]
    Progress(cmd::unit::ProgressArgs),

    #[command(next_help_heading = "Write", about = "Raise a blocker on a work unit")]
    Block(cmd::unit::BlockArgs),

    #[command(next_help_heading = "Write", about = "Resolve a blocker")]
    Unblock(cmd::unit::UnblockArgs),

    #[command(next_help_heading = "Write", about = "Add a dependency edge")]
    Depend(cmd::unit::DependArgs),

    #[command(next_help_heading = "Write", about = "Archive a work unit")]
    Archive(cmd::unit::ArchiveArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show one work unit with its phase breakdown"
    )]
    Show(cmd::read::ShowArgs),

    #[command(
        next_help_heading = "Read",
        about = "List work units",
        after_help = "EXAMPLES:\n    ms list\n    ms list --status active\n    ms list --depends-on ms-1a2b3c --json"
    )]
    List(cmd::read::ListArgs),

    #[command(next_help_heading = "Read", about = "Print a work unit's event log")]
    Events(cmd::read::EventsArgs),

    #[command(
        next_help_heading = "Read",
        about = "Follow committed events from all processes"
    )]
    Watch(cmd::read::WatchArgs),

    #[command(
        next_help_heading = "Scale",
        about = "Show backend metrics and the monitor's decision"
    )]
    Scale,

    #[command(
        next_help_heading = "Scale",
        about = "Migrate to another backend",
        after_help = "EXAMPLES:\n    # Follow the monitor's decision\n    ms migrate --auto\n\n    # Force a backend\n    ms migrate --to indexed-hybrid"
    )]
    Migrate(cmd::scale::MigrateArgs),

    #[command(
        next_help_heading = "Scale",
        about = "Delete retired backends past their grace period"
    )]
    Sweep,

    #[command(
        next_help_heading = "Maintenance",
        about = "Replay events and repair stored documents and totals"
    )]
    Recompute(cmd::maintain::RecomputeArgs),

    #[command(
        next_help_heading = "Maintenance",
        about = "Repair what crashed writers left in the active backend"
    )]
    Repair,

    #[command(
        next_help_heading = "Maintenance",
        about = "Physically remove old archived work units"
    )]
    Purge(cmd::maintain::PurgeArgs),

    #[command(
        next_help_heading = "Reconciliation",
        about = "Submit a planning or execution view",
        after_help = "EXAMPLES:\n    ms submit-view planning plan.json\n    ms submit-view execution exec.json --json"
    )]
    SubmitView(cmd::view::SubmitViewArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MILESTORE_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "milestore=debug,info"
        } else {
            "milestore=info,warn"
        })
    });

    let format = env::var("MILESTORE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let ctx = cmd::Context {
        root: cli.root.clone(),
        writer: cli.writer(),
        output: cli.output_mode(),
    };
    match &cli.command {
        Commands::Init(args) => cmd::init::run_init(args, &ctx),
        Commands::Create(args) => cmd::unit::run_create(args, &ctx),
        Commands::Start(args) => cmd::unit::run_start(args, &ctx),
        Commands::Complete(args) => cmd::unit::run_complete(args, &ctx),
        Commands::Progress(args) => cmd::unit::run_progress(args, &ctx),
        Commands::Block(args) => cmd::unit::run_block(args, &ctx),
        Commands::Unblock(args) => cmd::unit::run_unblock(args, &ctx),
        Commands::Depend(args) => cmd::unit::run_depend(args, &ctx),
        Commands::Archive(args) => cmd::unit::run_archive(args, &ctx),
        Commands::Show(args) => cmd::read::run_show(args, &ctx),
        Commands::List(args) => cmd::read::run_list(args, &ctx),
        Commands::Events(args) => cmd::read::run_events(args, &ctx),
        Commands::Watch(args) => cmd::read::run_watch(args, &ctx),
        Commands::Scale => cmd::scale::run_scale(&ctx),
        Commands::Migrate(args) => cmd::scale::run_migrate(args, &ctx),
        Commands::Sweep => cmd::scale::run_sweep(&ctx),
        Commands::Recompute(args) => cmd::maintain::run_recompute(args, &ctx),
        Commands::Repair => cmd::maintain::run_repair(&ctx),
        Commands::Purge(args) => cmd::maintain::run_purge(args, &ctx),
        Commands::SubmitView(args) => cmd::view::run_submit_view(args, &ctx),
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = render_error(cli.output_mode(), &CliError::from(&err));
            ExitCode::FAILURE
        }
    }
}
