//! `ms init`: create a store directory with its config and first backend.

use crate::cmd::Context;
use crate::output::{pretty_kv, render};
use anyhow::Context as _;
use clap::Args;
use milestore_core::config::{self, CONFIG_FILE};
use milestore_core::router::MANIFEST_FILE;
use milestore_core::{BackendKind, Store};
use serde::Serialize;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Backend to start on. Ignored when the store already has a config.
    #[arg(long, value_parser = clap::value_parser!(BackendKind))]
    pub backend: Option<BackendKind>,
}

#[derive(Debug, Serialize)]
struct InitOutput {
    root: String,
    backend: BackendKind,
    created: bool,
    config: String,
}

pub fn run_init(args: &InitArgs, ctx: &Context) -> anyhow::Result<()> {
    let existed = ctx.root.join(MANIFEST_FILE).exists();

    if let Some(backend) = args.backend {
        if !ctx.root.join(CONFIG_FILE).exists() {
            std::fs::create_dir_all(&ctx.root)
                .with_context(|| format!("Failed to create {}", ctx.root.display()))?;
            let mut settings = config::load_config(&ctx.root)?;
            settings.storage.initial_backend = backend;
            config::write_default_config(&ctx.root, &settings)?;
        }
    }

    let store = Store::init(&ctx.root)?;
    let backend = store.backend_kind()?;
    if existed {
        tracing::debug!(root = %ctx.root.display(), "store already initialized");
    }

    let out = InitOutput {
        root: ctx.root.display().to_string(),
        backend,
        created: !existed,
        config: ctx.root.join(CONFIG_FILE).display().to_string(),
    };
    render(ctx.output, &out, |o, w| {
        if o.created {
            writeln!(w, "Initialized store at {}", o.root)?;
        } else {
            writeln!(w, "Store already initialized at {}", o.root)?;
        }
        pretty_kv(w, "Backend", o.backend.as_str())?;
        pretty_kv(w, "Config", &o.config)
    })
}
