//! virtual-input daemon
//!
//! Loads the configuration, opens the output backend and feeds the configured
//! input devices into the engine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Handle;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};
use virtual_input::{source, InputContext};
use virtual_input_config::{BackendKind, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "virtual-inputd")]
#[command(about = "Virtual key input daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/virtual-input/config.kdl")]
    config: String,

    /// Log level, overriding the configuration (RUST_LOG wins over both)
    #[arg(short, long)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Start at info so configuration warnings are visible, then switch to the
    // configured level
    let from_env = EnvFilter::try_from_default_env().ok();
    let env_set = from_env.is_some();
    let (filter, filter_handle) =
        reload::Layer::new(from_env.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Expand tilde in config path
    let config_path: PathBuf = shellexpand::tilde(&args.config).into_owned().into();

    tracing::info!("Loading configuration from {}", config_path.display());

    let config = virtual_input_config::parse_config(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    if !env_set {
        let level = args.log_level.unwrap_or(config.global.log_level);
        filter_handle
            .reload(EnvFilter::new(level.as_filter()))
            .context("Failed to apply log level")?;
    }

    tracing::info!(
        "Loaded configuration with {} table(s), {} source(s), {} post-lookup document(s)",
        config.tables.len(),
        config.sources.len(),
        config.post_lookups.len()
    );

    if config.global.backend == BackendKind::Device && !nix::unistd::geteuid().is_root() {
        tracing::warn!(
            "Not running as root, {} may not be writable",
            config.global.locator.display()
        );
    }

    let mut context = InputContext::new(config);
    context
        .initialize(Handle::current())
        .context("Failed to initialize input context")?;

    let mut sources = Vec::new();
    match context.router() {
        Some(router) => {
            for source_config in &context.config().sources {
                let router = router.clone();
                let path = source_config.path.clone();
                let table = source_config.table.clone();
                let grab = source_config.grab;

                sources.push(tokio::spawn(async move {
                    if let Err(e) = source::run_source(&path, table.as_deref(), grab, router).await {
                        tracing::warn!("Input source {} stopped: {:#}", path.display(), e);
                    }
                }));
            }
        }
        None => tracing::warn!("No backend available, input sources not started"),
    }

    tracing::info!("virtual-input daemon running");

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                let loaded = context.reload_post_lookups();
                tracing::info!("SIGHUP: reloaded {} post-lookup document(s)", loaded);
            }
            _ = terminate.recv() => break,
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to wait for Ctrl-C")?;
                break;
            }
        }
    }

    tracing::info!("Shutting down...");

    for task in sources {
        task.abort();
    }
    context.deinitialize();

    Ok(())
}
