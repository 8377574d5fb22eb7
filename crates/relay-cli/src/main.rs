//! Relay CLI - run requests against pooled worker processes

mod cli;
mod commands;
mod output;

use anyhow::{Context, anyhow};
use clap::Parser;
use cli::{Cli, Commands};
use output::OutputFormat;
use relay_foundation::WorkerEngine;
use relay_kernel::config::EngineConfig;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for command output
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config, cli.command, cli.output))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        warn!("No --config given; using defaults with no worker program");
        return Ok(EngineConfig::default());
    };
    let path = path
        .to_str()
        .ok_or_else(|| anyhow!("config path is not valid UTF-8: {}", path.display()))?;
    EngineConfig::load(path).map_err(|report| anyhow!("{report:?}"))
}

async fn run(config: EngineConfig, command: Commands, format: OutputFormat) -> anyhow::Result<()> {
    let engine = WorkerEngine::new(config).context("invalid engine configuration")?;

    let outcome = tokio::select! {
        result = run_command(&engine, command, format) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted");
            Err(anyhow!("interrupted"))
        }
    };

    info!("Shutting down worker pools...");
    engine.shutdown().await;
    outcome
}

async fn run_command(engine: &WorkerEngine, command: Commands, format: OutputFormat) -> anyhow::Result<()> {
    match command {
        Commands::Exec {
            domain,
            action,
            data,
            timeout_ms,
        } => commands::exec::run(engine, domain, &action, &data, timeout_ms, format).await,

        Commands::Batch {
            domain,
            action,
            items,
            concurrency,
            retries,
            stop_on_first_error,
            item_timeout_ms,
        } => {
            let args = commands::batch::BatchArgs {
                domain,
                action: &action,
                items: &items,
                concurrency,
                retries,
                stop_on_first_error,
                item_timeout_ms,
            };
            commands::batch::run(engine, args, format).await
        }

        Commands::Capabilities { domain } => commands::capabilities::run(engine, domain, format).await,

        Commands::Status => commands::status::run(engine, format).await,
    }
}
