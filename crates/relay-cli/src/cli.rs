//! CLI command definitions using clap

use crate::output::OutputFormat;
use clap::{Parser, Subcommand};
use relay_kernel::DomainType;
use std::path::PathBuf;

/// Relay CLI - drive worker process pools from the command line
#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json, table)
    #[arg(short = 'o', long, global = true, default_value_t = OutputFormat::Json)]
    pub output: OutputFormat,

    /// Engine configuration file (yaml, toml, json, ini, ron, json5)
    #[arg(short = 'c', long, global = true, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Send one request to a worker and print its payload
    Exec {
        /// Worker domain (device, memory, model, inference, postprocessing, processing)
        #[arg(short, long)]
        domain: DomainType,

        /// Action name; bare names are qualified with the domain
        #[arg(short, long)]
        action: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,

        /// Request deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Run a batch of items against one action
    Batch {
        /// Worker domain
        #[arg(short, long)]
        domain: DomainType,

        /// Action name; bare names are qualified with the domain
        #[arg(short, long)]
        action: String,

        /// JSON file holding an array of payloads or `{item_id, payload}` objects
        #[arg(short, long)]
        items: PathBuf,

        /// Items in flight at once
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Extra attempts for a failed item
        #[arg(long, default_value_t = 0)]
        retries: u32,

        /// Cancel items not yet started after the first failure
        #[arg(long)]
        stop_on_first_error: bool,

        /// Per-item deadline in milliseconds
        #[arg(long)]
        item_timeout_ms: Option<u64>,
    },

    /// Print a domain's capability payload
    Capabilities {
        /// Worker domain
        #[arg(short, long)]
        domain: DomainType,
    },

    /// Warm up every pool and print its metrics
    #[command(alias = "metrics")]
    Status,
}
