//! Pixelflow CLI - broker-coordinated image ingestion.
//!
//! Pixelflow walks anchor directories, hashes every image (standard digests
//! and perceptual hashes), generates thumbnails, and keeps one metadata record
//! per file. All roles run in one process over an embedded broker.
//!
//! # Usage
//!
//! ```bash
//! # Ingest a directory, writing records as JSON Lines
//! pixelflow run --anchor photos=~/Pictures --output records.jsonl
//!
//! # Re-run incrementally from the previous records
//! pixelflow run --anchor photos=~/Pictures --records records.jsonl --output records.jsonl
//!
//! # Remove thumbnails no record references
//! pixelflow janitor --thumbnails ~/.cache/pixelflow/thumbnails --records records.jsonl
//!
//! # View configuration
//! pixelflow config show
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use pixelflow_core::Config;
use std::path::{Path, PathBuf};

mod cli;
mod logging;

/// Broker-coordinated image ingestion: digests, perceptual hashes, thumbnails.
#[derive(Parser, Debug)]
#[command(name = "pixelflow", version, about, propagate_version = true)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "PIXELFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Walk anchors and run every pipeline role until the work is done
    Run(cli::run::RunArgs),

    /// Delete thumbnails that no image record references
    Janitor(cli::janitor::JanitorArgs),

    /// View and manage configuration
    Config(cli::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging isn't up yet, so a bad config file is reported by anyhow alone.
    let config = load_config(cli.config.as_deref())?;
    logging::init_from_config(&config, cli.verbose, cli.json_logs);
    tracing::debug!("pixelflow {}", pixelflow_core::VERSION);

    match cli.command {
        Commands::Run(args) => cli::run::execute(args, config).await,
        Commands::Janitor(args) => cli::janitor::execute(args, config).await,
        Commands::Config(args) => cli::config::execute(args, config, cli.config).await,
    }
}

/// An explicit `--config` must exist; the default location may be absent.
fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    match explicit {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Config::load()
            .with_context(|| format!("Invalid config at {}", Config::default_path().display())),
    }
}
