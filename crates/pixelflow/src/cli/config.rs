//! The `pixelflow config` command.

use clap::{Args, Subcommand};
use pixelflow_core::Config;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,

    /// Print the config file location
    Path,

    /// List configured anchors and whether their roots exist
    Check,

    /// Write a config file containing the defaults
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

/// `config` has already been loaded and validated by `main`; `explicit` is
/// the `--config` path, if any.
pub async fn execute(
    args: ConfigArgs,
    config: Config,
    explicit: Option<PathBuf>,
) -> anyhow::Result<()> {
    let path = explicit.unwrap_or_else(Config::default_path);
    match args.command {
        ConfigCommand::Show => println!("{}", config.to_toml()?),
        ConfigCommand::Path => println!("{}", path.display()),
        ConfigCommand::Check => {
            let missing = check_anchors(&config);
            if missing > 0 {
                anyhow::bail!("{missing} anchor root(s) are not directories");
            }
        }
        ConfigCommand::Init { force } => {
            write_defaults(&path, force)?;
            tracing::info!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

/// Print one line per anchor; returns how many roots are missing.
fn check_anchors(config: &Config) -> usize {
    if config.loader.anchors.is_empty() {
        println!("no anchors configured");
    }
    let mut missing = 0;
    for (name, root) in &config.loader.anchors {
        let root = pixelflow_core::config::expand(root);
        let state = if root.is_dir() {
            "ok"
        } else {
            missing += 1;
            "missing"
        };
        println!("{name:<16} {state:<8} {}", root.display());
    }
    missing
}

fn write_defaults(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists.\n\n  Hint: pass --force to replace it.",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, Config::default().to_toml()?)?;
    Ok(())
}
