//! The `pixelflow janitor` command: remove unreferenced thumbnails.

use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

use pixelflow_core::{Config, Janitor, MemoryMetadataStore};

use super::records::load_records;

/// Arguments for the `janitor` command.
#[derive(Args, Debug)]
pub struct JanitorArgs {
    /// Sharded thumbnail directory (defaults to storage.thumbnail_root)
    #[arg(short, long)]
    pub thumbnails: Option<PathBuf>,

    /// Records (JSONL) whose thumbnails must be kept
    #[arg(short, long)]
    pub records: PathBuf,

    /// Report what would be deleted without deleting anything
    #[arg(long)]
    pub dry_run: bool,
}

/// Execute the janitor command.
pub async fn execute(args: JanitorArgs, config: Config) -> anyhow::Result<()> {
    let root = match args.thumbnails.or(config.storage.thumbnail_root) {
        Some(root) => pixelflow_core::config::expand(&root),
        None => anyhow::bail!(
            "No thumbnail directory.\n\n  Hint: pass --thumbnails PATH or set storage.thumbnail_root."
        ),
    };
    if !root.is_dir() {
        anyhow::bail!("Thumbnail directory does not exist: {:?}", root);
    }
    if !args.records.exists() {
        // An empty record set would make every thumbnail look orphaned.
        anyhow::bail!("Records file does not exist: {:?}", args.records);
    }

    let metadata = Arc::new(MemoryMetadataStore::from_records(load_records(&args.records)?));
    let stats = Janitor::new(root, metadata)
        .dry_run(args.dry_run)
        .sweep()
        .await?;

    let verb = if args.dry_run { "Would delete" } else { "Deleted" };
    eprintln!(
        "{verb} {} of {} thumbnails ({} kept, {} unrelated files ignored)",
        stats.deleted, stats.scanned, stats.kept, stats.ignored
    );
    Ok(())
}
