//! The `pixelflow run` command: every role in one process.

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pixelflow_core::{Config, Environment, Generation, MemoryMetadataStore, Pipeline, WalkStats};

use super::records::{load_records, write_records};

/// Message encoding selectable on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CodecArg {
    Structured,
    Legacy,
}

impl From<CodecArg> for Generation {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::Structured => Generation::Structured,
            CodecArg::Legacy => Generation::Legacy,
        }
    }
}

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Anchor to walk as NAME=PATH (repeatable; adds to the configured anchors)
    #[arg(short, long = "anchor", value_parser = parse_anchor)]
    pub anchors: Vec<(String, PathBuf)>,

    /// Walk only this anchor
    #[arg(long)]
    pub only: Option<String>,

    /// Subtree of --only to walk
    #[arg(long, requires = "only")]
    pub subtree: Option<String>,

    /// Existing records (JSONL) to resume from
    #[arg(short, long)]
    pub records: Option<PathBuf>,

    /// Where to write records (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Workers per stage (0 = available CPU parallelism)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Loader publication rate in messages per second
    #[arg(long)]
    pub rate_limit: Option<f64>,

    /// Thumbnail size in pixels (longest edge)
    #[arg(long)]
    pub thumbnail_size: Option<u32>,

    /// Do not request thumbnails
    #[arg(long)]
    pub no_thumbnails: bool,

    /// Message encoding
    #[arg(long, value_enum)]
    pub codec: Option<CodecArg>,

    /// Use isolated (prefixed, auto-deleted) queue names
    #[arg(long)]
    pub isolated: bool,

    /// Seconds to wait for the pipeline to drain after the walk
    #[arg(long, default_value = "600")]
    pub timeout: u64,
}

/// Parse `NAME=PATH`, expanding a leading `~`.
fn parse_anchor(value: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got {value:?}"))?;
    let name = name.trim();
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected NAME=PATH, got {value:?}"));
    }
    let path = PathBuf::from(shellexpand::tilde(path).into_owned());
    Ok((name.to_string(), path))
}

/// Fold command-line overrides into the loaded config and re-validate it.
fn apply_overrides(args: &RunArgs, mut config: Config) -> anyhow::Result<Config> {
    for (name, path) in &args.anchors {
        if !path.is_dir() {
            anyhow::bail!(
                "Anchor {name} does not point to a directory: {:?}\n\n  Hint: Check the path and try again.",
                path
            );
        }
        config.loader.anchors.insert(name.clone(), path.clone());
    }
    if let Some(workers) = args.workers {
        config.workers.count = workers;
    }
    if let Some(rate) = args.rate_limit {
        config.loader.rate_limit = rate;
    }
    if let Some(size) = args.thumbnail_size {
        config.thumbnail.size = size;
    }
    if args.no_thumbnails {
        config.loader.generate_thumbnails = false;
    }
    if let Some(codec) = args.codec {
        config.general.codec = codec.into();
    }
    if args.isolated {
        config.general.environment = Environment::Isolated;
    }
    config.validate()?;

    if config.loader.anchors.is_empty() {
        anyhow::bail!(
            "No anchors to walk.\n\n  Hint: pass --anchor NAME=PATH or add [loader.anchors] to the config file."
        );
    }
    if let Some(only) = &args.only {
        if !config.loader.anchors.contains_key(only) {
            anyhow::bail!("Unknown anchor: {only}");
        }
    }
    Ok(config)
}

/// Execute the run command.
pub async fn execute(args: RunArgs, config: Config) -> anyhow::Result<()> {
    let config = apply_overrides(&args, config)?;
    let seed = match &args.records {
        Some(path) => load_records(path)?,
        None => Vec::new(),
    };
    let metadata = Arc::new(MemoryMetadataStore::from_records(seed));

    let mut pipeline = Pipeline::new(config, metadata.clone())?;
    pipeline.start_workers()?;

    let start_time = Instant::now();
    let loader = Arc::clone(pipeline.loader());
    let walk = async {
        match &args.only {
            Some(anchor) => {
                let subtree = args.subtree.as_deref().unwrap_or("");
                loader.walk(anchor, subtree, true).await.map_err(anyhow::Error::from)
            }
            None => Ok(loader.walk_all().await),
        }
    };
    let stats = tokio::select! {
        stats = walk => stats?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping the walk");
            loader.cancel();
            WalkStats::default()
        }
    };

    let drained = pipeline.wait_idle(Duration::from_secs(args.timeout)).await;
    let stages = pipeline.shutdown().await;
    let elapsed = start_time.elapsed();

    let records = metadata.all_records();
    write_records(args.output.as_deref(), &records)?;

    print_summary(&stats, records.len(), elapsed);
    for (stage, stage_stats) in &stages {
        if stage_stats.rejected + stage_stats.dropped > 0 {
            tracing::warn!(
                "{stage}: {} messages dropped, {} rejected",
                stage_stats.dropped,
                stage_stats.rejected
            );
        }
    }
    if !drained {
        anyhow::bail!(
            "Pipeline did not drain within {}s; records may be incomplete",
            args.timeout
        );
    }
    Ok(())
}

/// Print a formatted summary table after the run.
fn print_summary(stats: &WalkStats, records: usize, elapsed: Duration) {
    eprintln!();
    eprintln!("  ====================================");
    eprintln!("               Summary");
    eprintln!("  ====================================");
    eprintln!("    Files seen:   {:>8}", stats.seen);
    eprintln!("    New records:  {:>8}", stats.created);
    eprintln!("    Jobs sent:    {:>8}", stats.published);
    eprintln!("    Up to date:   {:>8}", stats.complete);
    if stats.too_large > 0 {
        eprintln!("    Too large:    {:>8}", stats.too_large);
    }
    if stats.failed > 0 {
        eprintln!("    Failed:       {:>8}", stats.failed);
    }
    eprintln!("  ------------------------------------");
    eprintln!("    Records:      {:>8}", records);
    eprintln!("    Duration:     {:>7.1}s", elapsed.as_secs_f64());
    eprintln!("  ====================================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: RunArgs,
    }

    fn parse(argv: &[&str]) -> RunArgs {
        Harness::parse_from(std::iter::once("run").chain(argv.iter().copied())).args
    }

    #[test]
    fn test_parse_anchor() {
        assert_eq!(
            parse_anchor("photos=/srv/photos").unwrap(),
            ("photos".to_string(), PathBuf::from("/srv/photos"))
        );
        assert_eq!(
            parse_anchor("a=b=c").unwrap(),
            ("a".to_string(), PathBuf::from("b=c"))
        );
        assert!(parse_anchor("photos").is_err());
        assert!(parse_anchor("=/srv").is_err());
        assert!(parse_anchor("photos=").is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let dir = tempfile::tempdir().unwrap();
        let anchor = format!("photos={}", dir.path().display());
        let args = parse(&[
            "--anchor",
            &anchor,
            "--workers",
            "3",
            "--rate-limit",
            "12.5",
            "--codec",
            "legacy",
            "--isolated",
            "--no-thumbnails",
        ]);
        let config = apply_overrides(&args, Config::default()).unwrap();
        assert_eq!(config.loader.anchors["photos"], dir.path());
        assert_eq!(config.workers.count, 3);
        assert_eq!(config.loader.rate_limit, 12.5);
        assert_eq!(config.general.codec, Generation::Legacy);
        assert_eq!(config.general.environment, Environment::Isolated);
        assert!(!config.loader.generate_thumbnails);
    }

    #[test]
    fn test_overrides_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let anchor = format!("photos={}", dir.path().display());
        let args = parse(&["--anchor", &anchor, "--rate-limit", "0"]);
        assert!(apply_overrides(&args, Config::default()).is_err());
    }

    #[test]
    fn test_requires_an_anchor() {
        let args = parse(&[]);
        assert!(apply_overrides(&args, Config::default()).is_err());
    }

    #[test]
    fn test_only_must_name_an_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let anchor = format!("photos={}", dir.path().display());
        let args = parse(&["--anchor", &anchor, "--only", "videos"]);
        assert!(apply_overrides(&args, Config::default()).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_writes_records() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        image::DynamicImage::new_rgb8(40, 30)
            .save(images.join("one.png"))
            .unwrap();
        let output = dir.path().join("records.jsonl");
        let anchor = format!("photos={}", images.display());
        let output_arg = output.display().to_string();
        let args = parse(&[
            "--anchor",
            &anchor,
            "--output",
            &output_arg,
            "--isolated",
            "--workers",
            "1",
            "--rate-limit",
            "1000",
            "--timeout",
            "20",
        ]);

        execute(args, Config::default()).await.unwrap();
        let records = load_records(&output).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].relative_path, "one.png");
        assert!(records[0].hashes.contains_key("SHA-256"));
        assert!(records[0].thumbnail.is_some());
    }
}
