//! Tracing subscriber setup.
//!
//! Everything goes to stderr; stdout is reserved for records. `RUST_LOG`
//! wins over the configured level when it is set.

use pixelflow_core::Config;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber: JSON lines or compact human output.
pub fn init(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let output = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(output.json()).init();
    } else {
        registry.with(output.with_target(false)).init();
    }
}

/// Apply the `[logging]` section, letting `--verbose` and `--json-logs` override it.
pub fn init_from_config(config: &Config, verbose: bool, json_logs: bool) {
    let level = effective_level(&config.logging.level, verbose);
    init(level, json_logs || config.logging.format == "json");
}

/// `--verbose` raises anything quieter than debug to debug; unknown levels fall back to info.
fn effective_level(configured: &str, verbose: bool) -> &str {
    match configured {
        "trace" | "debug" => configured,
        _ if verbose => "debug",
        "error" | "warn" | "info" => configured,
        _ => "info",
    }
}
