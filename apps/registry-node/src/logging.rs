use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Filter directive for `-v` counts: info, debug, trace.
fn verbosity_directive(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}

/// `-v` wins over `RUST_LOG`, which wins over `logging.level`.
fn build_filter(cfg: &LoggingConfig, verbose: u8) -> Result<EnvFilter> {
    if let Some(directive) = verbosity_directive(verbose) {
        return Ok(EnvFilter::new(directive));
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&cfg.level)
        .with_context(|| format!("invalid logging.level directive: {}", cfg.level))
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// machine-readable for `check` and `resolve`.
///
/// # Errors
/// Invalid filter directive or a subscriber already installed.
pub fn init_logging(cfg: &LoggingConfig, verbose: u8) -> Result<()> {
    let filter = build_filter(cfg, verbose)?;
    let registry = tracing_subscriber::registry().with(filter);
    match cfg.format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    }
    .context("failed to install tracing subscriber")
}
