//! playhost - media renderer playback controller.
//!
//! The binary inspects configuration and runs the controller against the
//! simulated hardware backend.

use anyhow::Context;
use clap::Parser;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use playhost::cli;
use playhost::config::{self, LoggingConfig};

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let config = match &args.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    };

    init_logging(&config.logging)?;
    tracing::debug!(?config, "Effective configuration");

    cli::run_command(&args, &config)
}

/// Initialize logging. `RUST_LOG` wins over the configured filter.
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .with_context(|| format!("Invalid log filter {:?}", logging.filter))?;
    let registry = tracing_subscriber::registry().with(filter);

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        None => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
    Ok(())
}
