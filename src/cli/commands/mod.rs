//! CLI command definitions and dispatch.
//!
//! Each subcommand is implemented in its own submodule:
//! - `settings`: configuration and protocol info output
//! - `simulate`: a full play cycle against simulated hardware

mod settings;
mod simulate;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

pub use settings::{cmd_config, cmd_protocol_info};
pub use simulate::{SimulateOptions, cmd_simulate};

/// playhost CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Use this configuration file instead of the default location
    #[arg(long, global = true, env = "PLAYHOST_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective configuration
    Config {
        /// Print the config file location instead
        #[arg(long, conflicts_with = "write")]
        path: bool,
        /// Write the effective configuration to the config file
        #[arg(long)]
        write: bool,
    },
    /// Print the sink protocol info advertised to control points
    ProtocolInfo,
    /// Play a source on simulated hardware and report what happened
    Simulate {
        /// Media URI to play
        uri: String,
        /// DIDL-Lite metadata file describing the source
        #[arg(short, long)]
        metadata: Option<PathBuf>,
        /// Seek to this position (seconds) once playing
        #[arg(long)]
        seek: Option<u64>,
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Run the specified CLI command.
pub fn run_command(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Config { path, write } => {
            cmd_config(config, cli.config.as_deref(), *path, *write)
        }
        Commands::ProtocolInfo => cmd_protocol_info(),
        Commands::Simulate {
            uri,
            metadata,
            seek,
            json,
        } => cmd_simulate(
            config,
            &SimulateOptions {
                uri: uri.clone(),
                metadata: metadata.clone(),
                seek: *seek,
                json: *json,
            },
        ),
    }
}
