//! Command-line interface for playhost.
//!
//! Inspects the configuration and drives the controller against the
//! simulated hardware backend without a real tuner.

mod commands;

pub use commands::{Cli, Commands, run_command};
