//! Configuration and capability output.

use anyhow::Context;
use std::path::{Path, PathBuf};

use crate::config::{self, Config};
use crate::renderer;

/// Print the effective configuration, or where it lives.
///
/// With `write`, the effective configuration is saved to that location.
pub fn cmd_config(
    config: &Config,
    explicit: Option<&Path>,
    path_only: bool,
    write: bool,
) -> anyhow::Result<()> {
    if path_only {
        println!("{}", resolve_path(explicit)?.display());
        return Ok(());
    }

    if write {
        let path = config::save(config, explicit)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let text = toml::to_string_pretty(config).context("Failed to serialize configuration")?;
    print!("{}", text);
    Ok(())
}

fn resolve_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => config::config_path().context("No config directory on this platform"),
    }
}

/// Print one protocol info entry per line.
pub fn cmd_protocol_info() -> anyhow::Result<()> {
    for entry in renderer::protocol_info() {
        println!("{}", entry);
    }
    Ok(())
}
