//! Configuration system using TOML files.
//!
//! Config is stored in the OS-standard config directory:
//! - Windows: %APPDATA%\playhost\config.toml
//! - macOS: ~/Library/Application Support/playhost/config.toml
//! - Linux: ~/.config/playhost/config.toml
//!
//! Settings are loaded once at startup. A missing or broken file never
//! prevents the renderer from starting.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ResultExt;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Privileged context settings
    pub bridge: BridgeConfig,

    /// Renderer behaviour
    pub renderer: RendererConfig,

    /// Log output
    pub logging: LoggingConfig,
}

/// Privileged context settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Seconds a blocking call waits before the context is declared unresponsive
    pub blocking_timeout_secs: u64,

    /// Name of the thread spawned to run the main loop
    pub thread_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            blocking_timeout_secs: 30,
            thread_name: "main".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Blocking timeout as a duration.
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_secs(self.blocking_timeout_secs)
    }
}

/// Renderer behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Name announced to control points
    pub friendly_name: String,

    /// Seconds after a stop before exclusive control is released
    pub idle_timeout_secs: u64,

    /// Service reference type used for network sources
    pub service_type: u16,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            friendly_name: "Set-Top Media Renderer".to_string(),
            idle_timeout_secs: 5,
            service_type: 4097,
        }
    }
}

impl RendererConfig {
    /// Idle watchdog delay as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub filter: String,

    /// Append logs to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "playhost=debug".to_string(),
            file: None,
        }
    }
}

// ============================================================================
// Config File Operations
// ============================================================================

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("playhost"))
}

/// Get the full path to the config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Load configuration from the default location
///
/// Returns default config if file doesn't exist or can't be parsed.
/// Logs warnings but doesn't fail - we always return a usable config.
pub fn load() -> Config {
    let Some(path) = config_path() else {
        tracing::warn!("Could not determine config directory, using defaults");
        return Config::default();
    };
    load_from(&path)
}

/// Load configuration from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!("No config file found at {:?}, using defaults", path);
        return Config::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                tracing::error!("Failed to parse config file {:?}: {}", path, e);
                tracing::warn!("Using default configuration");
                Config::default()
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file {:?}: {}", path, e);
            Config::default()
        }
    }
}

/// Save configuration to `explicit`, or the default location when `None`.
///
/// Returns the path that was written.
pub fn save(config: &Config, explicit: Option<&Path>) -> crate::error::Result<PathBuf> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => config_path().ok_or(ConfigError::NoConfigDir)?,
    };
    save_to(config, &path).with_context(format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Save configuration to an explicit path
///
/// Creates the parent directory if it doesn't exist.
pub fn save_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::CreateDir(dir.to_path_buf(), e))?;
    }

    let contents = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;

    // Write atomically (write to temp, then rename)
    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &contents).map_err(|e| ConfigError::Write(temp_path.clone(), e))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| ConfigError::Rename(temp_path, path.to_path_buf(), e))?;

    tracing::info!("Saved config to {:?}", path);
    Ok(())
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to create config directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),

    #[error("Failed to write config to {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("Failed to rename temp file {0} to {1}: {2}")]
    Rename(PathBuf, PathBuf, std::io::Error),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[bridge]"));
        assert!(toml.contains("[renderer]"));
        assert!(toml.contains("[logging]"));
    }

    #[test]
    fn test_defaults_match_reference_timings() {
        let config = Config::default();
        assert_eq!(config.bridge.blocking_timeout(), Duration::from_secs(30));
        assert_eq!(config.renderer.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.renderer.service_type, 4097);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml = r#"
[renderer]
idle_timeout_secs = 12
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.renderer.idle_timeout_secs, 12);
        assert_eq!(config.renderer.service_type, 4097);
        assert_eq!(config.bridge.blocking_timeout_secs, 30);
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_save_reports_target_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();
        let path = blocker.join("config.toml");

        let err = save(&Config::default(), Some(&path)).unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("Failed to write"));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.renderer.friendly_name = "Living Room".to_string();
        config.logging.file = Some(PathBuf::from("/var/log/playhost.log"));

        save_to(&config, &path).unwrap();
        assert!(!path.with_extension("toml.tmp").exists());

        let loaded = load_from(&path);
        assert_eq!(loaded.renderer.friendly_name, "Living Room");
        assert_eq!(
            loaded.logging.file,
            Some(PathBuf::from("/var/log/playhost.log"))
        );
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is [not toml").unwrap();

        let loaded = load_from(&path);
        assert_eq!(loaded.bridge.thread_name, "main");
    }
}
