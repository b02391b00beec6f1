//! Application-wide error types.
//!
//! Library modules use specific error types via `thiserror`, while the
//! CLI/main uses `anyhow` for convenient error propagation.
//!
//! # Design
//!
//! - [`Error`]: Top-level error enum
//! - Subsystem errors ([`BridgeError`], [`ConfigError`]) for detailed handling
//! - Only [`Error::Bridge`] is fatal. Hardware and source failures never
//!   reach callers; the controller logs them and degrades
//!
//! # Example
//!
//! ```ignore
//! use playhost::error::{Error, Result};
//!
//! fn query(controller: &Controller) -> Result<()> {
//!     let position = controller.current_position()?; // bridge errors auto-convert
//!     Ok(())
//! }
//! ```

use crate::bridge::BridgeError;
use crate::config::ConfigError;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error.
///
/// Aggregates errors from all subsystems for unified handling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The privileged context did not answer (fatal, never retried)
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether this error means the privileged context is gone.
    ///
    /// Callers must not retry a fatal error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Bridge(_) => true,
            Self::WithContext { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Add context to an error.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        Self::WithContext {
            context: ctx.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn with_context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, ConfigError> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Config(e).context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, BridgeError> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Bridge(e).context(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bridge_error_is_fatal() {
        let err = Error::from(BridgeError::Unresponsive {
            timeout: Duration::from_secs(30),
        });
        assert!(err.is_fatal());
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_fatal_survives_context() {
        let err = Error::from(BridgeError::Closed).context("while seeking");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("while seeking"));
    }

    #[test]
    fn test_config_error_not_fatal() {
        let err = Error::from(ConfigError::NoConfigDir).context("saving");
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("saving"));
    }

    #[test]
    fn test_result_ext() {
        let result: std::result::Result<(), BridgeError> = Err(BridgeError::Closed);
        let with_ctx = result.with_context("querying position");
        assert!(with_ctx.unwrap_err().to_string().contains("querying position"));
    }
}
