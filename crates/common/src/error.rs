//! Workspace-wide error types
//!
//! Only failures shared across the workspace live here: loading and
//! validating the gateway's TOML configuration. Per-request failures
//! carry more structure and stay in the gateway; session-lifecycle
//! failures stay behind the driver trait.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Shorthand for a validation failure found after parsing.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

/// Result alias using the common Error
pub type Result<T> = std::result::Result<T, Error>;
