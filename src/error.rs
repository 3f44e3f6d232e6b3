//! Error types for the Security Token Service

use std::io;

use thiserror::Error;

use crate::exchange::KeyError;

/// Result type alias for the Security Token Service
pub type Result<T> = std::result::Result<T, Error>;

/// Service-level errors (startup, configuration, server lifecycle).
///
/// Per-request failures never surface as this type; they are classified by
/// [`crate::exchange::ExchangeError`] instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing key lifecycle error
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// Trusted issuer could not be loaded
    #[error("Trust configuration error: {0}")]
    Trust(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
