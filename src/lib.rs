//! Security Token Service Library
//!
//! OAuth 2.0 Token Exchange (RFC 8693) with rotating, JWKS-published signing
//! keys.
//!
//! # Features
//!
//! - **Token Exchange**: verify a subject (and optional actor) token from a
//!   trusted issuer and mint a narrower token for another audience
//! - **Down-scoping**: the issued scope is always a subset of the subject's
//! - **Delegation**: nested `act` claims with a bounded chain depth
//! - **Key Rotation**: PENDING, ACTIVE, RETIRED lifecycle with a grace period
//!   so consumers see new keys before they sign
//! - **Revocation**: compromised keys leave the published set immediately
//!
//! # Layout
//!
//! - [`exchange`]: verifier, policy, minter, key manager and HTTP handlers
//! - [`config`]: YAML + environment configuration
//! - [`server`]: listener, background key tasks, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
