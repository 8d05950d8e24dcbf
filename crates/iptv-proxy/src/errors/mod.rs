//! Error type definitions for the IPTV proxy.
//!
//! Failures below the byte-delivery point are recovered locally by the
//! orchestrator's retry loop and never surface as `Err` values; this module
//! only defines the errors crossing component seams.

use thiserror::Error;

/// Errors produced while establishing an upstream connection.
///
/// These are attempt-local: the orchestrator reacts by advancing to the
/// next candidate source, so none of them reach the client directly.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Connection not established within the provider's connect timeout
    #[error("connect timeout after {timeout_ms}ms: {url}")]
    Timeout { url: String, timeout_ms: u64 },

    /// Upstream answered with a non-success status
    #[error("upstream status {status}: {url}")]
    Status { url: String, status: u16 },

    /// Transport-level failure (refused, reset, TLS, DNS)
    #[error("upstream transport error: {url}: {message}")]
    Transport { url: String, message: String },
}

/// The client side of a relay went away; writes can no longer succeed.
///
/// Not an error in the taxonomy sense: it terminates the request silently.
#[derive(Error, Debug)]
#[error("client sink closed")]
pub struct SinkClosed;

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] figment::Error),

    #[error("invalid configuration: {message}")]
    Invalid { message: String },

    #[error(
        "channel '{channel_id}' references unknown provider '{provider_id}'"
    )]
    UnknownProvider {
        channel_id: String,
        provider_id: String,
    },

    #[error("channel '{channel_id}' has no sources")]
    EmptyChannel { channel_id: String },
}
