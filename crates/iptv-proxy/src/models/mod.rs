//! Domain model shared across the engine: providers, channels and the
//! candidate sources that tie them together.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_serde;

/// Credentials applied to every upstream request of a provider.
///
/// Selected by configuration; all variants satisfy the same `connect()`
/// contract on the connector, so the rest of the engine never branches on
/// the auth scheme.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderAuth {
    /// No authentication; credentials may be embedded in the stream URL
    #[default]
    None,
    /// HTTP basic authentication
    Basic { username: String, password: String },
    /// Query parameters appended to every stream URL
    Query { params: Vec<(String, String)> },
}

/// One upstream IPTV provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,

    #[serde(default)]
    pub auth: ProviderAuth,

    /// Concurrent upstream connection capacity, must be >= 1
    pub max_connections: u32,

    #[serde(with = "duration_serde::duration", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Longest gap between upstream chunks before the stream is considered dead
    #[serde(with = "duration_serde::duration", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Delay before retrying an alternate URL of this same provider
    #[serde(with = "duration_serde::duration", default = "default_retry_backoff")]
    pub retry_backoff: Duration,

    /// Overrides the proxy-wide user agent for this provider's requests
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

/// A `(provider, stream URL)` pair configured for a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSource {
    pub provider: String,
    pub url: String,
}

/// One channel of the unified catalog.
///
/// `sources` is ordered by failover priority: index 0 is tried first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub sources: Vec<CandidateSource>,
}

impl Channel {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}
