use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

pub mod duration_serde;

use crate::errors::ConfigError;
use crate::models::{Channel, Provider};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub providers: Vec<Provider>,

    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Tunables of the relay engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Chunks buffered between the upstream read loop and the client pump.
    /// Bounds per-stream memory: a full buffer stalls the upstream read.
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: usize,

    /// Upper bound on session teardown after cancellation; a teardown
    /// slower than this would leak a provider connection, so the session
    /// task is aborted once the grace period elapses.
    #[serde(
        with = "duration_serde::duration",
        default = "default_cancellation_grace"
    )]
    pub cancellation_grace: Duration,

    /// Try a provider's alternate stream URLs after one of its URLs failed
    /// within the same request. Off by default: a provider that failed once
    /// is skipped for the rest of the request.
    #[serde(default)]
    pub retry_same_provider: bool,

    /// User agent sent upstream when the provider does not override it
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_chunks: default_buffer_chunks(),
            cancellation_grace: default_cancellation_grace(),
            retry_same_provider: false,
            user_agent: default_user_agent(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_buffer_chunks() -> usize {
    32
}

fn default_cancellation_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_user_agent() -> String {
    format!("iptv-proxy/{}", env!("CARGO_PKG_VERSION"))
}

impl Config {
    /// Load configuration from a TOML file with `IPTV_PROXY_*` environment
    /// overrides (e.g. `IPTV_PROXY_WEB__PORT=8081`).
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("IPTV_PROXY_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Invariants the engine relies on: provider capacity >= 1, unique ids,
    /// channels non-empty with resolvable provider references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut provider_ids = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.max_connections == 0 {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "provider '{}' must allow at least one connection",
                        provider.id
                    ),
                });
            }
            if !provider_ids.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("duplicate provider id '{}'", provider.id),
                });
            }
        }

        let mut channel_ids = std::collections::HashSet::new();
        for channel in &self.channels {
            if !channel_ids.insert(channel.id.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("duplicate channel id '{}'", channel.id),
                });
            }
            if channel.sources.is_empty() {
                return Err(ConfigError::EmptyChannel {
                    channel_id: channel.id.clone(),
                });
            }
            for source in &channel.sources {
                if !provider_ids.contains(source.provider.as_str()) {
                    return Err(ConfigError::UnknownProvider {
                        channel_id: channel.id.clone(),
                        provider_id: source.provider.clone(),
                    });
                }
                if url::Url::parse(&source.url).is_err() {
                    return Err(ConfigError::Invalid {
                        message: format!(
                            "channel '{}' has an unparseable source url '{}'",
                            channel.id, source.url
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}
