//! Stream orchestration: candidate iteration, quota gating and failover.
//!
//! One call to [`StreamOrchestrator::serve`] handles one client request from
//! start to finish. Failover is sequential: at most one upstream session and
//! one relay pipeline exist at a time, and a retry always builds fresh ones.
//! Once a single byte has reached the client the response is committed and
//! later failures surface as stream termination instead of another attempt;
//! a transparent restart would splice two streams together mid-flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::CatalogService;
use crate::relay::{self, ClientSink, StreamMeta};
use crate::quota::QuotaRegistry;
use crate::sessions::ActiveSessions;
use crate::upstream::{CloseReason, StreamConnector, UpstreamSession};
use crate::utils;

/// Terminal outcome of one `serve` call.
#[derive(Debug)]
pub enum ServeOutcome {
    /// At least one byte reached the client; `closed` tells how the stream
    /// ended afterwards.
    Served { bytes_sent: u64, closed: CloseReason },
    /// Unknown channel, reported immediately without retries
    NotFound,
    /// Every candidate failed or was saturated before any byte was delivered
    Exhausted,
    /// The client went away before anything was delivered
    Canceled,
}

/// Engine tunables, resolved from [`crate::config::StreamingConfig`].
#[derive(Debug, Clone)]
pub struct StreamingSettings {
    pub buffer_chunks: usize,
    pub cancellation_grace: Duration,
    pub retry_same_provider: bool,
}

impl From<&crate::config::StreamingConfig> for StreamingSettings {
    fn from(config: &crate::config::StreamingConfig) -> Self {
        Self {
            buffer_chunks: config.buffer_chunks,
            cancellation_grace: config.cancellation_grace,
            retry_same_provider: config.retry_same_provider,
        }
    }
}

pub struct StreamOrchestrator {
    catalog: Arc<CatalogService>,
    quotas: Arc<QuotaRegistry>,
    sessions: Arc<ActiveSessions>,
    connector: Arc<dyn StreamConnector>,
    settings: StreamingSettings,
}

impl StreamOrchestrator {
    pub fn new(
        catalog: Arc<CatalogService>,
        quotas: Arc<QuotaRegistry>,
        sessions: Arc<ActiveSessions>,
        connector: Arc<dyn StreamConnector>,
        settings: StreamingSettings,
    ) -> Self {
        Self {
            catalog,
            quotas,
            sessions,
            connector,
            settings,
        }
    }

    /// Serve one channel request into `sink`.
    ///
    /// `cancel` is the client-side cancellation signal; firing it aborts the
    /// attempt loop, supersedes any open session and releases held quota.
    pub async fn serve<S: ClientSink + ?Sized>(
        &self,
        channel_id: &str,
        sink: &mut S,
        cancel: CancellationToken,
    ) -> ServeOutcome {
        // one snapshot per request, reloads do not shift candidates mid-loop
        let snapshot = self.catalog.load();
        let Some(channel) = snapshot.channel(channel_id) else {
            debug!("channel not found: {channel_id}");
            return ServeOutcome::NotFound;
        };

        let rid = utils::rid();
        info!(
            "{rid}stream request: {} ({} candidate sources)",
            channel.display_name(),
            channel.sources.len()
        );

        let mut tried: HashSet<String> = HashSet::new();
        let mut last_failed_provider: Option<String> = None;

        for (attempt, source) in channel.sources.iter().enumerate() {
            if cancel.is_cancelled() {
                return ServeOutcome::Canceled;
            }

            if !self.settings.retry_same_provider && tried.contains(&source.provider) {
                continue;
            }

            let Some(provider) = snapshot.provider(&source.provider) else {
                // snapshot validation makes this unreachable, but a skip is
                // cheaper than a panic if that ever regresses
                warn!("{rid}source references unknown provider '{}'", source.provider);
                continue;
            };

            // backoff applies only when retrying within the same provider;
            // moving to a different provider advances immediately
            if last_failed_provider.as_deref() == Some(source.provider.as_str())
                && !provider.retry_backoff.is_zero()
            {
                // jittered so parallel clients of a flapping provider do not
                // retry in lockstep
                let backoff = provider.retry_backoff.mul_f64(rand::random_range(0.75..=1.25));
                debug!(
                    "{rid}backing off {:?} before retrying provider '{}'",
                    backoff, provider.id
                );
                tokio::select! {
                    _ = cancel.cancelled() => return ServeOutcome::Canceled,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            // capacity rejection is cheap: mark tried, no backoff charged
            let Some(slot) = self.quotas.try_acquire(&provider.id) else {
                debug!(
                    "{rid}provider '{}' at capacity, skipping candidate {attempt}",
                    provider.id
                );
                tried.insert(source.provider.clone());
                continue;
            };

            debug!("{rid}attempt {attempt}: connecting {}", source.url);
            let connection = match self.connector.connect(&provider, &source.url).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("{rid}connect failed: {e}");
                    drop(slot);
                    tried.insert(source.provider.clone());
                    last_failed_provider = Some(source.provider.clone());
                    continue;
                }
            };

            sink.set_meta(StreamMeta {
                content_type: connection.content_type.clone(),
            });

            let session = UpstreamSession::spawn(
                &rid,
                connection,
                slot,
                provider.read_timeout,
                self.settings.buffer_chunks,
                cancel.child_token(),
            );

            let session_id = self.sessions.begin(channel_id, &provider.id).await;
            let result = relay::pump(&rid, session, sink, self.settings.cancellation_grace).await;
            self.sessions.end(session_id).await;

            if result.bytes_sent > 0 {
                // response committed downstream; no transparent retry past
                // this point
                info!(
                    "{rid}stream ended: {} bytes, reason: {}",
                    result.bytes_sent,
                    result.reason.as_str()
                );
                return ServeOutcome::Served {
                    bytes_sent: result.bytes_sent,
                    closed: result.reason,
                };
            }

            match result.reason {
                CloseReason::ClientClosed | CloseReason::Superseded => {
                    debug!("{rid}client gone before first byte");
                    return ServeOutcome::Canceled;
                }
                reason => {
                    warn!(
                        "{rid}attempt {attempt} failed before first byte: {}",
                        reason.as_str()
                    );
                    tried.insert(source.provider.clone());
                    last_failed_provider = Some(source.provider.clone());
                }
            }
        }

        info!("{rid}all candidate sources exhausted for channel {channel_id}");
        ServeOutcome::Exhausted
    }
}
