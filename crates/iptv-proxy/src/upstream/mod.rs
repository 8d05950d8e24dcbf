//! Upstream session handling.
//!
//! An upstream session owns one live connection to one provider stream
//! endpoint: `Connecting -> Streaming -> Closed(reason)`. Connecting is the
//! connector's job and is bounded by the provider's connect timeout; a
//! connect failure is returned to the orchestrator, which decides about
//! retries. Once streaming, a spawned read loop pushes chunks into a bounded
//! channel until the upstream ends, errors, times out, or the session is
//! superseded. The read-loop task owns the quota slot, so every exit path
//! (including panics and aborts) releases it before control returns to the
//! orchestrator.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::ConnectError;
use crate::models::{Provider, ProviderAuth};
use crate::quota::QuotaSlot;

/// Why a session left the `Streaming` (or `Connecting`) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The downstream client went away; the session was healthy
    ClientClosed,
    /// Upstream ended the stream (EOF)
    UpstreamClosed,
    /// Read or transport error mid-stream
    UpstreamError,
    /// No bytes within the provider's read timeout
    Timeout,
    /// Forcibly closed by the orchestrator (cancel or newer attempt)
    Superseded,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client-closed",
            CloseReason::UpstreamClosed => "upstream-closed",
            CloseReason::UpstreamError => "upstream-error",
            CloseReason::Timeout => "timeout",
            CloseReason::Superseded => "superseded",
        }
    }
}

/// An established upstream connection: response metadata plus the byte
/// stream. Produced by a [`StreamConnector`], consumed by
/// [`UpstreamSession::spawn`].
pub struct UpstreamConnection {
    pub content_type: Option<String>,
    pub bytes: BoxStream<'static, std::io::Result<Bytes>>,
}

/// Uniform connect contract over provider variants. Auth scheme and URL
/// shape differences stay behind this seam; tests substitute scripted
/// implementations.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(
        &self,
        provider: &Provider,
        url: &str,
    ) -> Result<UpstreamConnection, ConnectError>;
}

/// reqwest-based connector used in production.
///
/// Connect timeout only; live streams must remain open indefinitely, so no
/// total request timeout is applied.
pub struct HttpConnector {
    default_user_agent: String,
}

impl HttpConnector {
    pub fn new(default_user_agent: impl Into<String>) -> Self {
        Self {
            default_user_agent: default_user_agent.into(),
        }
    }
}

#[async_trait]
impl StreamConnector for HttpConnector {
    async fn connect(
        &self,
        provider: &Provider,
        url: &str,
    ) -> Result<UpstreamConnection, ConnectError> {
        let user_agent = provider
            .user_agent
            .clone()
            .unwrap_or_else(|| self.default_user_agent.clone());

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(provider.connect_timeout)
            .build()
            .map_err(|e| ConnectError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let mut request = client.get(url);
        request = match &provider.auth {
            ProviderAuth::None => request,
            ProviderAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            ProviderAuth::Query { params } => request.query(params),
        };

        // connect_timeout above only bounds the TCP connect; this bounds the
        // whole establishment up to response headers.
        let response = tokio::time::timeout(provider.connect_timeout, request.send())
            .await
            .map_err(|_| ConnectError::Timeout {
                url: url.to_string(),
                timeout_ms: provider.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| {
                if e.is_timeout() {
                    ConnectError::Timeout {
                        url: url.to_string(),
                        timeout_ms: provider.connect_timeout.as_millis() as u64,
                    }
                } else {
                    ConnectError::Transport {
                        url: url.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();

        Ok(UpstreamConnection {
            content_type,
            bytes,
        })
    }
}

/// A live, supervised upstream stream.
pub struct UpstreamSession {
    content_type: Option<String>,
    chunks: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    handle: JoinHandle<CloseReason>,
}

impl UpstreamSession {
    /// Take an established connection into the `Streaming` state.
    ///
    /// `buffer_chunks` bounds the channel between the read loop and the
    /// relay pump: a full buffer stalls the upstream read instead of
    /// queueing without limit, and chunks are never dropped to keep up.
    pub fn spawn(
        rid: &str,
        connection: UpstreamConnection,
        slot: QuotaSlot,
        read_timeout: Duration,
        buffer_chunks: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer_chunks.max(1));
        let task_cancel = cancel.clone();
        let rid = rid.to_string();
        let mut stream = connection.bytes;

        let handle = tokio::spawn(async move {
            // owning the slot here ties its release to task exit, whatever
            // the exit path is
            let _slot = slot;

            let reason = loop {
                let chunk = tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break CloseReason::Superseded,
                    read = tokio::time::timeout(read_timeout, stream.next()) => match read {
                        Err(_) => {
                            warn!("{rid}read timeout on upstream stream");
                            break CloseReason::Timeout;
                        }
                        Ok(None) => break CloseReason::UpstreamClosed,
                        Ok(Some(Err(e))) => {
                            warn!("{rid}error reading upstream stream: {e}");
                            break CloseReason::UpstreamError;
                        }
                        Ok(Some(Ok(chunk))) => chunk,
                    },
                };

                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break CloseReason::Superseded,
                    sent = tx.send(chunk) => {
                        if sent.is_err() {
                            break CloseReason::ClientClosed;
                        }
                    }
                }
            };

            debug!("{rid}upstream session closed: {}", reason.as_str());
            reason
        });

        Self {
            content_type: connection.content_type,
            chunks: rx,
            cancel,
            handle,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Next relayed chunk, in upstream order. `None` once the session has
    /// terminated for any reason; [`UpstreamSession::close`] then reports it.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.chunks.recv().await
    }

    /// Request supersession without consuming the session.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Tear the session down and report its close reason.
    ///
    /// Joining is bounded by the cancellation grace period; a task that does
    /// not finish in time is aborted. The quota slot is released either way.
    pub async fn close(mut self, grace: Duration) -> CloseReason {
        self.cancel.cancel();
        drop(self.chunks);

        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(reason)) => reason,
            Ok(Err(e)) => {
                error!("upstream session task failed: {e}");
                CloseReason::UpstreamError
            }
            Err(_) => {
                warn!("upstream session teardown exceeded grace period, aborting");
                self.handle.abort();
                CloseReason::Superseded
            }
        }
    }
}
