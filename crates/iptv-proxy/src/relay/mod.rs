//! Relay pipeline: pumps bytes from one upstream session to one client sink.
//!
//! A pipeline binds exactly one session to exactly one sink and never
//! rebinds; a failover attempt builds a new pipeline against a new session.
//! Byte order is preserved exactly as received from upstream. Backpressure
//! comes from the bounded channel inside the session: a sink that cannot
//! keep up leaves the channel full, which stalls the upstream read. Chunks
//! are never dropped to catch up, dropping would corrupt the stream.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::errors::SinkClosed;
use crate::upstream::{CloseReason, UpstreamSession};
use crate::utils::SpeedMeter;

/// Response metadata known once an upstream connection is established.
#[derive(Debug, Clone, Default)]
pub struct StreamMeta {
    pub content_type: Option<String>,
}

/// Write side of one client response.
#[async_trait]
pub trait ClientSink: Send {
    /// Called when an upstream attempt is established, before its first
    /// byte. May be called again if a pre-first-byte failover replaces the
    /// attempt.
    fn set_meta(&mut self, _meta: StreamMeta) {}

    /// Deliver one chunk downstream. `Err(SinkClosed)` means the client is
    /// gone and no further writes can succeed.
    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed>;
}

/// What one pump run delivered and why it stopped.
#[derive(Debug)]
pub struct PumpResult {
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub reason: CloseReason,
}

/// Move bytes from `session` to `sink` until either side terminates.
///
/// On a sink failure the session is superseded and joined within `grace`,
/// releasing its quota even though the upstream itself was healthy.
pub async fn pump<S: ClientSink + ?Sized>(
    rid: &str,
    mut session: UpstreamSession,
    sink: &mut S,
    grace: Duration,
) -> PumpResult {
    let mut meter = SpeedMeter::new(rid);
    let mut bytes_sent = 0u64;
    let mut chunks_sent = 0u64;

    loop {
        match session.next_chunk().await {
            Some(chunk) => {
                let len = chunk.len() as u64;
                if sink.send(chunk).await.is_err() {
                    debug!("{rid}client sink closed, superseding upstream session");
                    session.cancel();
                    let _ = session.close(grace).await;
                    meter.finish();
                    return PumpResult {
                        bytes_sent,
                        chunks_sent,
                        reason: CloseReason::ClientClosed,
                    };
                }
                bytes_sent += len;
                chunks_sent += 1;
                meter.processed(len);
            }
            None => {
                let reason = session.close(grace).await;
                meter.finish();
                return PumpResult {
                    bytes_sent,
                    chunks_sent,
                    reason,
                };
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    use super::testing::CollectSink;
    use super::*;
    use crate::quota::ProviderQuota;
    use crate::upstream::UpstreamConnection;

    fn spawn_session(
        bytes: futures::stream::BoxStream<'static, std::io::Result<Bytes>>,
        buffer_chunks: usize,
    ) -> (Arc<ProviderQuota>, UpstreamSession) {
        let quota = ProviderQuota::new("p1", 1);
        let slot = quota.try_acquire().unwrap();
        let session = UpstreamSession::spawn(
            "",
            UpstreamConnection {
                content_type: None,
                bytes,
            },
            slot,
            Duration::from_secs(5),
            buffer_chunks,
            CancellationToken::new(),
        );
        (quota, session)
    }

    #[tokio::test]
    async fn preserves_byte_order_across_chunkings() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(4096).collect();

        for chunk_size in [1usize, 3, 64, 1000, 4096] {
            let chunks: Vec<std::io::Result<Bytes>> = payload
                .chunks(chunk_size)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            let (quota, session) =
                spawn_session(futures::stream::iter(chunks).boxed(), 4);

            let mut sink = CollectSink::new();
            let result = pump("", session, &mut sink, Duration::from_secs(1)).await;

            assert_eq!(sink.received, payload);
            assert_eq!(result.bytes_sent, payload.len() as u64);
            assert_eq!(result.reason, CloseReason::UpstreamClosed);
            assert_eq!(quota.active(), 0);
        }
    }

    #[tokio::test]
    async fn client_disconnect_supersedes_session_and_releases_quota() {
        // endless upstream; the sink closes after two chunks
        let bytes = futures::stream::repeat_with(|| Ok(Bytes::from_static(b"data")))
            .boxed();
        let (quota, session) = spawn_session(bytes, 4);

        let mut sink = CollectSink::closing_after(2);
        let result = pump("", session, &mut sink, Duration::from_secs(1)).await;

        assert_eq!(result.reason, CloseReason::ClientClosed);
        assert_eq!(result.chunks_sent, 2);
        // released within the grace bound, pump has already joined the task
        assert_eq!(quota.active(), 0);
    }

    #[tokio::test]
    async fn slow_sink_bounds_outstanding_chunks() {
        const BUFFER: usize = 4;
        const TOTAL: u64 = 40;

        let produced = Arc::new(AtomicU64::new(0));
        let produced_in_stream = produced.clone();
        let bytes = futures::stream::unfold(0u64, move |n| {
            let produced = produced_in_stream.clone();
            async move {
                if n >= TOTAL {
                    return None;
                }
                produced.fetch_add(1, Ordering::SeqCst);
                Some((Ok(Bytes::from_static(b"c")), n + 1))
            }
        })
        .boxed();

        let (quota, session) = spawn_session(bytes, BUFFER);

        let mut sink = CollectSink::slow(Duration::from_millis(5));
        let consumed = sink.consumed_chunks.clone();
        let produced_watch = produced.clone();

        let watchdog = tokio::spawn(async move {
            let mut max_outstanding = 0i64;
            loop {
                let p = produced_watch.load(Ordering::SeqCst) as i64;
                let c = consumed.load(Ordering::SeqCst) as i64;
                max_outstanding = max_outstanding.max(p - c);
                if c >= TOTAL as i64 {
                    return max_outstanding;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let result = pump("", session, &mut sink, Duration::from_secs(1)).await;
        let max_outstanding = watchdog.await.unwrap();

        assert_eq!(result.chunks_sent, TOTAL);
        // channel capacity + the chunk held by the read loop + the chunk in
        // the pump's hand
        assert!(
            max_outstanding <= BUFFER as i64 + 2,
            "outstanding chunks grew to {max_outstanding}"
        );
        assert_eq!(quota.active(), 0);
    }

    #[tokio::test]
    async fn upstream_error_after_delivery_is_reported_not_hidden() {
        let bytes = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(std::io::Error::other("reset")),
        ])
        .boxed();
        let (quota, session) = spawn_session(bytes, 4);

        let mut sink = CollectSink::new();
        let result = pump("", session, &mut sink, Duration::from_secs(1)).await;

        assert_eq!(sink.received, b"abc");
        assert_eq!(result.reason, CloseReason::UpstreamError);
        assert_eq!(quota.active(), 0);
    }
}
