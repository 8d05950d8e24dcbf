//! HTTP surface: the streaming endpoint plus a small operational API.
//!
//! The streaming handler defers its status line until the engine either
//! delivers a first byte or gives up. That keeps failover invisible to the
//! client: connect attempts, quota rejections and provider retries all happen
//! before the response is committed, and only a request that truly cannot be
//! served turns into an error status.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::Config;
use crate::errors::SinkClosed;
use crate::orchestrator::{ServeOutcome, StreamOrchestrator};
use crate::quota::QuotaRegistry;
use crate::registry::{CatalogService, CatalogSnapshot};
use crate::relay::{ClientSink, StreamMeta};
use crate::sessions::ActiveSessions;

// stream endpoints default to MPEG-TS when upstream does not say otherwise
const DEFAULT_CONTENT_TYPE: &str = "video/mp2t";

pub struct AppState {
    pub catalog: Arc<CatalogService>,
    pub quotas: Arc<QuotaRegistry>,
    pub sessions: Arc<ActiveSessions>,
    pub orchestrator: Arc<StreamOrchestrator>,
    pub config_path: PathBuf,
    pub shutdown: CancellationToken,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream/{channel_id}", get(stream_channel))
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/catalog/reload", post(reload_catalog))
        .with_state(state)
}

/// Sink bridging the relay pump to an axum response body.
///
/// The first delivered chunk fires the gate, handing the handler the
/// response metadata; everything after flows through the body channel. A
/// dropped body receiver (client disconnect) surfaces as [`SinkClosed`].
struct BodySink {
    body: mpsc::Sender<Bytes>,
    gate: Option<oneshot::Sender<StreamMeta>>,
    meta: StreamMeta,
}

#[async_trait]
impl ClientSink for BodySink {
    fn set_meta(&mut self, meta: StreamMeta) {
        self.meta = meta;
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        if let Some(gate) = self.gate.take() {
            if gate.send(self.meta.clone()).is_err() {
                return Err(SinkClosed);
            }
        }
        self.body.send(chunk).await.map_err(|_| SinkClosed)
    }
}

async fn stream_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Response {
    let (body_tx, body_rx) = mpsc::channel::<Bytes>(1);
    let (gate_tx, gate_rx) = oneshot::channel::<StreamMeta>();

    let mut sink = BodySink {
        body: body_tx,
        gate: Some(gate_tx),
        meta: StreamMeta::default(),
    };

    let orchestrator = state.orchestrator.clone();
    let cancel = state.shutdown.child_token();
    let task = tokio::spawn(async move {
        orchestrator.serve(&channel_id, &mut sink, cancel).await
    });

    // the gate resolves on the first byte; it errors exactly when the engine
    // finished without delivering one
    match gate_rx.await {
        Ok(meta) => {
            let content_type = meta
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
            let body =
                Body::from_stream(ReceiverStream::new(body_rx).map(Ok::<_, SinkClosed>));
            (
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, "no-cache".to_string()),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
                ],
                body,
            )
                .into_response()
        }
        Err(_) => match task.await {
            Ok(ServeOutcome::NotFound) => {
                (StatusCode::NOT_FOUND, "channel not found\n").into_response()
            }
            Ok(ServeOutcome::Exhausted) => {
                (StatusCode::BAD_GATEWAY, "no upstream source available\n")
                    .into_response()
            }
            Ok(ServeOutcome::Canceled) => {
                // client already gone, the status is never seen
                StatusCode::BAD_GATEWAY.into_response()
            }
            Ok(ServeOutcome::Served { .. }) => {
                // unreachable while the gate fires before the first byte
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            Err(e) => {
                error!("stream task failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.catalog.load();
    let providers: serde_json::Map<String, serde_json::Value> = state
        .quotas
        .counts()
        .into_iter()
        .map(|(id, (active, capacity))| {
            (id, json!({ "active": active, "capacity": capacity }))
        })
        .collect();

    Json(json!({
        "channels": snapshot.channel_count(),
        "providers": providers,
        "active_sessions": state.sessions.snapshot().await,
    }))
}

/// Re-read the config file and swap the catalog atomically. A file that
/// fails validation leaves the running catalog untouched.
async fn reload_catalog(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = Config::load_from_file(&state.config_path)
        .and_then(|config| CatalogSnapshot::from_config(&config));

    match snapshot {
        Ok(snapshot) => {
            let capacities: Vec<(String, u32)> = snapshot
                .providers()
                .map(|p| (p.id.clone(), p.max_connections))
                .collect();
            // quotas first so a request racing the swap never hits a
            // provider without a counter
            state
                .quotas
                .sync(capacities.iter().map(|(id, max)| (id.as_str(), *max)));

            let body = json!({
                "status": "reloaded",
                "providers": snapshot.provider_count(),
                "channels": snapshot.channel_count(),
            });
            state.catalog.swap(snapshot);
            Json(body).into_response()
        }
        Err(e) => {
            warn!("catalog reload rejected: {e}");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use super::*;
    use crate::models::{CandidateSource, Channel, Provider};
    use crate::orchestrator::StreamingSettings;
    use crate::upstream::testing::{Behavior, ScriptedConnector};

    fn provider(id: &str) -> Provider {
        Provider {
            id: id.to_string(),
            auth: Default::default(),
            max_connections: 2,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            retry_backoff: Duration::ZERO,
            user_agent: None,
        }
    }

    fn channel(id: &str, sources: &[(&str, &str)]) -> Channel {
        Channel {
            id: id.to_string(),
            name: None,
            sources: sources
                .iter()
                .map(|(p, u)| CandidateSource {
                    provider: p.to_string(),
                    url: u.to_string(),
                })
                .collect(),
        }
    }

    async fn spawn_app(
        providers: Vec<Provider>,
        channels: Vec<Channel>,
        behaviors: Vec<(&'static str, Behavior)>,
        config_path: PathBuf,
    ) -> SocketAddr {
        let quotas = Arc::new(QuotaRegistry::new());
        quotas.sync(
            providers
                .iter()
                .map(|p| (p.id.as_str(), p.max_connections)),
        );

        let config = Config {
            web: Default::default(),
            streaming: Default::default(),
            providers,
            channels,
        };
        let catalog = Arc::new(CatalogService::new(
            CatalogSnapshot::from_config(&config).unwrap(),
        ));
        let sessions = Arc::new(ActiveSessions::new());
        let orchestrator = Arc::new(StreamOrchestrator::new(
            catalog.clone(),
            quotas.clone(),
            sessions.clone(),
            Arc::new(ScriptedConnector::new(behaviors)),
            StreamingSettings {
                buffer_chunks: 8,
                cancellation_grace: Duration::from_secs(1),
                retry_same_provider: false,
            },
        ));

        let state = Arc::new(AppState {
            catalog,
            quotas,
            sessions,
            orchestrator,
            config_path,
            shutdown: CancellationToken::new(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        addr
    }

    fn unused_config_path() -> PathBuf {
        std::env::temp_dir().join(format!("iptv-proxy-test-{}.toml", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn streams_body_with_upstream_content_type() {
        let addr = spawn_app(
            vec![provider("p1")],
            vec![channel("ch1", &[("p1", "http://u1")])],
            vec![(
                "http://u1",
                Behavior::Serve(vec![Bytes::from_static(b"hel"), Bytes::from_static(b"lo")]),
            )],
            unused_config_path(),
        )
        .await;

        let response = reqwest::get(format!("http://{addr}/stream/ch1"))
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "video/mp2t"
        );
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn unknown_channel_is_404() {
        let addr = spawn_app(
            vec![provider("p1")],
            vec![channel("ch1", &[("p1", "http://u1")])],
            vec![],
            unused_config_path(),
        )
        .await;

        let response = reqwest::get(format!("http://{addr}/stream/nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn exhausted_candidates_is_502() {
        let addr = spawn_app(
            vec![provider("p1")],
            vec![channel("ch1", &[("p1", "http://u1")])],
            vec![("http://u1", Behavior::Refuse)],
            unused_config_path(),
        )
        .await;

        let response = reqwest::get(format!("http://{addr}/stream/ch1"))
            .await
            .unwrap();
        assert_eq!(response.status(), 502);
    }

    #[tokio::test]
    async fn health_and_status_report() {
        let addr = spawn_app(
            vec![provider("p1")],
            vec![channel("ch1", &[("p1", "http://u1")])],
            vec![],
            unused_config_path(),
        )
        .await;

        let health = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(health.status(), 200);

        let status: serde_json::Value = reqwest::get(format!("http://{addr}/api/v1/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["channels"], 1);
        assert_eq!(status["providers"]["p1"]["capacity"], 2);
        assert_eq!(status["providers"]["p1"]["active"], 0);
    }

    #[tokio::test]
    async fn reload_swaps_catalog_and_rejects_invalid_file() {
        let config_path = unused_config_path();
        std::fs::write(
            &config_path,
            r#"
                [[providers]]
                id = "p1"
                max_connections = 4

                [[channels]]
                id = "ch2"
                sources = [{ provider = "p1", url = "http://up/2" }]
            "#,
        )
        .unwrap();

        let addr = spawn_app(
            vec![provider("p1")],
            vec![channel("ch1", &[("p1", "http://u1")])],
            vec![],
            config_path.clone(),
        )
        .await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/api/v1/catalog/reload"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        // old channel gone, new one present
        let old = reqwest::get(format!("http://{addr}/stream/ch1")).await.unwrap();
        assert_eq!(old.status(), 404);

        let status: serde_json::Value = reqwest::get(format!("http://{addr}/api/v1/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["providers"]["p1"]["capacity"], 4);

        // invalid file leaves the catalog untouched
        std::fs::write(&config_path, "providers = 3").unwrap();
        let response = client
            .post(format!("http://{addr}/api/v1/catalog/reload"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 422);

        let status: serde_json::Value = reqwest::get(format!("http://{addr}/api/v1/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["channels"], 1);

        std::fs::remove_file(&config_path).ok();
    }
}
