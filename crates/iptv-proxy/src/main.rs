use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iptv_proxy::{
    config::Config,
    orchestrator::{StreamOrchestrator, StreamingSettings},
    quota::QuotaRegistry,
    registry::{CatalogService, CatalogSnapshot},
    sessions::ActiveSessions,
    upstream::HttpConnector,
    web::{self, AppState},
};

#[derive(Parser)]
#[command(name = "iptv-proxy")]
#[command(version)]
#[command(about = "IPTV stream proxy with per-provider connection quotas and source failover")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the listen host from the config file
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port from the config file
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("iptv_proxy={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting iptv-proxy v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    info!("Configuration loaded from: {}", cli.config.display());

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }

    let quotas = Arc::new(QuotaRegistry::new());
    quotas.sync(
        config
            .providers
            .iter()
            .map(|p| (p.id.as_str(), p.max_connections)),
    );

    let snapshot = CatalogSnapshot::from_config(&config)?;
    info!(
        "Catalog loaded: {} providers, {} channels",
        snapshot.provider_count(),
        snapshot.channel_count()
    );
    let catalog = Arc::new(CatalogService::new(snapshot));

    let sessions = Arc::new(ActiveSessions::new());
    let connector = Arc::new(HttpConnector::new(config.streaming.user_agent.clone()));
    let orchestrator = Arc::new(StreamOrchestrator::new(
        catalog.clone(),
        quotas.clone(),
        sessions.clone(),
        connector,
        StreamingSettings::from(&config.streaming),
    ));

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState {
        catalog,
        quotas,
        sessions,
        orchestrator,
        config_path: cli.config,
        shutdown: shutdown.clone(),
    });

    let bind = format!("{}:{}", config.web.host, config.web.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!("Listening on {bind}");

    axum::serve(listener, web::router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing active streams");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
