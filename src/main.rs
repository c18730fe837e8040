//! File Reader Server
//!
//! Serves local files as markdown to tool-calling clients, over HTTP or
//! stdio.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_reader_server::config::{Config, Transport};
use file_reader_server::mcp::{self, McpServer};
use file_reader_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config_result = Config::from_env();
    let transport = config_result
        .as_ref()
        .map(|c| c.server.transport)
        .unwrap_or(Transport::Http);

    // Initialize tracing; stdout belongs to the protocol in stdio mode
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "file_reader_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = config_result.unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting File Reader Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        root = %config.cache.root_dir.display(),
        total_mb = config.cache.total_size_bytes / (1024 * 1024),
        "Cache configured"
    );
    tracing::info!(provider = %config.parsers.ocr.provider, "OCR configured");

    let host = config.server.host.clone();
    let port = config.server.port;
    let state = AppState::new(config);
    let sweeper = state.cache().spawn_sweeper();
    let server = McpServer::new(state);

    match transport {
        Transport::Stdio => mcp::stdio::run(server).await.context("stdio transport failed")?,
        Transport::Http => {
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .with_context(|| format!("invalid listen address {host}:{port}"))?;
            mcp::http::serve(server, addr, shutdown_signal())
                .await
                .context("HTTP server failed")?;
        }
    }

    sweeper.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
