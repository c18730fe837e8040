//! HTTP transport: `POST /mcp` plus a health check

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::McpServer;
use crate::error::{AppError, Result};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    cache_bytes: u64,
}

async fn health_check(State(server): State<McpServer>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        cache_bytes: server.state().cache().stats().total_size_bytes,
    })
}

async fn handle_mcp(State(server): State<McpServer>, body: Bytes) -> Result<Response> {
    let text = std::str::from_utf8(&body)
        .map_err(|_| AppError::BadRequest("request body is not valid UTF-8".to_string()))?;
    if text.trim().is_empty() {
        return Err(AppError::BadRequest("empty request body".to_string()));
    }

    Ok(match server.handle_text(text).await {
        Some(reply) => ([(header::CONTENT_TYPE, "application/json")], reply).into_response(),
        // Notifications only
        None => StatusCode::ACCEPTED.into_response(),
    })
}

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("No route for {}", uri.path()))
}

/// Build the router
pub fn router(server: McpServer) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/mcp", post(handle_mcp))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(server)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(server: McpServer, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "File reader server listening");

    axum::serve(listener, router(server))
        .with_graceful_shutdown(shutdown)
        .await
}
