pub(crate) mod auth;
pub(crate) mod download;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::backup::BackupOrchestrator;
use crate::errors::BackupError;
pub use auth::{Authenticator, JobRegistry, StaticTokenAuthenticator};

/// Shared state handed to every request.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: BackupOrchestrator,
    pub authenticator: Arc<dyn Authenticator>,
    pub jobs: JobRegistry,
    pub stream_buffer_bytes: usize,
}

/// Errors surfaced to HTTP callers before any archive bytes are sent.
#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    Forbidden,
    JobRunning,
    Backup(BackupError),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "missing or invalid bearer credential".to_string(),
            ),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "administrator privilege required".to_string(),
            ),
            ApiError::JobRunning => (
                StatusCode::CONFLICT,
                "a backup for this caller is already running".to_string(),
            ),
            ApiError::Backup(BackupError::Unauthorized) => {
                (StatusCode::FORBIDDEN, BackupError::Unauthorized.to_string())
            }
            ApiError::Backup(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message.clone()),
        };

        let mut response = (status, Json(serde_json::json!({ "error": message }))).into_response();
        if matches!(self, ApiError::Unauthenticated) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "tenantbackup",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/backup", post(download::backup_download))
        .with_state(state)
}

/// Serves HTTP until ctrl-c.
pub async fn start_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
    tracing::info!(%addr, "HTTP server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("HTTP server terminated unexpectedly")
}
