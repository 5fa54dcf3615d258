//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerSection;
use crate::errors::FdeError;
use crate::server::deploy::{deploy_handler, deploy_status_handler};
use crate::server::handlers::{health_handler, ping_handler, verify_handler};
use crate::server::state::ServerState;
use crate::server::upload::{
    cancel_handler, chunk_handler, complete_handler, init_handler, status_handler,
    upload_handler,
};

/// Uploads may be large; the chunked flow keeps individual bodies around the
/// chunk size, but the single-shot multipart path takes whole files.
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

/// Start the HTTP server
pub async fn serve(
    options: &ServerSection,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), FdeError>>, FdeError> {
    let app = Router::new()
        // Liveness and identity
        .route("/ping", get(ping_handler))
        .route("/health", get(health_handler))
        .route("/verify", post(verify_handler))
        // Uploads
        .route("/upload", post(upload_handler))
        .route("/upload/init", post(init_handler))
        .route("/upload/chunk", post(chunk_handler))
        .route("/upload/complete", post(complete_handler))
        .route("/upload/status", get(status_handler))
        .route("/upload/cancel", delete(cancel_handler))
        // Deploys
        .route("/deploy", post(deploy_handler))
        .route("/deploy/status", get(deploy_status_handler))
        // State and middleware
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| FdeError::Server(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| FdeError::Server(e.to_string()))
    });

    Ok(handle)
}
