//! Small endpoints: ping, health, verify.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::server::auth::validate_request;
use crate::server::error::{ApiError, ApiResult};
use crate::server::header_str;
use crate::server::state::ServerState;

/// GET /ping — liveness probe, no auth.
pub async fn ping_handler() -> impl IntoResponse {
    "pong"
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime: u64,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// GET /health — no auth.
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime: state.started_at.elapsed().as_secs(),
        version: state.version.clone(),
        timestamp: chrono::Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub env: Option<String>,
}

/// POST /verify — validates environment and token.
pub async fn verify_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<VerifyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let auth = header_str(&headers, header::AUTHORIZATION.as_str());
    let env_config = validate_request(req.env.as_deref(), auth, &state.config)
        .map_err(ApiError::from_validation)?;

    Ok(Json(
        serde_json::json!({ "success": true, "env": env_config.name }),
    ))
}
