//! Upload endpoints: the chunked flow and the single-shot multipart
//! alternative. Both hand off to the same save-or-extract step once the
//! bytes are assembled and verified.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Multipart, Query, State};
use axum::http::header;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::archive::extract_zip;
use crate::errors::FdeError;
use crate::filesys::file::File;
use crate::server::auth::validate_request;
use crate::server::error::{ApiError, ApiResult};
use crate::server::header_str;
use crate::server::state::ServerState;
use crate::utils::sha256_hex;

/// Response shape shared by `/upload` and `/upload/complete`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub file_name: String,
    pub file_size: u64,
    pub checksum_verified: bool,
    pub extracted: bool,
    pub upload_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub upload_id: Option<String>,
    pub total_chunks: Option<u32>,
    pub file_name: Option<String>,
    // Accepted for parity with complete; verification happens there.
    pub checksum: Option<String>,
    #[serde(default)]
    pub should_extract: bool,
    pub env: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub uploaded_chunks: Vec<u32>,
    pub total_chunks: u32,
    pub is_resume: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkQuery {
    pub upload_id: Option<String>,
    pub chunk_index: Option<u32>,
    pub env: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQuery {
    pub upload_id: Option<String>,
    pub env: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub upload_id: Option<String>,
    pub file_name: Option<String>,
    pub checksum: Option<String>,
    #[serde(default)]
    pub should_extract: bool,
    pub env: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub exists: bool,
    pub uploaded_chunks: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
}

/// POST /upload/init
pub async fn init_handler(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Json(req): Json<InitRequest>,
) -> ApiResult<Json<InitResponse>> {
    let auth = header_str(&headers, header::AUTHORIZATION.as_str());
    validate_request(req.env.as_deref(), auth, &state.config)
        .map_err(ApiError::from_validation)?;

    let upload_id = req
        .upload_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("missing uploadId"))?;
    let total_chunks = req
        .total_chunks
        .ok_or_else(|| ApiError::bad_request("missing totalChunks"))?;
    let file_name = req
        .file_name
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("missing fileName"))?;
    let env = req.env.as_deref().unwrap_or_default();

    let outcome = state
        .chunks
        .init(upload_id, total_chunks, file_name, env, req.should_extract)
        .await?;

    Ok(Json(InitResponse {
        uploaded_chunks: outcome.uploaded_chunks,
        total_chunks: outcome.total_chunks,
        is_resume: outcome.is_resume,
    }))
}

/// POST /upload/chunk?uploadId=&chunkIndex=&env=
pub async fn chunk_handler(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let auth = header_str(&headers, header::AUTHORIZATION.as_str());
    validate_request(query.env.as_deref(), auth, &state.config)
        .map_err(ApiError::from_validation)?;

    let upload_id = query
        .upload_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("missing uploadId"))?;
    let chunk_index = query
        .chunk_index
        .ok_or_else(|| ApiError::bad_request("missing chunkIndex"))?;
    let md5 = header_str(&headers, "x-chunk-md5");

    let written = state
        .chunks
        .write_chunk(upload_id, chunk_index, &body, md5)
        .await?;

    Ok(Json(serde_json::json!({ "chunkIndex": written })))
}

/// GET /upload/status?uploadId=&env=
pub async fn status_handler(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Query(query): Query<TaskQuery>,
) -> ApiResult<Json<StatusResponse>> {
    let auth = header_str(&headers, header::AUTHORIZATION.as_str());
    validate_request(query.env.as_deref(), auth, &state.config)
        .map_err(ApiError::from_validation)?;

    let upload_id = query
        .upload_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("missing uploadId"))?;

    let status = state.chunks.status(upload_id).await?;
    Ok(Json(StatusResponse {
        exists: status.exists,
        uploaded_chunks: status.uploaded_chunks,
        total_chunks: status.total_chunks,
    }))
}

/// POST /upload/complete
pub async fn complete_handler(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<Json<UploadResponse>> {
    let auth = header_str(&headers, header::AUTHORIZATION.as_str());
    let env_config = validate_request(req.env.as_deref(), auth, &state.config)
        .map_err(ApiError::from_validation)?;
    let server_env = env_config.server_view()?;
    let upload_path = server_env.upload_path.to_path_buf();

    let upload_id = req
        .upload_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("missing uploadId"))?;

    let merged = state.chunks.complete(upload_id, req.checksum.as_deref()).await?;
    let file_name = req
        .file_name
        .clone()
        .unwrap_or_else(|| merged.meta.file_name.clone());

    let file_size = merged.bytes.len() as u64;
    store_artifact(&upload_path, &file_name, merged.bytes, req.should_extract).await?;
    state.chunks.remove(upload_id).await?;

    info!(
        upload_id,
        file_name = %file_name,
        file_size,
        extracted = req.should_extract,
        "chunked upload completed"
    );
    Ok(Json(UploadResponse {
        success: true,
        file_name,
        file_size,
        checksum_verified: merged.checksum_verified,
        extracted: req.should_extract,
        upload_path: upload_path.to_string_lossy().to_string(),
    }))
}

/// DELETE /upload/cancel?uploadId=&env=
pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Query(query): Query<TaskQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let auth = header_str(&headers, header::AUTHORIZATION.as_str());
    validate_request(query.env.as_deref(), auth, &state.config)
        .map_err(ApiError::from_validation)?;

    let upload_id = query
        .upload_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("missing uploadId"))?;

    state.chunks.remove(upload_id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// POST /upload — small-file alternative: the whole file in one multipart
/// request.
pub async fn upload_handler(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let mut env: Option<String> = None;
    let mut file_name: Option<String> = None;
    let mut data: Option<Bytes> = None;
    let mut checksum: Option<String> = None;
    let mut should_extract = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "env" => {
                env = Some(read_text_field(field).await?);
            }
            "checksum" => {
                checksum = Some(read_text_field(field).await?);
            }
            "shouldExtract" => {
                let text = read_text_field(field).await?;
                should_extract = matches!(text.as_str(), "true" | "1");
            }
            "file" => {
                file_name = field.file_name().map(String::from);
                data = Some(field.bytes().await.map_err(|e| {
                    ApiError::bad_request(format!("failed to read file field: {}", e))
                })?);
            }
            _ => {}
        }
    }

    let auth = header_str(&headers, header::AUTHORIZATION.as_str());
    let env_config = validate_request(env.as_deref(), auth, &state.config)
        .map_err(ApiError::from_validation)?;
    let server_env = env_config.server_view()?;

    let data = data.ok_or_else(|| ApiError::bad_request("missing file field"))?;
    let file_name =
        file_name.ok_or_else(|| ApiError::bad_request("file field has no filename"))?;

    let checksum_verified = match checksum.as_deref() {
        Some(expected) => {
            let actual = sha256_hex(&data);
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(FdeError::Integrity(format!(
                    "file checksum mismatch: expected {}, got {}",
                    expected, actual
                ))
                .into());
            }
            true
        }
        None => false,
    };

    let file_size = data.len() as u64;
    let upload_path = server_env.upload_path.to_path_buf();
    store_artifact(&upload_path, &file_name, data.to_vec(), should_extract).await?;

    info!(
        env = server_env.name,
        file_name = %file_name,
        file_size,
        extracted = should_extract,
        "upload stored"
    );
    Ok(Json(UploadResponse {
        success: true,
        file_name,
        file_size,
        checksum_verified,
        extracted: should_extract,
        upload_path: upload_path.to_string_lossy().to_string(),
    }))
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read field: {}", e)))
}

/// Place verified bytes under the environment's upload path: either saved as
/// a single file or unzipped in place.
pub(crate) async fn store_artifact(
    upload_path: &Path,
    file_name: &str,
    bytes: Vec<u8>,
    should_extract: bool,
) -> Result<(), FdeError> {
    tokio::fs::create_dir_all(upload_path).await?;

    if should_extract {
        let target = upload_path.to_path_buf();
        tokio::task::spawn_blocking(move || extract_zip(&bytes, &target))
            .await
            .map_err(|e| FdeError::Internal(format!("extract task panicked: {}", e)))??;
        return Ok(());
    }

    let dest = upload_path.join(sanitize_file_name(file_name)?);
    File::new(dest).write_bytes(&bytes).await?;
    Ok(())
}

/// Saved files land directly under the upload path; reject names that would
/// escape it.
fn sanitize_file_name(name: &str) -> Result<PathBuf, FdeError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\')
    {
        return Err(FdeError::Validation(format!(
            "invalid file name '{}'",
            name
        )));
    }
    Ok(PathBuf::from(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert!(sanitize_file_name("app.zip").is_ok());
        assert!(sanitize_file_name("a-b_c.1.tar").is_ok());
        assert!(sanitize_file_name("").is_err());
        assert!(sanitize_file_name("..").is_err());
        assert!(sanitize_file_name("a/b").is_err());
        assert!(sanitize_file_name("..\\b").is_err());
    }

    #[tokio::test]
    async fn test_store_artifact_saves_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("uploads");
        store_artifact(&target, "app.txt", b"payload".to_vec(), false)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(target.join("app.txt")).unwrap(),
            "payload"
        );
    }
}
