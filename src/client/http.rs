//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::FdeError;

/// Timeout for short endpoints (ping, health, verify, status). Uploads and
/// streamed deploys run untimed; the server side keeps those connections
/// open for as long as the work takes.
const SHORT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequestBody {
    pub upload_id: String,
    pub total_chunks: u32,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub should_extract: bool,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub uploaded_chunks: Vec<u32>,
    pub total_chunks: u32,
    pub is_resume: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequestBody {
    pub upload_id: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub should_extract: bool,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub success: bool,
    pub file_name: String,
    pub file_size: u64,
    pub checksum_verified: bool,
    pub extracted: bool,
    pub upload_path: String,
}

/// Outcome of a synchronous (non-streamed) deploy, success or failure.
#[derive(Debug, Clone)]
pub struct SyncDeployReport {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// HTTP client for one environment's server
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// Create a new client. No global timeout: chunk uploads and SSE streams
    /// are long-lived; short endpoints set their own.
    pub fn new(base_url: &str, token: &str) -> Result<Self, FdeError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET /ping
    pub async fn ping(&self) -> Result<String, FdeError> {
        let url = self.url("/ping");
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .timeout(SHORT_TIMEOUT)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.text().await?)
    }

    /// GET /health
    pub async fn health(&self) -> Result<Value, FdeError> {
        let url = self.url("/health");
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .timeout(SHORT_TIMEOUT)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// POST /verify
    pub async fn verify(&self, env: &str) -> Result<(), FdeError> {
        let url = self.url("/verify");
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .timeout(SHORT_TIMEOUT)
            .header(header::AUTHORIZATION, &self.token)
            .json(&serde_json::json!({ "env": env }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// POST /upload/init
    pub async fn upload_init(&self, body: &InitRequestBody) -> Result<InitResponse, FdeError> {
        let url = self.url("/upload/init");
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, &self.token)
            .json(body)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// POST /upload/chunk
    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        env: &str,
        body: Vec<u8>,
        md5: &str,
    ) -> Result<(), FdeError> {
        let url = self.url("/upload/chunk");
        let response = self
            .client
            .post(&url)
            .query(&[
                ("uploadId", upload_id),
                ("chunkIndex", &chunk_index.to_string()),
                ("env", env),
            ])
            .header(header::AUTHORIZATION, &self.token)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header("X-Chunk-MD5", md5)
            .body(body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// POST /upload/complete
    pub async fn upload_complete(
        &self,
        body: &CompleteRequestBody,
    ) -> Result<UploadOutcome, FdeError> {
        let url = self.url("/upload/complete");
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, &self.token)
            .json(body)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// GET /upload/status
    pub async fn upload_status(&self, upload_id: &str, env: &str) -> Result<Value, FdeError> {
        let url = self.url("/upload/status");
        let response = self
            .client
            .get(&url)
            .query(&[("uploadId", upload_id), ("env", env)])
            .timeout(SHORT_TIMEOUT)
            .header(header::AUTHORIZATION, &self.token)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// DELETE /upload/cancel
    pub async fn upload_cancel(&self, upload_id: &str, env: &str) -> Result<(), FdeError> {
        let url = self.url("/upload/cancel");
        let response = self
            .client
            .delete(&url)
            .query(&[("uploadId", upload_id), ("env", env)])
            .timeout(SHORT_TIMEOUT)
            .header(header::AUTHORIZATION, &self.token)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// POST /upload — single-shot multipart for files at or under one chunk.
    pub async fn upload_small(
        &self,
        env: &str,
        file_name: &str,
        bytes: Vec<u8>,
        checksum: Option<&str>,
        should_extract: bool,
    ) -> Result<UploadOutcome, FdeError> {
        let url = self.url("/upload");
        debug!("POST {} (multipart)", url);

        let mut form = reqwest::multipart::Form::new()
            .text("env", env.to_string())
            .text("shouldExtract", should_extract.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string()),
            );
        if let Some(checksum) = checksum {
            form = form.text("checksum", checksum.to_string());
        }

        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, &self.token)
            .multipart(form)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// POST /deploy with `stream: false`; both the 200 and the 500 body are
    /// parsed into a report so the caller can print server output.
    pub async fn deploy_sync(&self, env: &str) -> Result<SyncDeployReport, FdeError> {
        let url = self.url("/deploy");
        debug!("POST {} (sync)", url);
        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, &self.token)
            .json(&serde_json::json!({ "env": env, "stream": false }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR || status.is_success() {
            let body: Value = response.json().await?;
            return Ok(SyncDeployReport {
                success: body["success"].as_bool().unwrap_or(false),
                stdout: body["stdout"].as_str().unwrap_or_default().to_string(),
                stderr: body["stderr"].as_str().unwrap_or_default().to_string(),
                exit_code: body["exitCode"].as_i64().map(|c| c as i32),
                error: body["error"].as_str().map(String::from),
            });
        }
        Err(error_from(status, response.text().await.unwrap_or_default()))
    }

    /// POST /deploy with `stream: true`, optionally resuming from a last
    /// event id. Returns the open response for SSE consumption.
    pub async fn deploy_stream(
        &self,
        env: &str,
        last_event_id: Option<u64>,
    ) -> Result<reqwest::Response, FdeError> {
        let url = self.url("/deploy");
        debug!("POST {} (stream, resume from {:?})", url, last_event_id);

        let mut request = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, &self.token)
            .header(header::ACCEPT, "text/event-stream")
            .json(&serde_json::json!({ "env": env, "stream": true }));
        if let Some(id) = last_event_id {
            request = request.header("Last-Event-ID", id.to_string());
        }

        let response = request.send().await?;
        check(response).await
    }

    /// GET /deploy/status
    pub async fn deploy_status(&self, env: &str) -> Result<Value, FdeError> {
        let url = self.url("/deploy/status");
        let response = self
            .client
            .get(&url)
            .query(&[("env", env)])
            .timeout(SHORT_TIMEOUT)
            .header(header::AUTHORIZATION, &self.token)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }
}

/// Map a non-success response to a typed error using the JSON error body
/// when present.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, FdeError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(error_from(status, body))
}

fn error_from(status: StatusCode, body: String) -> FdeError {
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["error"].as_str().map(String::from))
        .unwrap_or(body);

    match status {
        StatusCode::FORBIDDEN => FdeError::Auth(message),
        StatusCode::CONFLICT => FdeError::Conflict(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            FdeError::Validation(message)
        }
        _ => FdeError::Server(format!("{}: {}", status, message)),
    }
}
