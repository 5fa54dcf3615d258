//! Streamed deploy consumer.
//!
//! Consumes the SSE stream from `POST /deploy {stream: true}`, printing
//! output frames as they arrive and tracking the last event id. A dropped
//! connection reconnects with `Last-Event-ID` under jittered exponential
//! backoff; when reconnects are exhausted the terminal result is fetched
//! from `/deploy/status` instead.

use std::io::Write;
use std::time::Duration;

use futures::StreamExt;
use tracing::warn;

use crate::client::http::ApiClient;
use crate::errors::FdeError;
use crate::utils::{backoff_delay, BackoffOptions};

const MAX_RECONNECTS: u32 = 5;

/// Terminal outcome of a streamed deploy as observed by the client.
#[derive(Debug, Clone)]
pub struct StreamReport {
    pub success: bool,
    pub exit_code: Option<i32>,
}

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<u64>,
    pub event: String,
    pub data: String,
}

/// Run a streamed deploy to its terminal event, reconnecting on stream
/// failures.
pub async fn stream_deploy(client: &ApiClient, env: &str) -> Result<StreamReport, FdeError> {
    let mut last_id: Option<u64> = None;
    let mut attempts: u32 = 0;
    let backoff = BackoffOptions {
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(8),
        jitter: Duration::from_millis(500),
    };

    loop {
        match client.deploy_stream(env, last_id).await {
            Ok(response) => {
                match consume_stream(response, &mut last_id).await {
                    Ok(Some(report)) => return Ok(report),
                    // Stream closed without a terminal event: reconnect.
                    Ok(None) => warn!(env, "deploy stream closed early"),
                    Err(e) => warn!(env, "deploy stream interrupted: {}", e),
                }
            }
            // The gate and auth failures are not retryable conditions here;
            // a 409 tells the operator another deploy holds the environment.
            Err(e @ (FdeError::Conflict(_) | FdeError::Auth(_) | FdeError::Validation(_))) => {
                return Err(e)
            }
            Err(e) => warn!(env, "deploy stream connect failed: {}", e),
        }

        attempts += 1;
        if attempts > MAX_RECONNECTS {
            return report_from_status(client, env).await;
        }
        tokio::time::sleep(backoff_delay(&backoff, attempts - 1)).await;
    }
}

/// Consume frames until the terminal event. `Ok(None)` means the stream
/// ended cleanly without one (the caller reconnects).
async fn consume_stream(
    response: reqwest::Response,
    last_id: &mut Option<u64>,
) -> Result<Option<StreamReport>, FdeError> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find("\n\n") {
            let frame_text = buffer[..pos].to_string();
            buffer.drain(..pos + 2);

            let Some(frame) = parse_frame(&frame_text) else {
                continue;
            };
            if let Some(id) = frame.id {
                *last_id = Some(id);
            }

            match frame.event.as_str() {
                "output" => print_output(&frame.data),
                "done" => {
                    let data: serde_json::Value =
                        serde_json::from_str(&frame.data).unwrap_or_default();
                    return Ok(Some(StreamReport {
                        success: true,
                        exit_code: data["exitCode"].as_i64().map(|c| c as i32).or(Some(0)),
                    }));
                }
                "error" => {
                    let data: serde_json::Value =
                        serde_json::from_str(&frame.data).unwrap_or_default();
                    print_failure(&data);
                    return Ok(Some(StreamReport {
                        success: false,
                        exit_code: data["exitCode"].as_i64().map(|c| c as i32),
                    }));
                }
                _ => {}
            }
        }
    }

    Ok(None)
}

/// Parse one SSE frame (`id:` / `event:` / `data:` lines). Comment-only
/// keep-alive frames yield `None`.
pub fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut id = None;
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("id:") {
            id = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if id.is_none() && event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        id,
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}

fn print_output(data: &str) {
    let parsed: serde_json::Value = serde_json::from_str(data).unwrap_or_default();
    let text = parsed["data"].as_str().unwrap_or_default();
    match parsed["type"].as_str() {
        Some("stderr") => {
            eprint!("{}", text);
            let _ = std::io::stderr().flush();
        }
        _ => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
    }
}

fn print_failure(data: &serde_json::Value) {
    if let Some(message) = data["error"].as_str() {
        eprintln!("deploy failed: {}", message);
    }
    if let Some(stdout) = data["stdout"].as_str() {
        if !stdout.is_empty() {
            eprintln!("--- stdout ---\n{}", stdout);
        }
    }
    if let Some(stderr) = data["stderr"].as_str() {
        if !stderr.is_empty() {
            eprintln!("--- stderr ---\n{}", stderr);
        }
    }
}

/// Reconnects exhausted: ask the status endpoint for the terminal result.
async fn report_from_status(client: &ApiClient, env: &str) -> Result<StreamReport, FdeError> {
    let status = client.deploy_status(env).await?;
    if status["running"].as_bool().unwrap_or(false) {
        return Err(FdeError::Deploy(format!(
            "lost the deploy stream for '{}' and the deploy is still running; check /deploy/status",
            env
        )));
    }
    match status.get("lastResult") {
        Some(last) if !last.is_null() => Ok(StreamReport {
            success: last["success"].as_bool().unwrap_or(false),
            exit_code: last["exitCode"].as_i64().map(|c| c as i32),
        }),
        _ => Err(FdeError::Deploy(format!(
            "lost the deploy stream for '{}' and no result is recorded",
            env
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_full() {
        let frame = parse_frame("id: 7\nevent: output\ndata: {\"type\":\"stdout\",\"data\":\"hi\\n\"}")
            .unwrap();
        assert_eq!(frame.id, Some(7));
        assert_eq!(frame.event, "output");
        assert_eq!(frame.data, "{\"type\":\"stdout\",\"data\":\"hi\\n\"}");
    }

    #[test]
    fn test_parse_frame_without_id() {
        let frame = parse_frame("event: error\ndata: {\"error\":\"No deployment in progress\"}")
            .unwrap();
        assert_eq!(frame.id, None);
        assert_eq!(frame.event, "error");
    }

    #[test]
    fn test_parse_frame_multiline_data() {
        let frame = parse_frame("data: one\ndata: two").unwrap();
        assert_eq!(frame.event, "message");
        assert_eq!(frame.data, "one\ntwo");
    }

    #[test]
    fn test_parse_frame_keepalive_comment() {
        assert_eq!(parse_frame(": keep-alive"), None);
        assert_eq!(parse_frame(""), None);
    }
}
