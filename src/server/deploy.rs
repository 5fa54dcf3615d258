//! Deploy executor and per-environment SSE state machine.
//!
//! Deploys are serialised per environment: one mutex-guarded state record
//! holds `running`, the event buffer, the 1-based event counter and the last
//! result. Live SSE pumps are woken through a per-environment broadcast
//! channel; the buffer is the replay source for reconnecting clients. The
//! lock is only ever held around small in-memory operations, never across a
//! network write. A client dropping its stream never cancels the deploy: the
//! subprocess runs to completion and its terminal result stays queryable.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::server::auth::validate_request;
use crate::server::command::{prepare_deploy_command, PreparedCommand};
use crate::server::error::ApiError;
use crate::server::header_str;
use crate::server::state::ServerState;

/// Quiet period after a deploy ends; absorbs duplicate triggers from
/// reverse proxies and retry loops.
pub const DEPLOY_COOLDOWN: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Which stream a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Stdout => "stdout",
            OutputKind::Stderr => "stderr",
        }
    }
}

/// SSE event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Output,
    Done,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Output => "output",
            EventKind::Done => "done",
            EventKind::Error => "error",
        }
    }
}

/// One buffered (and broadcast) event.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: u64,
    pub event: EventKind,
    pub data: Value,
}

/// Terminal outcome of the most recent deploy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub exit_code: i32,
}

/// Mutable per-environment deploy state.
#[derive(Debug)]
pub struct DeployState {
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub buffer: Vec<EventRecord>,
    pub next_id: u64,
    pub last_result: Option<DeployResult>,
}

impl Default for DeployState {
    fn default() -> Self {
        Self {
            running: false,
            start_time: None,
            buffer: Vec::new(),
            next_id: 1,
            last_result: None,
        }
    }
}

struct EnvDeploy {
    state: Mutex<DeployState>,
    events: broadcast::Sender<EventRecord>,
}

impl EnvDeploy {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(DeployState::default()),
            events,
        }
    }
}

/// Where a resume request picks up.
pub enum ResumeStart {
    /// Deploy still running: replay the backlog, then follow live events.
    Running {
        backlog: Vec<EventRecord>,
        rx: broadcast::Receiver<EventRecord>,
    },
    /// Deploy already ended (or never ran).
    Ended(Option<DeployResult>),
}

/// Authoritative status snapshot for `/deploy/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployStatusView {
    pub env: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    pub buffered_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<DeployResult>,
}

/// Sharded deploy state keyed by environment name.
pub struct DeployManager {
    envs: RwLock<HashMap<String, Arc<EnvDeploy>>>,
}

impl Default for DeployManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DeployManager {
    pub fn new() -> Self {
        Self {
            envs: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, env: &str) -> Arc<EnvDeploy> {
        if let Some(entry) = self.envs.read().await.get(env) {
            return entry.clone();
        }
        self.envs
            .write()
            .await
            .entry(env.to_string())
            .or_insert_with(|| Arc::new(EnvDeploy::new()))
            .clone()
    }

    /// Gate and start a fresh deploy. On success the state is transitioned
    /// (running, cleared buffer, counter reset) and a live subscription is
    /// returned; the returned error string is the 409 reason otherwise.
    pub async fn begin(&self, env: &str) -> Result<broadcast::Receiver<EventRecord>, String> {
        let entry = self.entry(env).await;
        let mut state = entry.state.lock().await;

        if state.running {
            return Err(format!(
                "deployment already in progress for environment '{}'",
                env
            ));
        }
        if let Some(last) = &state.last_result {
            let cooldown = chrono::Duration::from_std(DEPLOY_COOLDOWN)
                .expect("cooldown fits chrono range");
            if Utc::now() - last.end_time < cooldown {
                return Err(format!(
                    "deployment cooldown active for environment '{}': {}s quiet period after the previous deploy absorbs duplicate triggers",
                    env,
                    DEPLOY_COOLDOWN.as_secs()
                ));
            }
        }

        state.running = true;
        state.start_time = Some(Utc::now());
        state.buffer.clear();
        state.next_id = 1;
        state.last_result = None;
        Ok(entry.events.subscribe())
    }

    /// Append one output event; returns its id.
    pub async fn push_output(&self, env: &str, kind: OutputKind, data: String) -> u64 {
        let entry = self.entry(env).await;
        let mut state = entry.state.lock().await;

        let record = EventRecord {
            id: state.next_id,
            event: EventKind::Output,
            data: json!({ "type": kind.as_str(), "data": data }),
        };
        state.next_id += 1;
        state.buffer.push(record.clone());
        let _ = entry.events.send(record.clone());
        record.id
    }

    /// Append the terminal event, store the last result, and clear the
    /// buffer. The terminal event reaches live subscribers through the
    /// broadcast channel; later resumes synthesise it from `last_result`.
    pub async fn finish(
        &self,
        env: &str,
        exit_code: i32,
        stdout: String,
        stderr: String,
        error_note: Option<String>,
    ) {
        let entry = self.entry(env).await;
        let mut state = entry.state.lock().await;

        let success = exit_code == 0 && error_note.is_none();
        let (event, data) = if success {
            (EventKind::Done, json!({ "success": true, "exitCode": 0 }))
        } else {
            (
                EventKind::Error,
                json!({
                    "error": error_note.unwrap_or_else(|| "deploy command failed".to_string()),
                    "exitCode": exit_code,
                    "stdout": stdout,
                    "stderr": stderr,
                }),
            )
        };

        let record = EventRecord {
            id: state.next_id,
            event,
            data,
        };
        state.next_id += 1;
        state.buffer.push(record.clone());
        let _ = entry.events.send(record);

        let end_time = Utc::now();
        state.last_result = Some(DeployResult {
            success,
            start_time: state.start_time.unwrap_or(end_time),
            end_time,
            exit_code,
        });
        state.running = false;
        state.buffer.clear();

        info!(env, exit_code, success, "deploy finished");
    }

    /// Snapshot for a resume request: strictly a replay, never mutates the
    /// running flag, the counter or the buffer. The snapshot and the live
    /// subscription are taken under one lock so no event is lost or
    /// duplicated in between.
    pub async fn resume(&self, env: &str, after: u64) -> ResumeStart {
        let entry = self.entry(env).await;
        let state = entry.state.lock().await;

        if state.running {
            let backlog = state
                .buffer
                .iter()
                .filter(|r| r.id > after)
                .cloned()
                .collect();
            ResumeStart::Running {
                backlog,
                rx: entry.events.subscribe(),
            }
        } else {
            ResumeStart::Ended(state.last_result.clone())
        }
    }

    pub async fn status(&self, env: &str) -> DeployStatusView {
        let entry = self.entry(env).await;
        let state = entry.state.lock().await;
        DeployStatusView {
            env: env.to_string(),
            running: state.running,
            start_time: state.start_time,
            buffered_count: state.buffer.len(),
            last_result: state.last_result.clone(),
        }
    }
}

/// Drive the subprocess for a streamed deploy: pump stdout and stderr into
/// the state machine line by line, then record the terminal result. Runs
/// detached from any client connection.
pub async fn run_streamed(manager: Arc<DeployManager>, env: String, prepared: PreparedCommand) {
    let mut command = prepared.build();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(env = %env, error = %e, "failed to spawn deploy command");
            manager
                .finish(
                    &env,
                    -1,
                    String::new(),
                    String::new(),
                    Some(format!("failed to start deploy command: {}", e)),
                )
                .await;
            return;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_pump = pump_lines(manager.clone(), env.clone(), OutputKind::Stdout, stdout);
    let err_pump = pump_lines(manager.clone(), env.clone(), OutputKind::Stderr, stderr);
    let (stdout_acc, stderr_acc) = tokio::join!(out_pump, err_pump);

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            error!(env = %env, error = %e, "failed to await deploy command");
            -1
        }
    };

    manager
        .finish(&env, exit_code, stdout_acc, stderr_acc, None)
        .await;
}

async fn pump_lines<R>(
    manager: Arc<DeployManager>,
    env: String,
    kind: OutputKind,
    reader: Option<R>,
) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut acc = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        let text = format!("{}\n", line);
        acc.push_str(&text);
        manager.push_output(&env, kind, text).await;
    }
    acc
}

// ---------------------------- HTTP handlers ---------------------------- //

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub env: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub env: Option<String>,
}

/// POST /deploy
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<DeployRequest>,
) -> Response {
    let auth = header_str(&headers, header::AUTHORIZATION.as_str());
    let env_config = match validate_request(req.env.as_deref(), auth, &state.config) {
        Ok(env) => env,
        Err(msg) => return ApiError::from_validation(msg).into_response(),
    };
    let server_env = match env_config.server_view() {
        Ok(view) => view,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let env_name = server_env.name.to_string();
    let prepared = prepare_deploy_command(
        server_env.deploy_command,
        server_env.upload_path,
        &state.config.ctx,
    );

    let last_event_id = match header_str(&headers, "last-event-id") {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(id) => Some(id),
            Err(_) => {
                return ApiError::bad_request("invalid Last-Event-ID header").into_response()
            }
        },
        None => None,
    };

    if !req.stream {
        return run_sync(prepared).await;
    }

    match last_event_id {
        // Resume: no gating, pure replay.
        Some(after) => match state.deploys.resume(&env_name, after).await {
            ResumeStart::Running { backlog, rx } => {
                let replay = stream::iter(
                    backlog
                        .into_iter()
                        .map(|r| Ok::<_, std::convert::Infallible>(record_event(&r))),
                );
                sse_response(replay.chain(live_events(rx)).boxed())
            }
            ResumeStart::Ended(Some(result)) => {
                let event = if result.success {
                    Event::default()
                        .event(EventKind::Done.as_str())
                        .data(json!({ "success": true, "exitCode": result.exit_code }).to_string())
                } else {
                    Event::default()
                        .event(EventKind::Error.as_str())
                        .data(json!({ "exitCode": result.exit_code }).to_string())
                };
                sse_response(stream::once(async move { Ok(event) }).boxed())
            }
            ResumeStart::Ended(None) => {
                let event = Event::default()
                    .event(EventKind::Error.as_str())
                    .data(json!({ "error": "No deployment in progress" }).to_string());
                sse_response(stream::once(async move { Ok(event) }).boxed())
            }
        },
        // Fresh: gate, transition, spawn, follow live events.
        None => {
            let rx = match state.deploys.begin(&env_name).await {
                Ok(rx) => rx,
                Err(reason) => {
                    return (StatusCode::CONFLICT, Json(json!({ "error": reason })))
                        .into_response()
                }
            };
            info!(env = %env_name, "streamed deploy started");
            tokio::spawn(run_streamed(state.deploys.clone(), env_name, prepared));
            sse_response(live_events(rx).boxed())
        }
    }
}

/// GET /deploy/status
pub async fn deploy_status_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Response {
    let auth = header_str(&headers, header::AUTHORIZATION.as_str());
    let env_config = match validate_request(query.env.as_deref(), auth, &state.config) {
        Ok(env) => env,
        Err(msg) => return ApiError::from_validation(msg).into_response(),
    };

    let view = state.deploys.status(&env_config.name).await;
    Json(view).into_response()
}

/// Synchronous deploy: run to completion, return captured output. No state
/// machine, no cooldown.
async fn run_sync(prepared: PreparedCommand) -> Response {
    let output = match prepared.build().output().await {
        Ok(output) => output,
        Err(e) => {
            return ApiError::internal(format!("failed to start deploy command: {}", e))
                .into_response()
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if output.status.success() {
        Json(json!({ "success": true, "stdout": stdout, "stderr": stderr })).into_response()
    } else {
        let exit_code = output.status.code().unwrap_or(-1);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "deploy command failed",
                "stdout": stdout,
                "stderr": stderr,
                "exitCode": exit_code,
            })),
        )
            .into_response()
    }
}

fn record_event(record: &EventRecord) -> Event {
    Event::default()
        .id(record.id.to_string())
        .event(record.event.as_str())
        .data(record.data.to_string())
}

/// Follow the broadcast channel until the terminal event passes through.
fn live_events(
    rx: broadcast::Receiver<EventRecord>,
) -> impl futures::Stream<Item = Result<Event, std::convert::Infallible>> {
    stream::unfold(Some(rx), |rx| async move {
        let mut rx = rx?;
        loop {
            match rx.recv().await {
                Ok(record) => {
                    let terminal = record.event != EventKind::Output;
                    let event = record_event(&record);
                    return Some((Ok(event), (!terminal).then_some(rx)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "slow SSE consumer lagged behind deploy output");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

fn sse_response(stream: BoxStream<'static, Result<Event, std::convert::Infallible>>) -> Response {
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_ids_monotonic_and_buffer_cleared() {
        let manager = DeployManager::new();
        let mut rx = manager.begin("prod").await.unwrap();

        let a = manager
            .push_output("prod", OutputKind::Stdout, "one\n".to_string())
            .await;
        let b = manager
            .push_output("prod", OutputKind::Stderr, "two\n".to_string())
            .await;
        assert_eq!((a, b), (1, 2));

        manager
            .finish("prod", 0, "one\n".to_string(), "two\n".to_string(), None)
            .await;

        // Live subscriber observed every id in order, terminal last
        let ids: Vec<u64> = (0..3).map(|_| rx.try_recv().unwrap().id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let status = manager.status("prod").await;
        assert!(!status.running);
        assert_eq!(status.buffered_count, 0);
        let last = status.last_result.unwrap();
        assert!(last.success);
        assert_eq!(last.exit_code, 0);
    }

    #[tokio::test]
    async fn test_second_deploy_rejected_while_running() {
        let manager = DeployManager::new();
        let _rx = manager.begin("prod").await.unwrap();

        let reason = manager.begin("prod").await.unwrap_err();
        assert!(reason.contains("in progress"));

        // A different environment is unaffected
        assert!(manager.begin("staging").await.is_ok());
    }

    #[tokio::test]
    async fn test_cooldown_boundary() {
        let manager = DeployManager::new();
        let _rx = manager.begin("prod").await.unwrap();
        manager
            .finish("prod", 0, String::new(), String::new(), None)
            .await;

        // Immediately after: rejected with a cooldown reason
        let reason = manager.begin("prod").await.unwrap_err();
        assert!(reason.contains("cooldown"));

        // Backdate the end time to just inside the window: still rejected
        let entry = manager.entry("prod").await;
        entry.state.lock().await.last_result.as_mut().unwrap().end_time =
            Utc::now() - chrono::Duration::milliseconds(4_999);
        assert!(manager.begin("prod").await.is_err());

        // Just outside the window: accepted
        entry.state.lock().await.last_result.as_mut().unwrap().end_time =
            Utc::now() - chrono::Duration::milliseconds(5_001);
        assert!(manager.begin("prod").await.is_ok());
    }

    #[tokio::test]
    async fn test_resume_replays_only_newer_events() {
        let manager = DeployManager::new();
        let _rx = manager.begin("prod").await.unwrap();
        for i in 0..10 {
            manager
                .push_output("prod", OutputKind::Stdout, format!("line {}\n", i))
                .await;
        }

        match manager.resume("prod", 7).await {
            ResumeStart::Running { backlog, mut rx } => {
                let ids: Vec<u64> = backlog.iter().map(|r| r.id).collect();
                assert_eq!(ids, vec![8, 9, 10]);

                // Later events arrive through the live subscription
                let id = manager
                    .push_output("prod", OutputKind::Stdout, "more\n".to_string())
                    .await;
                assert_eq!(rx.try_recv().unwrap().id, id);
            }
            ResumeStart::Ended(_) => panic!("deploy should be running"),
        }
    }

    #[tokio::test]
    async fn test_resume_after_end_synthesises_terminal() {
        let manager = DeployManager::new();
        let _rx = manager.begin("prod").await.unwrap();
        manager
            .finish("prod", 1, String::new(), "boom\n".to_string(), None)
            .await;

        match manager.resume("prod", 3).await {
            ResumeStart::Ended(Some(result)) => {
                assert!(!result.success);
                assert_eq!(result.exit_code, 1);
            }
            _ => panic!("expected ended resume"),
        }

        // No deploy ever ran for this environment
        match manager.resume("fresh", 0).await {
            ResumeStart::Ended(None) => {}
            _ => panic!("expected empty resume"),
        }
    }

    #[tokio::test]
    async fn test_begin_clears_previous_state() {
        let manager = DeployManager::new();
        let _rx = manager.begin("prod").await.unwrap();
        manager
            .push_output("prod", OutputKind::Stdout, "old\n".to_string())
            .await;
        manager
            .finish("prod", 0, String::new(), String::new(), None)
            .await;

        // Skip the cooldown by backdating
        let entry = manager.entry("prod").await;
        entry.state.lock().await.last_result.as_mut().unwrap().end_time =
            Utc::now() - chrono::Duration::seconds(6);

        let _rx = manager.begin("prod").await.unwrap();
        let id = manager
            .push_output("prod", OutputKind::Stdout, "new\n".to_string())
            .await;
        // Counter reset to 1 for the new deploy
        assert_eq!(id, 1);
        let status = manager.status("prod").await;
        assert!(status.running);
        assert!(status.last_result.is_none());
    }
}
