//! Streamed deploy integration tests: real subprocesses pumped through the
//! per-environment state machine.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fde::paths::PathContext;
use fde::server::command::{prepare_deploy_command, PreparedCommand};
use fde::server::deploy::{run_streamed, DeployManager, EventKind, EventRecord};
use tokio::sync::broadcast;

fn prepared(command: &str, dir: &Path) -> PreparedCommand {
    prepare_deploy_command(
        command,
        &dir.join("uploads"),
        &PathContext::native(dir.to_path_buf()),
    )
}

fn drain(rx: &mut broadcast::Receiver<EventRecord>) -> Vec<EventRecord> {
    let mut events = Vec::new();
    while let Ok(record) = rx.try_recv() {
        events.push(record);
    }
    events
}

fn assert_strictly_increasing(events: &[EventRecord]) {
    for pair in events.windows(2) {
        assert!(pair[1].id > pair[0].id, "ids must be strictly increasing");
    }
}

#[tokio::test]
async fn test_streamed_deploy_success() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(DeployManager::new());

    let mut rx = manager.begin("test").await.unwrap();
    run_streamed(
        manager.clone(),
        "test".to_string(),
        prepared("echo 'test deployed'", dir.path()),
    )
    .await;

    let events = drain(&mut rx);
    assert_strictly_increasing(&events);

    let output = events
        .iter()
        .find(|e| e.event == EventKind::Output)
        .expect("an output event");
    assert_eq!(output.data["type"], "stdout");
    assert_eq!(output.data["data"], "test deployed\n");

    let terminal = events.last().unwrap();
    assert_eq!(terminal.event, EventKind::Done);
    assert_eq!(terminal.data["success"], true);
    assert_eq!(terminal.data["exitCode"], 0);

    let status = manager.status("test").await;
    assert!(!status.running);
    assert_eq!(status.buffered_count, 0);
    let last = status.last_result.unwrap();
    assert!(last.success);
    assert_eq!(last.exit_code, 0);
}

#[tokio::test]
async fn test_streamed_deploy_failure() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(DeployManager::new());

    let mut rx = manager.begin("test").await.unwrap();
    run_streamed(
        manager.clone(),
        "test".to_string(),
        prepared("echo Starting && echo Err >&2 && exit 1", dir.path()),
    )
    .await;

    let events = drain(&mut rx);
    assert_strictly_increasing(&events);

    let stdout = events
        .iter()
        .find(|e| e.event == EventKind::Output && e.data["type"] == "stdout")
        .expect("a stdout event");
    assert_eq!(stdout.data["data"], "Starting\n");

    let stderr = events
        .iter()
        .find(|e| e.event == EventKind::Output && e.data["type"] == "stderr")
        .expect("a stderr event");
    assert_eq!(stderr.data["data"], "Err\n");

    let terminal = events.last().unwrap();
    assert_eq!(terminal.event, EventKind::Error);
    assert_eq!(terminal.data["exitCode"], 1);
    assert!(terminal.data["stdout"]
        .as_str()
        .unwrap()
        .contains("Starting"));
    assert!(terminal.data["stderr"].as_str().unwrap().contains("Err"));

    let status = manager.status("test").await;
    assert!(!status.running);
    let last = status.last_result.unwrap();
    assert!(!last.success);
    assert_eq!(last.exit_code, 1);
}

#[tokio::test]
async fn test_reconnect_replays_from_last_event_id() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(DeployManager::new());

    let mut rx = manager.begin("test").await.unwrap();
    let driver = tokio::spawn(run_streamed(
        manager.clone(),
        "test".to_string(),
        prepared("echo one; echo two; sleep 0.5; echo three; echo four", dir.path()),
    ));

    // Client A reads up to id 2, then drops
    let mut seen = 0;
    while seen < 2 {
        let record = rx.recv().await.unwrap();
        seen = record.id;
    }
    drop(rx);

    // Client B reconnects with Last-Event-ID: 1
    match manager.resume("test", 1).await {
        fde::server::deploy::ResumeStart::Running { backlog, mut rx } => {
            assert!(backlog.iter().all(|r| r.id > 1));
            assert_eq!(backlog.first().map(|r| r.id), Some(2));

            let mut last_id = backlog.last().map(|r| r.id).unwrap_or(1);
            loop {
                let record = rx.recv().await.unwrap();
                assert!(record.id > last_id);
                last_id = record.id;
                if record.event != EventKind::Output {
                    assert_eq!(record.event, EventKind::Done);
                    break;
                }
            }
        }
        _ => panic!("deploy should still be running"),
    }

    driver.await.unwrap();
}

#[tokio::test]
async fn test_second_deploy_conflicts_while_first_runs() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(DeployManager::new());

    let _rx = manager.begin("test").await.unwrap();
    let driver = tokio::spawn(run_streamed(
        manager.clone(),
        "test".to_string(),
        prepared("sleep 0.4; echo done", dir.path()),
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let reason = manager.begin("test").await.unwrap_err();
    assert!(reason.contains("in progress"));

    driver.await.unwrap();
}

#[tokio::test]
async fn test_client_disconnect_does_not_cancel_deploy() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(DeployManager::new());
    let marker = dir.path().join("deployed.txt");

    let rx = manager.begin("test").await.unwrap();
    // The only subscriber goes away immediately
    drop(rx);

    run_streamed(
        manager.clone(),
        "test".to_string(),
        prepared(&format!("sleep 0.2; echo ok > {}", marker.display()), dir.path()),
    )
    .await;

    // The subprocess ran to completion and the result is queryable
    assert!(marker.exists());
    let status = manager.status("test").await;
    assert!(status.last_result.unwrap().success);
}
