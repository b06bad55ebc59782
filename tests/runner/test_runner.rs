//! Tests for the runner event loop handlers
//!
//! The runner is driven directly through its handlers with a detached
//! controller handle, so nothing here needs a controller.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use runner_agent::registry::SessionStore;
use runner_agent::runner::StartRequest;
use runner_agent::sync::{SyncHandle, SyncMessage, TransportEvent};
use runner_agent::types::{
    ApprovalPrompt, BackendKind, RequestId, RunnerId, SessionEnvelope, SessionEvent, SessionId,
    ToolName,
};
use runner_agent::{Runner, RunnerConfig};
use tempfile::TempDir;

fn runner(dir: &TempDir, approval_ttl: Duration) -> Runner {
    let config = RunnerConfig::builder()
        .runner_id("r1")
        .data_dir(dir.path())
        .approval_ttl(approval_ttl)
        .build()
        .unwrap();
    Runner::new(config, SyncHandle::detached(RunnerId::new("r1")))
        .with_locator(|cli| (cli == "cat").then(|| PathBuf::from("/bin/cat")))
}

/// Runner whose only CLI is the given script
fn scripted_runner(dir: &TempDir, approval_ttl: Duration, script: &str) -> Runner {
    let path = dir.path().join("fake-cli");
    std::fs::write(&path, format!("#!/bin/sh\n{script}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    let config = RunnerConfig::builder()
        .runner_id("r1")
        .data_dir(dir.path())
        .approval_ttl(approval_ttl)
        .build()
        .unwrap();
    Runner::new(config, SyncHandle::detached(RunnerId::new("r1")))
        .with_locator(move |cli| (cli == "fake-cli").then(|| path.clone()))
}

/// Pump session events until the coordinator tracks `count` approvals
async fn await_approvals(runner: &mut Runner, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while runner.approvals().len() < count {
            runner.handle_queued_session_events().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("approval never reached the runner");
}

async fn read_when_written(path: &Path) -> String {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(text) = std::fs::read_to_string(path)
                && text.ends_with('\n')
            {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("backend never wrote its reply")
}

fn start_request(session: &str, cli_type: &str, dir: &TempDir) -> StartRequest {
    start_with(session, cli_type, BackendKind::Terminal, dir)
}

fn start_with(session: &str, cli_type: &str, plugin: BackendKind, dir: &TempDir) -> StartRequest {
    StartRequest {
        session_id: SessionId::new(session),
        cli_type: cli_type.to_string(),
        plugin,
        folder_path: dir.path().to_string_lossy().into_owned(),
        resume_session_id: None,
        channel_id: Some("C1".to_string()),
        model: None,
        initial_message: None,
    }
}

fn prompt(request_id: &str) -> SessionEvent {
    SessionEvent::ApprovalRequested(ApprovalPrompt {
        request_id: RequestId::new(request_id),
        tool_name: ToolName::new("TerminalPrompt"),
        input: serde_json::json!({"text": "Continue? [y/n]"}),
        options: vec!["Yes".to_string(), "No".to_string()],
        is_multi_select: false,
        has_other: false,
    })
}

fn envelope(session: &str, event: SessionEvent) -> SessionEnvelope {
    SessionEnvelope {
        session_id: SessionId::new(session),
        event,
    }
}

#[tokio::test]
async fn test_missing_cli_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner(&dir, Duration::from_secs(60));

    runner.start_session(start_request("s1", "nope", &dir)).await;

    assert!(runner.registry().is_empty());
    assert!(runner.registry().record(&SessionId::new("s1")).is_none());
}

#[tokio::test]
async fn test_session_lifecycle_from_controller_frames() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner(&dir, Duration::from_secs(60));
    let s1 = SessionId::new("s1");

    runner
        .handle_transport_event(TransportEvent::Message(SyncMessage::SessionStart {
            session_id: s1.clone(),
            cli_type: "cat".to_string(),
            plugin: BackendKind::Terminal,
            folder_path: dir.path().to_string_lossy().into_owned(),
            resume_session_id: None,
            channel_id: Some("C1".to_string()),
            model: None,
            initial_message: Some("hello".to_string()),
        }))
        .await;

    assert!(runner.registry().get(&s1).is_some());
    let record = runner.registry().record(&s1).unwrap();
    assert_eq!(record.cli_type, "cat");
    assert_eq!(record.plugin, BackendKind::Terminal);
    assert_eq!(record.runner_id, Some(RunnerId::new("r1")));

    // Backend id is persisted for resume
    runner
        .handle_session_event(envelope("s1", SessionEvent::BackendSessionId("abc".to_string())))
        .await;
    let stored = SessionStore::in_dir(dir.path()).load();
    assert_eq!(stored[&s1].backend_session_id.as_deref(), Some("abc"));

    // Approvals raised by the session are tracked until cleared
    runner.handle_session_event(envelope("s1", prompt("s1-1"))).await;
    assert_eq!(runner.approvals().len(), 1);
    runner
        .handle_session_event(envelope(
            "s1",
            SessionEvent::ApprovalCleared {
                request_id: RequestId::new("s1-1"),
            },
        ))
        .await;
    assert!(runner.approvals().is_empty());

    runner.handle_session_event(envelope("s1", prompt("s1-2"))).await;
    runner
        .handle_transport_event(TransportEvent::Message(SyncMessage::SessionEnd {
            session_id: s1.clone(),
        }))
        .await;

    assert!(runner.registry().get(&s1).is_none());
    assert!(runner.registry().record(&s1).is_none());
    assert!(runner.approvals().is_empty());
    assert!(!SessionStore::in_dir(dir.path()).load().contains_key(&s1));
}

#[tokio::test]
async fn test_unexpected_exit_keeps_record_for_resume() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner(&dir, Duration::from_secs(60));
    let s1 = SessionId::new("s1");

    runner.start_session(start_request("s1", "cat", &dir)).await;
    runner.handle_session_event(envelope("s1", prompt("s1-1"))).await;
    runner
        .handle_session_event(envelope("s1", SessionEvent::Exited { code: Some(1) }))
        .await;

    assert!(runner.registry().get(&s1).is_none());
    assert!(runner.registry().record(&s1).is_some());
    assert!(runner.approvals().is_empty());

    // A second exit report for the same session is ignored
    runner
        .handle_session_event(envelope("s1", SessionEvent::Exited { code: None }))
        .await;
    assert!(runner.registry().record(&s1).is_some());
}

#[tokio::test]
async fn test_undecided_approvals_expire() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner(&dir, Duration::from_secs(1));
    let s1 = SessionId::new("s1");

    runner.start_session(start_request("s1", "cat", &dir)).await;
    runner.handle_session_event(envelope("s1", prompt("s1-1"))).await;
    assert_eq!(runner.approvals().len(), 1);

    // Reconnect reissues without a controller; the approval stays pending
    runner.handle_transport_event(TransportEvent::Connected).await;
    assert_eq!(runner.approvals().len(), 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    runner.expire_approvals().await;
    assert!(runner.approvals().is_empty());

    runner.end_session(&s1).await;
    assert!(runner.registry().is_empty());
}

#[tokio::test]
async fn test_expired_question_is_denied_to_protocol_backend() {
    let dir = tempfile::tempdir().unwrap();
    let reply_file = dir.path().join("reply.json");
    let script = format!(
        r#"printf '%s\n' '{{"type":"system","subtype":"init","session_id":"backend-q"}}'
printf '%s\n' '{{"type":"control_request","request_id":"cli_q","request":{{"subtype":"can_use_tool","tool_name":"AskUserQuestion","input":{{"questions":[{{"question":"Which database?","options":[{{"label":"Postgres"}},{{"label":"SQLite"}}]}}]}}}}}}'
read reply
printf '%s\n' "$reply" > '{}'
read line
"#,
        reply_file.display()
    );
    let mut runner = scripted_runner(&dir, Duration::from_secs(1), &script);
    let s1 = SessionId::new("s1");

    runner
        .start_session(start_with("s1", "fake-cli", BackendKind::Protocol, &dir))
        .await;
    await_approvals(&mut runner, 1).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    runner.expire_approvals().await;
    assert!(runner.approvals().is_empty());

    let reply = read_when_written(&reply_file).await;
    assert!(reply.contains(r#""request_id":"cli_q""#), "{reply}");
    assert!(reply.contains(r#""behavior":"deny""#), "{reply}");
    assert!(!reply.contains("answers"), "{reply}");

    runner.end_session(&s1).await;
}

#[tokio::test]
async fn test_expired_terminal_prompt_types_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let typed_file = dir.path().join("typed.txt");
    let script = format!(
        "printf 'Proceed?\\n1. Yes\\n2. No\\n'\nread answer\nprintf 'GOT[%s]\\n' \"$answer\" > '{}'\n",
        typed_file.display()
    );
    let mut runner = scripted_runner(&dir, Duration::from_secs(1), &script);
    let s1 = SessionId::new("s1");

    runner.start_session(start_request("s1", "fake-cli", &dir)).await;
    await_approvals(&mut runner, 1).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    runner.expire_approvals().await;
    assert!(runner.approvals().is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    runner.handle_queued_session_events().await;
    assert!(
        !typed_file.exists(),
        "expiry wrote to the backend's stdin"
    );
    assert!(runner.approvals().is_empty());

    runner.end_session(&s1).await;
}
