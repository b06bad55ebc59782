//! Tests for the controller sync channel
//!
//! Frame shapes are checked as JSON; the reconnecting channel is exercised
//! against a local websocket server.

use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use runner_agent::approval::ApprovalSink;
use runner_agent::sync::{
    APPROVAL_EXPIRED, RunnerCapabilities, SyncChannel, SyncConfig, SyncHandle, SyncMessage,
    TransportEvent,
};
use runner_agent::types::{
    ApprovalAnswer, ApprovalPrompt, BackendKind, PendingApproval, RequestId, RunnerId, SessionId,
    ToolName,
};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Frames
// ============================================================================

#[test]
fn test_capabilities_serialize_as_flags() {
    let caps = RunnerCapabilities::PROTOCOL_SESSIONS | RunnerCapabilities::APPROVALS;
    let value = serde_json::to_value(caps).unwrap();
    assert_eq!(
        value,
        serde_json::json!({
            "protocolSessions": true,
            "terminalSessions": false,
            "approvals": true,
            "resume": false,
            "interrupt": false
        })
    );

    let parsed: RunnerCapabilities =
        serde_json::from_value(serde_json::json!({"resume": true})).unwrap();
    assert_eq!(parsed, RunnerCapabilities::RESUME);
    assert_eq!(RunnerCapabilities::default(), RunnerCapabilities::all());
}

#[test]
fn test_approval_request_frame_is_flat() {
    let pending = PendingApproval::from_prompt(
        ApprovalPrompt {
            request_id: RequestId::new("cli_1"),
            tool_name: ToolName::new("Bash"),
            input: serde_json::json!({"command": "ls"}),
            options: vec!["Allow".to_string(), "Deny".to_string()],
            is_multi_select: false,
            has_other: true,
        },
        SessionId::new("s1"),
        None,
        None,
        Utc::now(),
    );
    let frame = SyncMessage::approval_request(RunnerId::new("r1"), &pending);
    let value = serde_json::to_value(&frame).unwrap();

    assert_eq!(value["type"], "approval_request");
    assert_eq!(value["runnerId"], "r1");
    assert_eq!(value["sessionId"], "s1");
    assert_eq!(value["requestId"], "cli_1");
    assert_eq!(value["toolName"], "Bash");
    assert_eq!(value["options"][1], "Deny");
    assert_eq!(value["hasOther"], true);
    assert_eq!(value["resendCount"], 0);
    assert_eq!(frame.kind(), "approval_request");
}

#[test]
fn test_controller_frames_parse() {
    let response: SyncMessage = serde_json::from_value(serde_json::json!({
        "type": "approval_response", "requestId": "cli_1", "optionNumber": 3, "message": "no"
    }))
    .unwrap();
    assert_eq!(
        response,
        SyncMessage::ApprovalResponse {
            request_id: RequestId::new("cli_1"),
            answer: ApprovalAnswer {
                option_number: 3,
                message: Some("no".to_string())
            }
        }
    );

    let start: SyncMessage = serde_json::from_value(serde_json::json!({
        "type": "session_start", "sessionId": "s1", "cliType": "claude",
        "folderPath": "/work", "resumeSessionId": "Y"
    }))
    .unwrap();
    match start {
        SyncMessage::SessionStart {
            plugin,
            resume_session_id,
            initial_message,
            ..
        } => {
            assert_eq!(plugin, BackendKind::Protocol);
            assert_eq!(resume_session_id.as_deref(), Some("Y"));
            assert_eq!(initial_message, None);
        }
        other => panic!("Expected session_start, got {other:?}"),
    }

    let sync: SyncMessage =
        serde_json::from_value(serde_json::json!({"type": "permission_sync_request"})).unwrap();
    assert_eq!(
        sync,
        SyncMessage::PermissionSyncRequest {
            request_id: None,
            runner_id: None
        }
    );
}

#[test]
fn test_approval_expired_frame() {
    let frame = SyncMessage::approval_expired(RequestId::new("cli_1"), Some(SessionId::new("s1")));
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["type"], "error");
    assert_eq!(value["code"], APPROVAL_EXPIRED);
    assert_eq!(value["requestId"], "cli_1");
    assert_eq!(value["message"], "Approval cli_1 has expired");
}

#[test]
fn test_detached_handle_refuses_immediately() {
    let handle = SyncHandle::detached(RunnerId::new("r1"));
    assert!(!handle.is_open());
    assert!(!handle.send(SyncMessage::SessionEnd {
        session_id: SessionId::new("s1")
    }));
    assert!(handle.connected_runners().is_empty());
}

// ============================================================================
// Channel
// ============================================================================

fn config(url: String) -> SyncConfig {
    SyncConfig {
        url,
        token: Some("secret".to_string()),
        runner_id: RunnerId::new("r1"),
        reconnect_delay: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(100),
        ping_interval: Duration::from_secs(10),
        ping_timeout: Duration::from_secs(30),
        capabilities: RunnerCapabilities::default(),
        cli_types: vec!["claude".to_string()],
    }
}

async fn next_text<S>(ws: &mut S) -> SyncMessage
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => {}
            other => panic!("Connection ended: {other:?}"),
        }
    }
}

async fn next_event(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event stream ended")
}

#[tokio::test]
async fn test_channel_registers_first_and_relays_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/runner", listener.local_addr().unwrap());

    let shutdown = CancellationToken::new();
    let (handle, mut events, task) = SyncChannel::spawn(config(url), shutdown.clone());

    let (stream, _) = listener.accept().await.unwrap();
    let (auth_tx, auth_rx) = tokio::sync::oneshot::channel();
    let check_auth = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let auth = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let _ = auth_tx.send(auth);
        Ok(response)
    };
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, check_auth)
        .await
        .unwrap();
    assert_eq!(auth_rx.await.unwrap().as_deref(), Some("Bearer secret"));

    match next_text(&mut ws).await {
        SyncMessage::Register {
            runner_id,
            cli_types,
            capabilities,
            ..
        } => {
            assert_eq!(runner_id.as_str(), "r1");
            assert_eq!(cli_types, vec!["claude"]);
            assert_eq!(capabilities, RunnerCapabilities::all());
        }
        other => panic!("First frame must be register, got {other:?}"),
    }
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    assert!(handle.is_open());
    assert_eq!(handle.connected_runners(), vec![RunnerId::new("r1")]);

    // Controller -> runner
    let input = SyncMessage::SessionInput {
        session_id: SessionId::new("s1"),
        text: "hello".to_string(),
    };
    ws.send(Message::Text(serde_json::to_string(&input).unwrap()))
        .await
        .unwrap();
    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Message(input));

    // Runner -> controller, with heartbeats interleaved
    handle.set_active_sessions(2);
    assert!(handle.send(SyncMessage::Output {
        session_id: SessionId::new("s1"),
        content: "Hi!".to_string(),
        is_complete: true,
    }));
    let mut saw_output = false;
    let mut saw_heartbeat = false;
    while !(saw_output && saw_heartbeat) {
        match next_text(&mut ws).await {
            SyncMessage::Output { content, .. } => {
                assert_eq!(content, "Hi!");
                saw_output = true;
            }
            // Beats sent before the update still report zero
            SyncMessage::Heartbeat { active_sessions, .. } => {
                saw_heartbeat |= active_sessions == 2;
            }
            other => panic!("Unexpected frame {other:?}"),
        }
    }

    // Controller hangs up; the handle stops accepting frames
    ws.close(None).await.unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected);
    assert!(!handle.is_open());
    assert!(!handle.send(SyncMessage::SessionEnd {
        session_id: SessionId::new("s1")
    }));

    // And reconnects, registering again
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    assert!(matches!(next_text(&mut ws).await, SyncMessage::Register { .. }));
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("channel did not stop")
        .unwrap();
}
