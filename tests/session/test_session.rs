//! Tests for the session layer
//!
//! Pure pieces (throttler, queue, approval bridge, menu detection) are tested
//! directly; both backends are exercised end to end against small shell
//! scripts standing in for real CLIs.

use std::time::Duration;

use runner_agent::protocol::{DeltaMode, InboundControlRequest, ProtocolConfig};
use runner_agent::session::{
    AgentSession, ApprovalBridge, BridgeAction, MessageQueue, OutputThrottler, ProtocolSession,
    QUESTION_TOOL, SessionConfig, TerminalSession, ThrottleMode, detect_prompt,
};
use runner_agent::transport::ProcessSpec;
use runner_agent::types::{
    OutputFlush, PermissionResult, RequestId, SessionEnvelope, SessionEvent, SessionId,
    SessionStatus,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

// ============================================================================
// Throttling
// ============================================================================

#[test]
fn test_throttle_replace_emits_latest_snapshot() {
    let mut throttler = OutputThrottler::new(ThrottleMode::Replace);
    throttler.push("Now");
    throttler.push("Now I");
    throttler.push("Now I have");

    assert_eq!(
        throttler.flush(),
        Some(OutputFlush {
            content: "Now I have".to_string(),
            is_complete: false
        })
    );
    assert_eq!(throttler.flush(), None, "unchanged content is not re-emitted");

    assert_eq!(
        throttler.finish(),
        Some(OutputFlush {
            content: "Now I have".to_string(),
            is_complete: true
        }),
        "completion marker is sent even when content did not change"
    );
}

#[test]
fn test_throttle_append_concatenates() {
    let mut throttler = OutputThrottler::new(ThrottleMode::Append);
    throttler.push("Line 1\n");
    throttler.push("Line 2\n");
    assert_eq!(throttler.content(), "Line 1\nLine 2\n");

    let done = throttler.finish().unwrap();
    assert_eq!(done.content, "Line 1\nLine 2\n");
    assert!(done.is_complete);
    assert_eq!(throttler.content(), "", "finish resets for the next turn");
}

#[test]
fn test_throttle_empty_turn_emits_nothing() {
    let mut throttler = OutputThrottler::new(ThrottleMode::Append);
    assert!(!throttler.has_unflushed());
    assert_eq!(throttler.flush(), None);
    assert_eq!(throttler.finish(), None);
}

// ============================================================================
// Queueing
// ============================================================================

#[test]
fn test_queue_releases_one_at_a_time_in_order() {
    let mut queue = MessageQueue::new();
    queue.push("m1".to_string());
    queue.push("m2".to_string());
    assert_eq!(queue.push("m3".to_string()), 3);

    let now = Instant::now();
    assert_eq!(queue.take_next(now).as_deref(), Some("m1"));
    assert_eq!(queue.take_next(now), None, "m1 is still in flight");

    assert!(queue.complete_turn());
    assert_eq!(queue.take_next(now).as_deref(), Some("m2"));
    assert!(queue.complete_turn());
    assert_eq!(queue.take_next(now).as_deref(), Some("m3"));
    assert!(queue.complete_turn());
    assert!(queue.is_empty());
    assert!(!queue.complete_turn());
}

#[test]
fn test_queue_abort_holds_until_settled() {
    let mut queue = MessageQueue::new();
    queue.push("m1".to_string());
    queue.push("m2".to_string());

    let now = Instant::now();
    assert_eq!(queue.take_next(now).as_deref(), Some("m1"));
    assert!(queue.abort_turn(now + Duration::from_secs(2)));
    assert!(!queue.is_in_flight());
    assert_eq!(queue.len(), 1, "interrupt keeps queued messages");

    assert_eq!(queue.take_next(now + Duration::from_secs(1)), None);
    assert_eq!(
        queue.take_next(now + Duration::from_secs(2)).as_deref(),
        Some("m2")
    );
    assert_eq!(queue.settle_deadline(), None);
}

#[test]
fn test_queue_abort_without_turn_does_not_hold() {
    let mut queue = MessageQueue::new();
    let now = Instant::now();
    assert!(!queue.abort_turn(now + Duration::from_secs(5)));
    queue.push("m1".to_string());
    assert_eq!(queue.take_next(now).as_deref(), Some("m1"));
}

#[tokio::test(start_paused = true)]
async fn test_queue_settle_deadline_on_the_clock() {
    let mut queue = MessageQueue::new();
    queue.push("m1".to_string());
    queue.push("m2".to_string());
    assert_eq!(queue.take_next(Instant::now()).as_deref(), Some("m1"));
    queue.abort_turn(Instant::now() + Duration::from_secs(2));

    let deadline = queue.settle_deadline().unwrap();
    tokio::time::advance(Duration::from_millis(1999)).await;
    assert_eq!(queue.take_next(Instant::now()), None);

    tokio::time::sleep_until(deadline).await;
    assert_eq!(queue.take_next(Instant::now()).as_deref(), Some("m2"));
}

// ============================================================================
// Approval bridge
// ============================================================================

fn can_use_tool(tool_name: &str, input: serde_json::Value) -> InboundControlRequest {
    InboundControlRequest::from_value(serde_json::json!({
        "subtype": "can_use_tool",
        "tool_name": tool_name,
        "input": input,
        "permission_suggestions": [
            {"type": "addRules", "rules": [{"toolName": "Bash"}], "behavior": "allow", "destination": "session"}
        ]
    }))
}

fn reply_of(actions: &[BridgeAction]) -> &PermissionResult {
    actions
        .iter()
        .find_map(|a| match a {
            BridgeAction::Reply { result, .. } => Some(result),
            _ => None,
        })
        .expect("bridge produced no reply")
}

#[test]
fn test_bridge_tool_prompt_options() {
    let mut bridge = ApprovalBridge::new();
    let actions = bridge.on_request(
        RequestId::new("cli_1"),
        &can_use_tool("Bash", serde_json::json!({"command": "ls"})),
    );

    match actions.as_slice() {
        [BridgeAction::Raise(prompt)] => {
            assert_eq!(prompt.request_id.as_str(), "cli_1");
            assert_eq!(prompt.tool_name.as_str(), "Bash");
            assert_eq!(prompt.options, vec!["Allow", "Allow for this session", "Deny"]);
            assert!(prompt.has_other);
        }
        other => panic!("Expected a single raise, got {other:?}"),
    }
    assert_eq!(bridge.outstanding(), 1);
}

#[test]
fn test_bridge_tool_answers() {
    let input = serde_json::json!({"command": "ls"});

    let mut bridge = ApprovalBridge::new();
    bridge.on_request(RequestId::new("a"), &can_use_tool("Bash", input.clone()));
    let actions = bridge.answer(1, None, None).unwrap();
    assert!(matches!(actions[0], BridgeAction::Clear(ref id) if id.as_str() == "a"));
    assert_eq!(
        reply_of(&actions),
        &PermissionResult::Allow {
            updated_input: input.clone(),
            updated_permissions: None
        }
    );
    assert_eq!(bridge.outstanding(), 0);

    bridge.on_request(RequestId::new("b"), &can_use_tool("Bash", input.clone()));
    let actions = bridge.answer(2, None, None).unwrap();
    assert!(matches!(
        reply_of(&actions),
        PermissionResult::Allow { updated_permissions: Some(p), .. } if p.len() == 1
    ));

    bridge.on_request(RequestId::new("c"), &can_use_tool("Bash", input.clone()));
    let actions = bridge
        .answer(0, Some("use cargo instead".to_string()), Some(&RequestId::new("c")))
        .unwrap();
    assert_eq!(
        reply_of(&actions),
        &PermissionResult::Deny {
            message: "use cargo instead".to_string(),
            interrupt: false
        }
    );
}

#[test]
fn test_bridge_unknown_request_id_is_not_found() {
    let mut bridge = ApprovalBridge::new();
    bridge.on_request(RequestId::new("a"), &can_use_tool("Bash", serde_json::json!({})));
    let err = bridge
        .answer(1, None, Some(&RequestId::new("zzz")))
        .unwrap_err();
    assert!(matches!(err, runner_agent::RunnerError::ApprovalNotFound(_)));
    assert_eq!(bridge.outstanding(), 1);
}

#[test]
fn test_bridge_questions_asked_in_sequence() {
    let input = serde_json::json!({
        "questions": [
            {"question": "Which database?", "header": "DB",
             "options": [{"label": "Postgres"}, {"label": "SQLite"}], "multiSelect": false},
            {"question": "Which features?",
             "options": [{"label": "Auth"}, {"label": "Search"}, {"label": "Billing"}], "multiSelect": true}
        ]
    });
    let mut bridge = ApprovalBridge::new();
    let actions = bridge.on_request(RequestId::new("q"), &can_use_tool(QUESTION_TOOL, input));
    let [BridgeAction::Raise(first)] = actions.as_slice() else {
        panic!("Expected first question, got {actions:?}");
    };
    assert_eq!(first.request_id.as_str(), "q-q0");
    assert_eq!(first.options, vec!["Postgres", "SQLite"]);

    let actions = bridge.answer(2, None, Some(&first.request_id)).unwrap();
    let second = actions
        .iter()
        .find_map(|a| match a {
            BridgeAction::Raise(p) => Some(p.clone()),
            _ => None,
        })
        .unwrap();
    assert!(second.is_multi_select);
    assert_eq!(second.input["question"], "Which features?");

    let actions = bridge
        .answer(0, Some("1, 3".to_string()), Some(&second.request_id))
        .unwrap();
    match reply_of(&actions) {
        PermissionResult::Allow { updated_input, .. } => {
            assert_eq!(updated_input["answers"]["Which database?"], "SQLite");
            assert_eq!(updated_input["answers"]["Which features?"], "Auth, Billing");
        }
        other => panic!("Expected allow, got {other:?}"),
    }
    assert_eq!(bridge.outstanding(), 0);
}

#[test]
fn test_bridge_expired_question_is_denied_not_answered() {
    let input = serde_json::json!({
        "questions": [
            {"question": "Which database?", "options": [{"label": "Postgres"}, {"label": "SQLite"}]},
            {"question": "Which region?", "options": [{"label": "eu"}, {"label": "us"}]}
        ]
    });
    let mut bridge = ApprovalBridge::new();
    bridge.on_request(RequestId::new("q"), &can_use_tool(QUESTION_TOOL, input));

    let actions = bridge
        .expire(&RequestId::new("q-q0"), "Approval request expired")
        .unwrap();
    assert_eq!(actions[0], BridgeAction::Clear(RequestId::new("q-q0")));
    assert_eq!(
        actions[1],
        BridgeAction::Reply {
            control_id: RequestId::new("q"),
            result: PermissionResult::Deny {
                message: "Approval request expired".to_string(),
                interrupt: false,
            },
        }
    );
    assert_eq!(bridge.outstanding(), 0);
    assert!(bridge.expire(&RequestId::new("q-q0"), "again").is_err());
}

#[test]
fn test_bridge_deny_all_and_cancel() {
    let mut bridge = ApprovalBridge::new();
    bridge.on_request(RequestId::new("a"), &can_use_tool("Bash", serde_json::json!({})));
    bridge.on_request(RequestId::new("b"), &can_use_tool("Edit", serde_json::json!({})));

    let cleared = bridge.cancel(&RequestId::new("a"));
    assert_eq!(cleared, vec![BridgeAction::Clear(RequestId::new("a"))]);

    let actions = bridge.deny_all("Interrupted by the user");
    assert!(matches!(
        reply_of(&actions),
        PermissionResult::Deny { interrupt: true, .. }
    ));
    assert_eq!(bridge.outstanding(), 0);
}

// ============================================================================
// Menu detection
// ============================================================================

#[test]
fn test_detect_prompt_with_hint_lines_and_ansi() {
    let output = "\u{1b}[1mAllow edit to src/main.rs?\u{1b}[0m\r\n\
                  \u{1b}[36m❯\u{1b}[0m 1. Yes\r\n\
                  \x20 2. Yes, and don't ask again\r\n\
                  \x20 3) No, and tell Claude what to do differently\r\n\
                  \r\n\
                  Esc to cancel\r\n";
    let prompt = detect_prompt(output).unwrap();
    assert_eq!(prompt.question, "Allow edit to src/main.rs?");
    assert_eq!(prompt.options.len(), 3);
    assert_eq!(prompt.options[1], "Yes, and don't ask again");
}

#[test]
fn test_detect_prompt_rejects_non_menus() {
    assert_eq!(detect_prompt("1. only one option\n"), None);
    assert_eq!(detect_prompt("2. Yes\n3. No\n"), None, "must start at 1");
    assert_eq!(detect_prompt("Version 1.2 released\n"), None);
    assert_eq!(
        detect_prompt("1. Yes\n2. No\na\nb\nc\nd\n"),
        None,
        "menu must be near the end"
    );
}

// ============================================================================
// End to end
// ============================================================================

async fn collect_until(
    events: &mut mpsc::UnboundedReceiver<SessionEnvelope>,
    mut stop: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let deadline = Duration::from_secs(10);
    tokio::time::timeout(deadline, async {
        while let Some(envelope) = events.recv().await {
            let done = stop(&envelope.event);
            seen.push(envelope.event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for session events");
    seen
}

fn sh(script: &str) -> ProcessSpec {
    ProcessSpec::from_argv(&["/bin/sh".to_string(), "-c".to_string(), script.to_string()])
        .unwrap()
        .label("test")
}

#[cfg(unix)]
#[tokio::test]
async fn test_protocol_session_single_completion_flush() {
    let script = r#"
printf '%s\n' '{"type":"system","subtype":"init","session_id":"backend-1"}'
read line
printf '%s\n' '{"type":"stream_event","event":{"type":"message_start"}}'
printf '%s\n' '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"H"}}}'
printf '%s\n' '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}}'
printf '%s\n' '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi!"}}}'
printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"Hi!","num_turns":1}'
read line
"#;
    let protocol = ProtocolConfig {
        delta_mode: DeltaMode::Replace,
        ..ProtocolConfig::default()
    };
    let config = SessionConfig {
        flush_interval: Duration::from_secs(60),
        ..SessionConfig::default()
    };
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let session = ProtocolSession::spawn(
        SessionId::new("s1"),
        sh(script),
        protocol,
        config,
        events_tx,
    )
    .await
    .unwrap();

    assert!(session.wait_ready().await);
    assert_eq!(session.backend_session_id().as_deref(), Some("backend-1"));
    session.send_message("hello".to_string()).await.unwrap();

    let seen = collect_until(&mut events, |e| {
        matches!(e, SessionEvent::StatusChanged(SessionStatus::Idle))
    })
    .await;

    let outputs: Vec<&OutputFlush> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Output(flush) => Some(flush),
            _ => None,
        })
        .collect();
    assert_eq!(
        outputs,
        vec![&OutputFlush {
            content: "Hi!".to_string(),
            is_complete: true
        }]
    );

    let statuses: Vec<SessionStatus> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StatusChanged(status) => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![SessionStatus::Working, SessionStatus::Idle]);

    assert!(seen.contains(&SessionEvent::TurnStarted {
        text: "hello".to_string()
    }));
    assert!(seen.contains(&SessionEvent::TurnCompleted {
        is_error: false,
        result: Some("Hi!".to_string())
    }));

    session.close().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Offline);
    assert!(session.send_message("late".to_string()).await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_protocol_session_tool_approval_round_trip() {
    let script = r#"
printf '%s\n' '{"type":"system","subtype":"init","session_id":"backend-2"}'
read line
printf '%s\n' '{"type":"control_request","request_id":"cli_1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"}}}'
read reply
case "$reply" in
  *'"behavior":"allow"'*) text=allowed ;;
  *) text=denied ;;
esac
printf '{"type":"result","subtype":"success","is_error":false,"result":"%s"}\n' "$text"
read line
"#;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let session = ProtocolSession::spawn(
        SessionId::new("s2"),
        sh(script),
        ProtocolConfig::default(),
        SessionConfig::default(),
        events_tx,
    )
    .await
    .unwrap();

    session.send_message("list files".to_string()).await.unwrap();
    let seen = collect_until(&mut events, |e| {
        matches!(e, SessionEvent::ApprovalRequested(_))
    })
    .await;
    let Some(SessionEvent::ApprovalRequested(prompt)) = seen.last() else {
        panic!("Expected an approval prompt");
    };
    assert_eq!(prompt.tool_name.as_str(), "Bash");
    assert_eq!(session.status(), SessionStatus::Waiting);

    session
        .send_approval(1, None, Some(prompt.request_id.clone()))
        .await
        .unwrap();

    let seen = collect_until(&mut events, |e| {
        matches!(e, SessionEvent::TurnCompleted { .. })
    })
    .await;
    assert!(seen.contains(&SessionEvent::TurnCompleted {
        is_error: false,
        result: Some("allowed".to_string())
    }));

    session.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_protocol_session_interrupt_drops_late_output() {
    let script = r#"
printf '%s\n' '{"type":"system","subtype":"init","session_id":"backend-3"}'
read line
printf '%s\n' '{"type":"stream_event","event":{"type":"message_start"}}'
printf '%s\n' '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Work"}}}'
read line
id=$(printf '%s' "$line" | sed 's/.*"request_id":"\([^"]*\)".*/\1/')
printf '%s\n' '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ing late"}}}'
printf '{"type":"control_response","response":{"subtype":"success","request_id":"%s","response":{}}}\n' "$id"
printf '%s\n' '{"type":"result","subtype":"error_during_execution","is_error":true,"result":"late"}'
read line
sleep 0.2
printf '%s\n' '{"type":"stream_event","event":{"type":"message_start"}}'
printf '%s\n' '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"second"}}}'
printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"second"}'
read line
"#;
    let config = SessionConfig {
        flush_interval: Duration::from_secs(60),
        ..SessionConfig::default()
    };
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let session = ProtocolSession::spawn(
        SessionId::new("s3"),
        sh(script),
        ProtocolConfig::default(),
        config,
        events_tx,
    )
    .await
    .unwrap();

    assert!(session.wait_ready().await);
    session.send_message("m1".to_string()).await.unwrap();
    // Give the first delta time to reach the session
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.interrupt().await.unwrap();

    let seen = collect_until(&mut events, |e| {
        matches!(e, SessionEvent::StatusChanged(SessionStatus::Idle))
    })
    .await;
    let outputs: Vec<&OutputFlush> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Output(flush) => Some(flush),
            _ => None,
        })
        .collect();
    assert_eq!(
        outputs,
        vec![&OutputFlush {
            content: "Work".to_string(),
            is_complete: true
        }]
    );

    session.send_message("m2".to_string()).await.unwrap();
    let seen = collect_until(&mut events, |e| {
        matches!(e, SessionEvent::TurnCompleted { .. })
    })
    .await;
    let started = seen
        .iter()
        .position(|e| {
            *e == SessionEvent::TurnStarted {
                text: "m2".to_string(),
            }
        })
        .expect("second turn never started");
    let outputs: Vec<&OutputFlush> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Output(flush) => Some(flush),
            _ => None,
        })
        .collect();
    assert!(
        seen[..started]
            .iter()
            .all(|e| !matches!(e, SessionEvent::Output(_))),
        "output leaked before the second turn: {seen:?}"
    );
    assert_eq!(
        outputs,
        vec![&OutputFlush {
            content: "second".to_string(),
            is_complete: true
        }]
    );
    assert!(seen.contains(&SessionEvent::TurnCompleted {
        is_error: false,
        result: Some("second".to_string())
    }));
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, SessionEvent::TurnCompleted { is_error: true, .. })),
        "interrupted turn's result was reported"
    );

    session.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_terminal_session_turn_ends_on_quiet() {
    let config = SessionConfig {
        quiet_period: Duration::from_millis(200),
        flush_interval: Duration::from_secs(60),
        ..SessionConfig::default()
    };
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let session = TerminalSession::spawn(
        SessionId::new("t1"),
        ProcessSpec::from_argv(&["/bin/cat".to_string()]).unwrap(),
        config,
        events_tx,
    )
    .await
    .unwrap();

    assert!(session.wait_ready().await);
    session.send_message("hello".to_string()).await.unwrap();

    let seen = collect_until(&mut events, |e| {
        matches!(e, SessionEvent::TurnCompleted { .. })
    })
    .await;
    assert!(seen.contains(&SessionEvent::Output(OutputFlush {
        content: "hello\n".to_string(),
        is_complete: true
    })));
    assert_eq!(session.status(), SessionStatus::Idle);

    session.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_terminal_session_menu_becomes_approval() {
    let script = r#"
read line
printf 'Continue with %s?\n1. Yes\n2. No\n' "$line"
read answer
printf 'answered %s\n' "$answer"
read line
"#;
    let config = SessionConfig {
        quiet_period: Duration::from_millis(200),
        flush_interval: Duration::from_secs(60),
        ..SessionConfig::default()
    };
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let session = TerminalSession::spawn(SessionId::new("t2"), sh(script), config, events_tx)
        .await
        .unwrap();

    session.send_message("deploy".to_string()).await.unwrap();
    let seen = collect_until(&mut events, |e| {
        matches!(e, SessionEvent::ApprovalRequested(_))
    })
    .await;
    let Some(SessionEvent::ApprovalRequested(prompt)) = seen.last() else {
        panic!("Expected a menu prompt");
    };
    assert_eq!(prompt.options, vec!["Yes", "No"]);
    assert_eq!(prompt.input["question"], "Continue with deploy?");
    assert!(prompt.request_id.as_str().starts_with("t2-"));

    session.send_approval(1, None, None).await.unwrap();
    let seen = collect_until(&mut events, |e| {
        matches!(e, SessionEvent::TurnCompleted { .. })
    })
    .await;
    let last_output = seen
        .iter()
        .rev()
        .find_map(|e| match e {
            SessionEvent::Output(flush) => Some(flush.content.clone()),
            _ => None,
        })
        .unwrap();
    assert!(last_output.contains("answered 1"));

    assert!(session.send_approval(1, None, None).await.is_err());
    session.close().await.unwrap();
}
