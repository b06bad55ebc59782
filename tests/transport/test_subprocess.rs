//! Unit tests for `SubprocessTransport`
//!
//! Tests spawning, framing and shutdown against small shell commands

use std::time::Duration;

use runner_agent::Transport;
use tokio_test::{assert_err, assert_ok};
use runner_agent::transport::{OutputFraming, ProcessSpec, ReadEvent, SubprocessTransport};

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

async fn drain(mut rx: tokio::sync::mpsc::UnboundedReceiver<ReadEvent>) -> Vec<ReadEvent> {
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = rx.recv().await {
            let done = matches!(event, ReadEvent::Exited { .. });
            events.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("reader did not finish");
    events
}

#[test]
fn test_process_spec_from_argv() {
    assert!(ProcessSpec::from_argv(&[]).is_none());

    let spec = ProcessSpec::from_argv(&argv(&["claude", "--print", "--verbose"]))
        .unwrap()
        .cwd("/work")
        .env("RUST_LOG", "debug")
        .label("s1");
    assert_eq!(spec.program.to_str(), Some("claude"));
    assert_eq!(spec.args, vec!["--print", "--verbose"]);
    assert_eq!(spec.cwd.as_deref(), Some(std::path::Path::new("/work")));
    assert_eq!(spec.env.get("RUST_LOG").map(String::as_str), Some("debug"));
    assert_eq!(spec.label, "s1");
}

#[test]
fn test_default_framing_is_lines() {
    assert!(matches!(
        OutputFraming::default(),
        OutputFraming::Lines { .. }
    ));
}

#[tokio::test]
async fn test_missing_program_fails_to_connect() {
    let spec = ProcessSpec::from_argv(&argv(&["/nonexistent/backend-cli"])).unwrap();
    let mut transport = SubprocessTransport::new(spec);
    assert_err!(transport.connect().await);
    assert!(!transport.is_ready());
    assert_err!(transport.write("x\n").await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_line_framing_and_exit_code() {
    let spec = ProcessSpec::from_argv(&argv(&[
        "/bin/sh",
        "-c",
        "printf 'one\\ntwo\\n'; echo oops >&2; exit 3",
    ]))
    .unwrap();
    let mut transport = SubprocessTransport::new(spec);
    transport.connect().await.unwrap();
    let events = drain(transport.read_output(OutputFraming::default())).await;

    assert_eq!(
        events,
        vec![
            ReadEvent::Line("one".to_string()),
            ReadEvent::Line("two".to_string()),
            ReadEvent::Exited { code: Some(3) },
        ]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_overlong_lines_are_dropped() {
    let spec = ProcessSpec::from_argv(&argv(&[
        "/bin/sh",
        "-c",
        "printf 'aaaaaaaaaaaaaaaaaaaa\\nok\\n'",
    ]))
    .unwrap();
    let mut transport = SubprocessTransport::new(spec);
    transport.connect().await.unwrap();
    let events = drain(transport.read_output(OutputFraming::Lines { max_length: 8 })).await;

    assert_eq!(events[0], ReadEvent::Line("ok".to_string()));
    assert!(matches!(events[1], ReadEvent::Exited { code: Some(0) }));
}

#[cfg(unix)]
#[tokio::test]
async fn test_chunk_framing_echoes_writes() {
    let spec = ProcessSpec::from_argv(&argv(&["/bin/cat"])).unwrap();
    let mut transport = SubprocessTransport::new(spec);
    transport.connect().await.unwrap();
    let rx = transport.read_output(OutputFraming::Chunks);

    transport.write_line("hello").await.unwrap();
    transport.end_input().await.unwrap();

    let events = drain(rx).await;
    let text: String = events
        .iter()
        .filter_map(|e| match e {
            ReadEvent::Chunk(chunk) => Some(chunk.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "hello\n");
    assert_eq!(events.last(), Some(&ReadEvent::Exited { code: Some(0) }));
}

#[cfg(unix)]
#[tokio::test]
async fn test_chunk_framing_keeps_split_characters() {
    // `❯` is E2 9D AF; the first byte arrives in a read of its own
    let spec = ProcessSpec::from_argv(&argv(&[
        "/bin/sh",
        "-c",
        "printf '\\342'; sleep 0.3; printf '\\235\\257 1. Yes\\n'; printf 'a\\377b'",
    ]))
    .unwrap();
    let mut transport = SubprocessTransport::new(spec);
    transport.connect().await.unwrap();
    let events = drain(transport.read_output(OutputFraming::Chunks)).await;

    let chunks: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ReadEvent::Chunk(chunk) => Some(chunk.as_str()),
            _ => None,
        })
        .collect();
    assert!(chunks.iter().all(|c| !c.is_empty()));
    assert_eq!(chunks.concat(), "\u{276f} 1. Yes\na\u{fffd}b");
}

#[cfg(unix)]
#[tokio::test]
async fn test_close_kills_process_ignoring_stdin() {
    let spec = ProcessSpec::from_argv(&argv(&["/bin/sh", "-c", "exec sleep 30"])).unwrap();
    let mut transport =
        SubprocessTransport::new(spec).with_close_grace(Duration::from_millis(100));
    transport.connect().await.unwrap();
    assert!(transport.pid().is_some());
    let rx = transport.read_output(OutputFraming::default());

    let closed = tokio::time::timeout(Duration::from_secs(5), transport.close())
        .await
        .expect("close hung");
    assert_ok!(closed);
    assert!(!transport.is_ready());

    let events = drain(rx).await;
    assert!(matches!(events.last(), Some(ReadEvent::Exited { .. })));
}

#[cfg(unix)]
#[tokio::test]
async fn test_dangerous_env_is_not_passed() {
    let spec = ProcessSpec::from_argv(&argv(&[
        "/bin/sh",
        "-c",
        "echo \"preload=${LD_PRELOAD:-unset} marker=${RUNNER_MARKER:-unset}\"",
    ]))
    .unwrap()
    .env("LD_PRELOAD", "/tmp/evil.so")
    .env("RUNNER_MARKER", "yes");
    let mut transport = SubprocessTransport::new(spec);
    transport.connect().await.unwrap();
    let events = drain(transport.read_output(OutputFraming::default())).await;

    let expected_preload = std::env::var("LD_PRELOAD").unwrap_or_else(|_| "unset".to_string());
    assert_eq!(
        events[0],
        ReadEvent::Line(format!("preload={expected_preload} marker=yes"))
    );
}
