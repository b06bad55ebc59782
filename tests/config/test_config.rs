//! Tests for runner configuration and backend launch helpers

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use runner_agent::config::{ENV_PREFIX, PING_TIMEOUT_FACTOR};
use runner_agent::launcher::{
    ArgvBuilder, ClaudeArgvBuilder, LaunchOptions, LaunchRequest, SessionLauncher,
    TerminalArgvBuilder,
};
use runner_agent::protocol::{DeltaMode, ProtocolConfig};
use runner_agent::session::SessionConfig;
use runner_agent::types::{BackendKind, PermissionMode, SessionId};
use runner_agent::{RunnerConfig, RunnerError};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), (*v).to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

// ============================================================================
// RunnerConfig
// ============================================================================

#[test]
fn test_from_lookup_overrides_defaults() {
    let config = RunnerConfig::from_lookup(lookup(&[
        ("ID", "build-box"),
        ("CONTROLLER_URL", "wss://controller.example/runner"),
        ("TOKEN", "s3cret"),
        ("DATA_DIR", "/var/lib/runner"),
        ("PING_MS", "2000"),
        ("PING_TIMEOUT_MS", "9000"),
        ("APPROVAL_TTL_SECS", "120"),
        ("FLUSH_MS", "250"),
        ("TOKEN_UNUSED", "ignored"),
    ]))
    .unwrap();

    assert_eq!(config.runner_id.as_str(), "build-box");
    assert_eq!(config.controller_url, "wss://controller.example/runner");
    assert_eq!(config.token.as_deref(), Some("s3cret"));
    assert_eq!(config.data_dir, PathBuf::from("/var/lib/runner"));
    assert_eq!(config.ping_interval, Duration::from_secs(2));
    assert_eq!(config.ping_timeout, Duration::from_secs(9));
    assert_eq!(config.approval_ttl, Duration::from_secs(120));
    assert_eq!(config.session_config().flush_interval, Duration::from_millis(250));
    assert_eq!(config.lock_dir(), Path::new("/var/lib/runner/reissue-locks"));
}

#[test]
fn test_blank_variables_keep_defaults() {
    let config = RunnerConfig::from_lookup(lookup(&[("TOKEN", "  "), ("PING_MS", "")])).unwrap();
    assert_eq!(config.token, None);
    assert_eq!(config.ping_interval, RunnerConfig::default().ping_interval);
}

#[test]
fn test_unparsable_number_is_rejected() {
    let err = RunnerConfig::from_lookup(lookup(&[("HEARTBEAT_MS", "soon")])).unwrap_err();
    assert!(matches!(err, RunnerError::InvalidConfig(ref m) if m.contains("HEARTBEAT_MS")));
}

#[test]
fn test_delta_mode_reaches_protocol_sessions() {
    assert_eq!(
        RunnerConfig::default().protocol_config().delta_mode,
        DeltaMode::Append
    );

    let config = RunnerConfig::from_lookup(lookup(&[("DELTA_MODE", "Replace")])).unwrap();
    assert_eq!(config.delta_mode, DeltaMode::Replace);
    assert_eq!(config.protocol_config().delta_mode, DeltaMode::Replace);

    let config = RunnerConfig::builder()
        .delta_mode(DeltaMode::Replace)
        .build()
        .unwrap();
    assert_eq!(config.protocol_config().delta_mode, DeltaMode::Replace);

    let err = RunnerConfig::from_lookup(lookup(&[("DELTA_MODE", "snapshot")])).unwrap_err();
    assert!(matches!(err, RunnerError::InvalidConfig(ref m) if m.contains("DELTA_MODE")));
}

#[test]
fn test_short_ping_timeout_is_raised() {
    let config = RunnerConfig::builder()
        .ping_interval(Duration::from_secs(10))
        .ping_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    assert_eq!(config.ping_timeout, Duration::from_secs(10) * PING_TIMEOUT_FACTOR);
}

#[test]
fn test_invalid_values_are_rejected() {
    let err = RunnerConfig::builder()
        .controller_url("http://controller.example")
        .build()
        .unwrap_err();
    assert!(matches!(err, RunnerError::InvalidConfig(_)));

    let err = RunnerConfig::builder()
        .heartbeat_interval(Duration::ZERO)
        .build()
        .unwrap_err();
    assert!(matches!(err, RunnerError::InvalidConfig(ref m) if m.contains("heartbeat")));
}

#[test]
fn test_debug_redacts_token() {
    let config = RunnerConfig::builder().token("s3cret").build().unwrap();
    let rendered = format!("{config:?}");
    assert!(!rendered.contains("s3cret"));
    assert!(rendered.contains("<redacted>"));
}

#[test]
fn test_derived_component_settings() {
    let config = RunnerConfig::builder()
        .control_timeout(Duration::from_secs(3))
        .build()
        .unwrap();
    assert_eq!(config.protocol_config().control_timeout, Duration::from_secs(3));

    let sync = config.sync_config(vec!["claude".to_string()]);
    assert_eq!(sync.url, config.controller_url);
    assert_eq!(sync.runner_id, config.runner_id);
    assert_eq!(sync.cli_types, vec!["claude"]);
}

// ============================================================================
// Launcher
// ============================================================================

#[test]
fn test_protocol_argv() {
    let argv = ClaudeArgvBuilder.build(
        Path::new("/usr/bin/claude"),
        &LaunchOptions {
            resume_id: Some("abc".to_string()),
            model: Some("opus".to_string()),
            permission_mode: Some(PermissionMode::AcceptEdits),
            extra_args: vec!["--debug".to_string()],
        },
    );

    assert_eq!(argv[0], "/usr/bin/claude");
    for pair in [
        ["--output-format", "stream-json"],
        ["--input-format", "stream-json"],
        ["--resume", "abc"],
        ["--model", "opus"],
        ["--permission-mode", "acceptEdits"],
    ] {
        assert!(
            argv.windows(2).any(|w| w == pair),
            "missing {pair:?} in {argv:?}"
        );
    }
    assert_eq!(argv.last().map(String::as_str), Some("--debug"));
}

#[test]
fn test_protocol_argv_without_options() {
    let argv = ClaudeArgvBuilder.build(Path::new("claude"), &LaunchOptions::default());
    assert!(!argv.iter().any(|a| a == "--resume" || a == "--model"));
}

#[test]
fn test_terminal_argv() {
    let argv = TerminalArgvBuilder.build(
        Path::new("/usr/bin/aider"),
        &LaunchOptions {
            resume_id: Some("ignored".to_string()),
            extra_args: vec!["--yes".to_string()],
            ..LaunchOptions::default()
        },
    );
    assert_eq!(argv, vec!["/usr/bin/aider", "--yes"]);
}

#[tokio::test]
async fn test_launch_missing_cli() {
    let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
    let launcher = SessionLauncher::new(ProtocolConfig::default(), SessionConfig::default(), events)
        .with_locator(|_| None);

    let err = launcher
        .launch(LaunchRequest {
            session_id: SessionId::new("s1"),
            cli_type: "claude".to_string(),
            plugin: BackendKind::Protocol,
            folder_path: PathBuf::from("/tmp"),
            options: LaunchOptions::default(),
        })
        .await
        .err()
        .expect("launch should fail");
    assert!(matches!(err, RunnerError::CliNotFound(ref m) if m.contains("claude")));
}
