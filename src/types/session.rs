//! Session state, durable records and session events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::approval::ApprovalPrompt;
use super::identifiers::{RequestId, RunnerId, SessionId};

/// Backend flavour behind a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Line-delimited JSON control protocol over stdio
    #[default]
    Protocol,
    /// Plain interactive process with raw text output
    Terminal,
}

/// Observable session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No turn in flight
    Idle,
    /// A turn is in flight
    Working,
    /// At least one approval is outstanding
    Waiting,
    /// Backend is gone; terminal state
    Offline,
}

/// Durable record used to resume a logical session after a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Backend-native session id, authoritative for resume
    #[serde(default)]
    pub backend_session_id: Option<String>,
    /// Backend CLI type (e.g. `claude`)
    pub cli_type: String,
    /// Backend flavour
    #[serde(default)]
    pub plugin: BackendKind,
    /// Working directory of the backend
    pub folder_path: String,
    /// Runner that hosts the session
    #[serde(default)]
    pub runner_id: Option<RunnerId>,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Last activity on the session
    pub last_activity_at: DateTime<Utc>,
}

/// One throttled output emission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFlush {
    /// Accumulated content of the current message or turn
    pub content: String,
    /// Whether this is the final flush of the turn
    pub is_complete: bool,
}

/// Typed events a session reports to the runner loop
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Backend is ready to accept messages
    Ready {
        /// Backend-native session id, if already known
        backend_session_id: Option<String>,
    },
    /// Backend-native session id became known
    BackendSessionId(String),
    /// Status transition
    StatusChanged(SessionStatus),
    /// A queued message was dispatched to the backend
    TurnStarted {
        /// Message text
        text: String,
    },
    /// Throttled output
    Output(OutputFlush),
    /// The agent invoked a tool
    ToolUse {
        /// Tool use id
        id: String,
        /// Tool name
        name: String,
        /// Parsed tool input
        input: serde_json::Value,
    },
    /// The backend needs a human decision
    ApprovalRequested(ApprovalPrompt),
    /// A previously raised prompt no longer needs an answer
    ApprovalCleared {
        /// Prompt id
        request_id: RequestId,
    },
    /// The turn's terminal signal arrived
    TurnCompleted {
        /// Whether the turn ended in error
        is_error: bool,
        /// Final result text
        result: Option<String>,
    },
    /// Token usage or cost metadata
    Metadata(serde_json::Value),
    /// Non-fatal error worth surfacing to the controller
    Error(String),
    /// Backend process exited
    Exited {
        /// Exit code, when the process exited normally
        code: Option<i32>,
    },
}

/// Session event tagged with its session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEnvelope {
    /// Session that produced the event
    pub session_id: SessionId,
    /// The event
    pub event: SessionEvent,
}
