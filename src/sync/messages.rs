//! Messages exchanged with the controller over the sync channel
//!
//! Every frame is one JSON object tagged by `type`, with camelCase fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::approval::{ApprovalAnswer, ApprovalPrompt, PendingApproval};
use crate::types::identifiers::{RequestId, RunnerId, SessionId};
use crate::types::session::{BackendKind, SessionStatus};

use super::capabilities::RunnerCapabilities;

/// Error code reported for decisions on unknown or expired approvals
pub const APPROVAL_EXPIRED: &str = "approval_expired";

/// One sync channel frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Runner identity, sent on every (re)connect
    #[serde(rename_all = "camelCase")]
    Register {
        /// Runner id
        runner_id: RunnerId,
        /// Runner version
        version: String,
        /// Advertised capabilities
        capabilities: RunnerCapabilities,
        /// Backend CLI types available on this host
        #[serde(default)]
        cli_types: Vec<String>,
    },

    /// Application-level liveness
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        /// Runner id
        runner_id: RunnerId,
        /// Send time
        timestamp: DateTime<Utc>,
        /// Number of live sessions
        active_sessions: usize,
    },

    /// A session needs a human decision
    #[serde(rename_all = "camelCase")]
    ApprovalRequest {
        /// Runner hosting the session
        runner_id: RunnerId,
        /// Owning session
        session_id: SessionId,
        /// The prompt
        #[serde(flatten)]
        prompt: ApprovalPrompt,
        /// How many times this prompt was resent
        #[serde(default)]
        resend_count: u32,
    },

    /// The controller's decision on an approval
    #[serde(rename_all = "camelCase")]
    ApprovalResponse {
        /// Approval being answered
        request_id: RequestId,
        /// Chosen option and free text
        #[serde(flatten)]
        answer: ApprovalAnswer,
    },

    /// The controller asks for all pending approvals to be resent
    #[serde(rename_all = "camelCase")]
    PermissionSyncRequest {
        /// Resend a single approval only
        #[serde(default)]
        request_id: Option<RequestId>,
        /// Deliver to this runner
        #[serde(default)]
        runner_id: Option<RunnerId>,
    },

    /// Throttled session output
    #[serde(rename_all = "camelCase")]
    Output {
        /// Session
        session_id: SessionId,
        /// Accumulated content
        content: String,
        /// Final flush of the turn
        is_complete: bool,
    },

    /// The controller asks for a session to be started or resumed
    #[serde(rename_all = "camelCase")]
    SessionStart {
        /// External session id
        session_id: SessionId,
        /// Backend CLI type
        cli_type: String,
        /// Backend flavour
        #[serde(default)]
        plugin: BackendKind,
        /// Working directory
        folder_path: String,
        /// Backend id the controller would like to resume
        #[serde(default)]
        resume_session_id: Option<String>,
        /// Chat channel or thread the session reports to
        #[serde(default)]
        channel_id: Option<String>,
        /// Model override
        #[serde(default)]
        model: Option<String>,
        /// First message to send once ready
        #[serde(default)]
        initial_message: Option<String>,
    },

    /// A session ended, or the controller asks for it to end
    #[serde(rename_all = "camelCase")]
    SessionEnd {
        /// Session
        session_id: SessionId,
    },

    /// A session is ready for messages
    #[serde(rename_all = "camelCase")]
    SessionReady {
        /// Session
        session_id: SessionId,
        /// Backend-native id, once known
        #[serde(default)]
        backend_session_id: Option<String>,
    },

    /// Session status transition
    #[serde(rename_all = "camelCase")]
    Status {
        /// Session
        session_id: SessionId,
        /// New status
        status: SessionStatus,
    },

    /// Usage or cost metadata
    #[serde(rename_all = "camelCase")]
    Metadata {
        /// Session
        session_id: SessionId,
        /// Metadata payload
        metadata: serde_json::Value,
    },

    /// Error report
    #[serde(rename_all = "camelCase")]
    Error {
        /// Session concerned, if any
        #[serde(default)]
        session_id: Option<SessionId>,
        /// Approval concerned, if any
        #[serde(default)]
        request_id: Option<RequestId>,
        /// Machine-readable code
        #[serde(default)]
        code: Option<String>,
        /// Human-readable message
        message: String,
    },

    /// Controller text for a session
    #[serde(rename_all = "camelCase")]
    SessionInput {
        /// Session
        session_id: SessionId,
        /// Message text
        text: String,
    },

    /// The controller asks to abort the in-flight turn
    #[serde(rename_all = "camelCase")]
    Interrupt {
        /// Session
        session_id: SessionId,
    },
}

impl SyncMessage {
    /// Approval request frame for a tracked approval
    #[must_use]
    pub fn approval_request(runner_id: RunnerId, approval: &PendingApproval) -> Self {
        Self::ApprovalRequest {
            runner_id,
            session_id: approval.session_id.clone(),
            prompt: approval.prompt(),
            resend_count: approval.resend_count,
        }
    }

    /// Report that a decision arrived for an approval that no longer exists
    #[must_use]
    pub fn approval_expired(request_id: RequestId, session_id: Option<SessionId>) -> Self {
        Self::Error {
            session_id,
            message: format!("Approval {request_id} has expired"),
            request_id: Some(request_id),
            code: Some(APPROVAL_EXPIRED.to_string()),
        }
    }

    /// Error frame about a session
    #[must_use]
    pub fn session_error(session_id: SessionId, message: impl Into<String>) -> Self {
        Self::Error {
            session_id: Some(session_id),
            request_id: None,
            code: None,
            message: message.into(),
        }
    }

    /// The `type` tag of this frame
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Heartbeat { .. } => "heartbeat",
            Self::ApprovalRequest { .. } => "approval_request",
            Self::ApprovalResponse { .. } => "approval_response",
            Self::PermissionSyncRequest { .. } => "permission_sync_request",
            Self::Output { .. } => "output",
            Self::SessionStart { .. } => "session_start",
            Self::SessionEnd { .. } => "session_end",
            Self::SessionReady { .. } => "session_ready",
            Self::Status { .. } => "status",
            Self::Metadata { .. } => "metadata",
            Self::Error { .. } => "error",
            Self::SessionInput { .. } => "session_input",
            Self::Interrupt { .. } => "interrupt",
        }
    }
}
