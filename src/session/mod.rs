//! Uniform session abstraction over heterogeneous backends
//!
//! Every backend runs as an actor task that owns its subprocess. Callers
//! talk to it through a [`SessionHandle`] (commands in, state out) and
//! receive [`SessionEnvelope`]s on a shared event channel. The registry only
//! ever holds `Arc<dyn AgentSession>`.
//!
//! Guarantees shared by all backends:
//! - one turn in flight; queued messages dispatch strictly in order
//! - output is throttled and the completion flush is marked complete
//! - `interrupt` lands in `idle` and keeps queued messages queued

mod approvals;
mod commands;
mod protocol_session;
mod queue;
mod terminal_session;
mod throttle;

use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{Result, RunnerError};
use crate::types::identifiers::{RequestId, SessionId};
use crate::types::session::{BackendKind, SessionEnvelope, SessionEvent, SessionStatus};

pub use approvals::{ApprovalBridge, BridgeAction, QUESTION_TOOL, TOOL_OPTIONS};
pub use protocol_session::ProtocolSession;
pub use queue::MessageQueue;
pub use terminal_session::{DetectedPrompt, TERMINAL_PROMPT_TOOL, TerminalSession, detect_prompt};
pub use throttle::{OutputThrottler, ThrottleMode};

use commands::SessionCommand;

/// The contract every backend session fulfils
#[async_trait::async_trait]
pub trait AgentSession: Send + Sync {
    /// External session id
    fn session_id(&self) -> &SessionId;

    /// Backend flavour
    fn kind(&self) -> BackendKind;

    /// Current status
    fn status(&self) -> SessionStatus;

    /// Whether the backend has signalled readiness
    fn is_ready(&self) -> bool;

    /// Backend-native session id, once known
    fn backend_session_id(&self) -> Option<String>;

    /// Queue a message; it is sent when every earlier turn has finished
    ///
    /// # Errors
    /// Returns `SessionClosed` if the session has shut down
    async fn send_message(&self, text: String) -> Result<()>;

    /// Answer an approval prompt
    ///
    /// # Errors
    /// Returns `ApprovalNotFound` if no matching prompt is outstanding
    async fn send_approval(
        &self,
        option_number: usize,
        message: Option<String>,
        request_id: Option<RequestId>,
    ) -> Result<()>;

    /// Deny a prompt that outlived its TTL without treating it as an answer
    ///
    /// Nothing is typed into terminal backends; the prompt is only withdrawn.
    ///
    /// # Errors
    /// Returns `ApprovalNotFound` if no matching prompt is outstanding
    async fn expire_approval(&self, request_id: RequestId, reason: String) -> Result<()>;

    /// Abort the in-flight turn
    ///
    /// # Errors
    /// Returns `SessionClosed` if the session has shut down
    async fn interrupt(&self) -> Result<()>;

    /// Shut the session down; idempotent
    ///
    /// # Errors
    /// Returns error if the backend fails to stop cleanly
    async fn close(&self) -> Result<()>;

    /// Wait until the backend is ready or the session goes offline
    async fn wait_ready(&self) -> bool;
}

/// Timing knobs shared by all session backends
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval at which buffered output is flushed
    pub flush_interval: Duration,
    /// How long the queue stays held after an interrupt
    pub interrupt_settle: Duration,
    /// Terminal turns end after this much output silence
    pub quiet_period: Duration,
    /// Bytes written to a terminal backend to interrupt it
    pub interrupt_sequence: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(500),
            interrupt_settle: Duration::from_secs(2),
            quiet_period: Duration::from_millis(1500),
            interrupt_sequence: "\u{3}".to_string(),
        }
    }
}

/// Observable session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Status
    pub status: SessionStatus,
    /// Readiness
    pub is_ready: bool,
    /// Backend-native session id
    pub backend_session_id: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            is_ready: false,
            backend_session_id: None,
        }
    }
}

/// Caller side of a session actor
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    kind: BackendKind,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: SessionId,
        kind: BackendKind,
        command_tx: mpsc::UnboundedSender<SessionCommand>,
        state: watch::Receiver<SessionState>,
    ) -> Self {
        Self {
            session_id,
            kind,
            command_tx,
            state,
        }
    }

    /// External session id
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Backend flavour
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Snapshot of the current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> SessionCommand,
    ) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build(response_tx))
            .map_err(|_| RunnerError::session_closed(self.session_id.as_str()))?;
        response_rx
            .await
            .map_err(|_| RunnerError::session_closed(self.session_id.as_str()))?
    }

    /// Queue a message
    ///
    /// # Errors
    /// Returns `SessionClosed` if the actor has stopped
    pub async fn send_message(&self, text: String) -> Result<()> {
        self.request(|response_tx| SessionCommand::SendMessage { text, response_tx })
            .await
    }

    /// Answer an approval prompt
    ///
    /// # Errors
    /// Returns `ApprovalNotFound` or `SessionClosed`
    pub async fn send_approval(
        &self,
        option_number: usize,
        message: Option<String>,
        request_id: Option<RequestId>,
    ) -> Result<()> {
        self.request(|response_tx| SessionCommand::SendApproval {
            option_number,
            message,
            request_id,
            response_tx,
        })
        .await
    }

    /// Withdraw and deny an expired prompt
    ///
    /// # Errors
    /// Returns `ApprovalNotFound` or `SessionClosed`
    pub async fn expire_approval(&self, request_id: RequestId, reason: String) -> Result<()> {
        self.request(|response_tx| SessionCommand::ExpireApproval {
            request_id,
            reason,
            response_tx,
        })
        .await
    }

    /// Abort the in-flight turn
    ///
    /// # Errors
    /// Returns `SessionClosed` if the actor has stopped
    pub async fn interrupt(&self) -> Result<()> {
        self.request(|response_tx| SessionCommand::Interrupt { response_tx })
            .await
    }

    /// Shut the session down; succeeds if it is already gone
    ///
    /// # Errors
    /// Returns error if the backend fails to stop cleanly
    pub async fn close(&self) -> Result<()> {
        match self
            .request(|response_tx| SessionCommand::Close { response_tx })
            .await
        {
            Err(RunnerError::SessionClosed(_)) => Ok(()),
            other => other,
        }
    }

    /// Wait until ready; `false` if the session went offline first
    pub async fn wait_ready(&self) -> bool {
        let mut state = self.state.clone();
        state
            .wait_for(|s| s.is_ready || s.status == SessionStatus::Offline)
            .await
            .map(|s| s.is_ready)
            .unwrap_or(false)
    }
}

/// Actor side: publishes state and events for one session
pub(crate) struct SessionReporter {
    session_id: SessionId,
    state_tx: watch::Sender<SessionState>,
    event_tx: mpsc::UnboundedSender<SessionEnvelope>,
}

impl SessionReporter {
    pub(crate) fn new(
        session_id: SessionId,
        event_tx: mpsc::UnboundedSender<SessionEnvelope>,
    ) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::default());
        (
            Self {
                session_id,
                state_tx,
                event_tx,
            },
            state_rx,
        )
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let envelope = SessionEnvelope {
            session_id: self.session_id.clone(),
            event,
        };
        if self.event_tx.send(envelope).is_err() {
            log::debug!("[{}] event receiver gone", self.session_id);
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.state_tx.borrow().status
    }

    /// Move to `status`, emitting a change event only on transitions
    pub(crate) fn set_status(&self, status: SessionStatus) {
        let changed = self.state_tx.send_if_modified(|state| {
            if state.status == status || state.status == SessionStatus::Offline {
                return false;
            }
            state.status = status;
            true
        });
        if changed {
            log::debug!("[{}] status -> {status:?}", self.session_id);
            self.emit(SessionEvent::StatusChanged(status));
        }
    }

    pub(crate) fn set_ready(&self, backend_session_id: Option<String>) {
        self.state_tx.send_modify(|state| {
            state.is_ready = true;
            if state.backend_session_id.is_none() {
                state.backend_session_id.clone_from(&backend_session_id);
            }
        });
        self.emit(SessionEvent::Ready { backend_session_id });
    }

    pub(crate) fn set_backend_session_id(&self, id: String) {
        self.state_tx
            .send_modify(|state| state.backend_session_id = Some(id.clone()));
        self.emit(SessionEvent::BackendSessionId(id));
    }
}

/// Implement [`AgentSession`] for a backend wrapper that exposes `handle`
macro_rules! delegate_agent_session {
    ($backend:ty) => {
        #[async_trait::async_trait]
        impl $crate::session::AgentSession for $backend {
            fn session_id(&self) -> &$crate::types::identifiers::SessionId {
                self.handle.session_id()
            }

            fn kind(&self) -> $crate::types::session::BackendKind {
                self.handle.kind()
            }

            fn status(&self) -> $crate::types::session::SessionStatus {
                self.handle.state().status
            }

            fn is_ready(&self) -> bool {
                self.handle.state().is_ready
            }

            fn backend_session_id(&self) -> Option<String> {
                self.handle.state().backend_session_id
            }

            async fn send_message(&self, text: String) -> $crate::error::Result<()> {
                self.handle.send_message(text).await
            }

            async fn send_approval(
                &self,
                option_number: usize,
                message: Option<String>,
                request_id: Option<$crate::types::identifiers::RequestId>,
            ) -> $crate::error::Result<()> {
                self.handle
                    .send_approval(option_number, message, request_id)
                    .await
            }

            async fn expire_approval(
                &self,
                request_id: $crate::types::identifiers::RequestId,
                reason: String,
            ) -> $crate::error::Result<()> {
                self.handle.expire_approval(request_id, reason).await
            }

            async fn interrupt(&self) -> $crate::error::Result<()> {
                self.handle.interrupt().await
            }

            async fn close(&self) -> $crate::error::Result<()> {
                self.handle.close().await
            }

            async fn wait_ready(&self) -> bool {
                self.handle.wait_ready().await
            }
        }
    };
}

pub(crate) use delegate_agent_session;
