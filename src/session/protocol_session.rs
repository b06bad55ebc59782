//! Session actor for protocol backends
//!
//! The actor task owns the [`ProtocolClient`] and handles commands and
//! protocol events on one `select!` loop, so session state needs no locks.

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Result, RunnerError};
use crate::protocol::{
    ControlRequest, InboundControlRequest, InboundReply, ProtocolClient, ProtocolConfig,
    ProtocolEvent,
};
use crate::transport::ProcessSpec;
use crate::types::identifiers::SessionId;
use crate::types::session::{BackendKind, SessionEnvelope, SessionEvent, SessionStatus};

use super::approvals::{ApprovalBridge, BridgeAction};
use super::commands::SessionCommand;
use super::queue::MessageQueue;
use super::throttle::{OutputThrottler, ThrottleMode};
use super::{SessionConfig, SessionHandle, SessionReporter};

/// Session backed by a control-protocol subprocess
#[derive(Debug, Clone)]
pub struct ProtocolSession {
    handle: SessionHandle,
}

impl ProtocolSession {
    /// Spawn the backend and its session actor
    ///
    /// # Arguments
    /// * `session_id` - External session id
    /// * `spec` - How to launch the backend
    /// * `protocol` - Protocol client settings
    /// * `config` - Session timing settings
    /// * `event_tx` - Where session events are delivered
    ///
    /// # Errors
    /// Returns error if the backend cannot be spawned
    pub async fn spawn(
        session_id: SessionId,
        spec: ProcessSpec,
        protocol: ProtocolConfig,
        config: SessionConfig,
        event_tx: mpsc::UnboundedSender<SessionEnvelope>,
    ) -> Result<Self> {
        let (client, events) = ProtocolClient::start(spec, protocol).await?;
        let (reporter, state_rx) = SessionReporter::new(session_id.clone(), event_tx);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let actor = ProtocolActor {
            client,
            reporter,
            config,
            queue: MessageQueue::new(),
            throttler: OutputThrottler::new(ThrottleMode::Replace),
            bridge: ApprovalBridge::new(),
            turn_text: TurnText::default(),
            flush_at: None,
            swallow_result: false,
        };
        tokio::spawn(actor.run(command_rx, events));

        Ok(Self {
            handle: SessionHandle::new(session_id, BackendKind::Protocol, command_tx, state_rx),
        })
    }

    /// Caller-side handle
    #[must_use]
    pub const fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

super::delegate_agent_session!(ProtocolSession);

/// Text of the current turn across its assistant messages
#[derive(Debug, Default)]
struct TurnText {
    committed: String,
    current: String,
}

impl TurnText {
    fn commit(&mut self) {
        if self.current.is_empty() {
            return;
        }
        if !self.committed.is_empty() {
            self.committed.push_str("\n\n");
        }
        self.committed.push_str(&self.current);
        self.current.clear();
    }

    fn compose(&self) -> String {
        match (self.committed.is_empty(), self.current.is_empty()) {
            (true, _) => self.current.clone(),
            (false, true) => self.committed.clone(),
            (false, false) => format!("{}\n\n{}", self.committed, self.current),
        }
    }

    fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.current.is_empty()
    }

    fn clear(&mut self) {
        self.committed.clear();
        self.current.clear();
    }
}

struct ProtocolActor {
    client: ProtocolClient,
    reporter: SessionReporter,
    config: SessionConfig,
    queue: MessageQueue,
    throttler: OutputThrottler,
    bridge: ApprovalBridge,
    turn_text: TurnText,
    flush_at: Option<Instant>,
    swallow_result: bool,
}

impl ProtocolActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<ProtocolEvent>,
    ) {
        loop {
            let flush_at = self.flush_at;
            let settle_at = self.queue.settle_deadline();

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown().await;
                        break;
                    };
                    if self.handle_command(command).await {
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        self.go_offline(None);
                        break;
                    };
                    if self.handle_event(event).await {
                        break;
                    }
                }
                () = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    self.flush_at = None;
                    if let Some(flush) = self.throttler.flush() {
                        self.reporter.emit(SessionEvent::Output(flush));
                    }
                }
                () = tokio::time::sleep_until(settle_at.unwrap_or_else(Instant::now)), if settle_at.is_some() => {
                    log::debug!("[{}] interrupt settled without a result", self.label());
                    self.queue.end_settle();
                    self.swallow_result = false;
                    self.drain().await;
                }
            }
        }
    }

    fn label(&self) -> &str {
        self.reporter.session_id.as_str()
    }

    /// Returns `true` when the actor should stop
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::SendMessage { text, response_tx } => {
                if self.reporter.status() == SessionStatus::Offline {
                    let _ = response_tx.send(Err(RunnerError::session_closed(self.label())));
                    return false;
                }
                let waiting = self.queue.push(text);
                log::debug!("[{}] queued message ({waiting} waiting)", self.label());
                let _ = response_tx.send(Ok(()));
                self.drain().await;
                false
            }
            SessionCommand::SendApproval {
                option_number,
                message,
                request_id,
                response_tx,
            } => {
                let result = match self
                    .bridge
                    .answer(option_number, message, request_id.as_ref())
                {
                    Ok(actions) => {
                        self.apply(actions).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = response_tx.send(result);
                false
            }
            SessionCommand::ExpireApproval {
                request_id,
                reason,
                response_tx,
            } => {
                let result = match self.bridge.expire(&request_id, &reason) {
                    Ok(actions) => {
                        self.apply(actions).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = response_tx.send(result);
                false
            }
            SessionCommand::Interrupt { response_tx } => {
                self.interrupt().await;
                let _ = response_tx.send(Ok(()));
                false
            }
            SessionCommand::Close { response_tx } => {
                let result = self.close().await;
                let _ = response_tx.send(result);
                true
            }
        }
    }

    /// Returns `true` when the backend is gone
    async fn handle_event(&mut self, event: ProtocolEvent) -> bool {
        if self.swallow_result
            && matches!(
                event,
                ProtocolEvent::MessageStarted
                    | ProtocolEvent::Text { .. }
                    | ProtocolEvent::Thinking { .. }
                    | ProtocolEvent::ToolUse { .. }
            )
        {
            // Tail of the interrupted turn; its output was already finished
            return false;
        }
        match event {
            ProtocolEvent::Ready { session_id } => {
                self.reporter.set_ready(session_id);
                self.drain().await;
            }
            ProtocolEvent::SessionId(id) => self.reporter.set_backend_session_id(id),
            ProtocolEvent::MessageStarted => self.turn_text.commit(),
            ProtocolEvent::Text { text } => {
                self.turn_text.current = text;
                self.throttler.push(&self.turn_text.compose());
                self.arm_flush();
            }
            ProtocolEvent::Thinking { .. }
            | ProtocolEvent::MessageStopped
            | ProtocolEvent::ToolResult { .. } => {}
            ProtocolEvent::ToolUse { id, name, input } => {
                self.reporter
                    .emit(SessionEvent::ToolUse { id, name, input });
            }
            ProtocolEvent::ControlRequest {
                request_id,
                request,
            } => {
                if matches!(request, InboundControlRequest::CanUseTool { .. }) {
                    let actions = self.bridge.on_request(request_id, &request);
                    self.apply(actions).await;
                } else {
                    log::debug!(
                        "[{}] control request {request_id} left to its fallback",
                        self.label()
                    );
                }
            }
            ProtocolEvent::ControlCancelled { request_id } => {
                let actions = self.bridge.cancel(&request_id);
                self.apply(actions).await;
            }
            ProtocolEvent::Usage(usage) => {
                self.reporter
                    .emit(SessionEvent::Metadata(serde_json::json!({ "usage": usage })));
            }
            ProtocolEvent::TurnComplete {
                is_error,
                result,
                metadata,
            } => {
                if self.swallow_result {
                    log::debug!("[{}] swallowing result of interrupted turn", self.label());
                    self.swallow_result = false;
                    self.queue.end_settle();
                    self.drain().await;
                    return false;
                }
                if self.turn_text.is_empty()
                    && let Some(ref text) = result
                    && !text.is_empty()
                {
                    self.throttler.push(text);
                }
                self.finish_output();
                self.queue.complete_turn();
                self.reporter
                    .emit(SessionEvent::TurnCompleted { is_error, result });
                self.reporter.emit(SessionEvent::Metadata(metadata));
                self.refresh_status();
                self.drain().await;
            }
            ProtocolEvent::Exited { code } => {
                self.go_offline(code);
                return true;
            }
        }
        false
    }

    fn arm_flush(&mut self) {
        if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.config.flush_interval);
        }
    }

    fn finish_output(&mut self) {
        self.flush_at = None;
        self.turn_text.clear();
        if let Some(flush) = self.throttler.finish() {
            self.reporter.emit(SessionEvent::Output(flush));
        }
    }

    fn refresh_status(&self) {
        let status = if self.bridge.outstanding() > 0 {
            SessionStatus::Waiting
        } else if self.queue.is_in_flight() {
            SessionStatus::Working
        } else {
            SessionStatus::Idle
        };
        self.reporter.set_status(status);
    }

    async fn apply(&mut self, actions: Vec<BridgeAction>) {
        for action in actions {
            match action {
                BridgeAction::Raise(prompt) => {
                    self.reporter.emit(SessionEvent::ApprovalRequested(prompt));
                }
                BridgeAction::Clear(request_id) => {
                    self.reporter
                        .emit(SessionEvent::ApprovalCleared { request_id });
                }
                BridgeAction::Reply { control_id, result } => {
                    let reply = match serde_json::to_value(&result) {
                        Ok(value) => InboundReply::Success(value),
                        Err(e) => InboundReply::Error(e.to_string()),
                    };
                    match self.client.respond(&control_id, reply).await {
                        Ok(true) => {}
                        Ok(false) => log::debug!(
                            "[{}] {control_id} was already answered",
                            self.label()
                        ),
                        Err(e) => log::warn!(
                            "[{}] failed to answer {control_id}: {e}",
                            self.label()
                        ),
                    }
                }
            }
        }
        self.refresh_status();
    }

    async fn drain(&mut self) {
        if !self.client.is_ready() || self.reporter.status() == SessionStatus::Offline {
            return;
        }
        while let Some(text) = self.queue.take_next(Instant::now()) {
            self.turn_text.clear();
            self.throttler.discard();
            self.flush_at = None;
            self.reporter
                .emit(SessionEvent::TurnStarted { text: text.clone() });
            self.reporter.set_status(SessionStatus::Working);
            match self.client.send_user_message(&text).await {
                Ok(()) => break,
                Err(e) => {
                    log::warn!("[{}] failed to send message: {e}", self.label());
                    self.reporter
                        .emit(SessionEvent::Error(format!("Failed to send message: {e}")));
                    self.queue.complete_turn();
                    self.refresh_status();
                }
            }
        }
    }

    async fn interrupt(&mut self) {
        let actions = self.bridge.deny_all("Interrupted by the user");
        self.apply(actions).await;

        if self.queue.is_in_flight() {
            if let Err(e) = self
                .client
                .send_control_request(
                    ControlRequest::Interrupt,
                    Some(self.config.interrupt_settle),
                )
                .await
            {
                log::warn!("[{}] interrupt not acknowledged: {e}", self.label());
            }
            self.swallow_result = true;
            self.queue
                .abort_turn(Instant::now() + self.config.interrupt_settle);
        }

        self.finish_output();
        self.reporter.set_status(SessionStatus::Idle);
    }

    async fn close(&mut self) -> Result<()> {
        let actions = self.bridge.deny_all("Session closed");
        self.apply(actions).await;
        self.finish_output();
        if let Err(e) = self.client.refuse_all_inbound().await {
            log::debug!("[{}] could not refuse pending requests: {e}", self.label());
        }
        let result = self.client.close().await;
        self.reporter.set_status(SessionStatus::Offline);
        self.reporter.emit(SessionEvent::Exited { code: None });
        result
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.close().await {
            log::warn!("[{}] close on drop failed: {e}", self.label());
        }
    }

    fn go_offline(&mut self, code: Option<i32>) {
        self.finish_output();
        for prompt in self.bridge.prompts() {
            self.reporter.emit(SessionEvent::ApprovalCleared {
                request_id: prompt.request_id,
            });
        }
        self.bridge = ApprovalBridge::new();
        self.reporter.set_status(SessionStatus::Offline);
        self.reporter.emit(SessionEvent::Exited { code });
    }
}
