//! `ProtocolClient`: one backend subprocess behind the control protocol
//!
//! The client owns the subprocess stdio. A reader task parses stdout lines,
//! runs them through [`Demux`], settles correlations and forwards
//! [`ProtocolEvent`]s. Writers share the transport behind a mutex.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Result, RunnerError};
use crate::transport::{OutputFraming, ProcessSpec, ReadEvent, SubprocessTransport, Transport};
use crate::types::identifiers::RequestId;
use crate::types::messages::parse_message;
use crate::types::permissions::PermissionMode;

use super::accumulator::DeltaMode;
use super::demux::{Demux, Dispatch, ProtocolEvent, ReadyLatch};
use super::messages::{ControlRequest, ControlResponseBody, InboundControlRequest, OutboundMessage};
use super::pending::{CorrelationGuard, InboundRequests, PendingRequests};

/// Timing and parsing knobs for a [`ProtocolClient`]
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Default wait for a `control_response`
    pub control_timeout: Duration,
    /// Ready fires after this long if the backend stays silent
    pub ready_fallback: Duration,
    /// Hook and MCP requests are answered with a fallback after this long
    pub external_responder_timeout: Duration,
    /// How text deltas combine
    pub delta_mode: DeltaMode,
    /// Longest accepted stdout line
    pub max_line_length: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            control_timeout: Duration::from_secs(30),
            ready_fallback: Duration::from_millis(100),
            external_responder_timeout: Duration::from_secs(60),
            delta_mode: DeltaMode::Append,
            max_line_length: crate::transport::subprocess::DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Answer to an inbound control request
#[derive(Debug, Clone, PartialEq)]
pub enum InboundReply {
    /// Success with a payload
    Success(serde_json::Value),
    /// Failure with a description
    Error(String),
}

/// State shared between the client handle and its background tasks
struct Shared {
    transport: Mutex<SubprocessTransport>,
    pending: Arc<parking_lot::Mutex<PendingRequests>>,
    inbound: parking_lot::Mutex<InboundRequests>,
    latch: Arc<ReadyLatch>,
    session_id: Arc<OnceLock<String>>,
    turn_active: AtomicBool,
    alive: AtomicBool,
    label: String,
}

impl Shared {
    async fn write(&self, message: &OutboundMessage) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(RunnerError::session_closed(self.label.clone()));
        }
        let line = message.to_line()?;
        let mut transport = self.transport.lock().await;
        transport.write(&line).await
    }

    /// Answer an inbound request if nobody has yet
    async fn answer(&self, request_id: &RequestId, body: ControlResponseBody) -> Result<bool> {
        if self.inbound.lock().take(request_id).is_none() {
            log::debug!(
                "[{}] control request {request_id} already answered",
                self.label
            );
            return Ok(false);
        }
        self.write(&OutboundMessage::ControlResponse { response: body })
            .await?;
        Ok(true)
    }
}

/// Client for one backend subprocess speaking the control protocol
pub struct ProtocolClient {
    shared: Arc<Shared>,
    config: ProtocolConfig,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl ProtocolClient {
    /// Spawn the backend and start reading its output
    ///
    /// Returns the client and the receiver its events arrive on. A single
    /// [`ProtocolEvent::Ready`] is delivered: on the init message, on the
    /// first line carrying a session id, or after `ready_fallback`.
    ///
    /// # Errors
    /// Returns error if the process cannot be spawned
    pub async fn start(
        spec: ProcessSpec,
        config: ProtocolConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProtocolEvent>)> {
        let label = spec.label.clone();
        let mut transport = SubprocessTransport::new(spec);
        transport.connect().await?;
        let lines = transport.read_output(OutputFraming::Lines {
            max_length: config.max_line_length,
        });

        let shared = Arc::new(Shared {
            transport: Mutex::new(transport),
            pending: Arc::new(parking_lot::Mutex::new(PendingRequests::new())),
            inbound: parking_lot::Mutex::new(InboundRequests::new()),
            latch: Arc::new(ReadyLatch::new()),
            session_id: Arc::new(OnceLock::new()),
            turn_active: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            label,
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let fallback_shared = shared.clone();
        let fallback_tx = event_tx.clone();
        let ready_fallback = config.ready_fallback;
        tokio::spawn(async move {
            tokio::time::sleep(ready_fallback).await;
            if fallback_shared.alive.load(Ordering::SeqCst) && fallback_shared.latch.fire() {
                log::debug!("[{}] ready by fallback timer", fallback_shared.label);
                let _ = fallback_tx.send(ProtocolEvent::Ready {
                    session_id: fallback_shared.session_id.get().cloned(),
                });
            }
        });

        let demux = Demux::new(
            config.delta_mode,
            shared.latch.clone(),
            shared.session_id.clone(),
        );
        let reader_task = tokio::spawn(Self::reader_task(
            shared.clone(),
            demux,
            lines,
            event_tx,
            config.external_responder_timeout,
        ));

        Ok((
            Self {
                shared,
                config,
                next_id: AtomicU64::new(1),
                reader_task,
            },
            event_rx,
        ))
    }

    /// Reader task - parses lines and dispatches them
    async fn reader_task(
        shared: Arc<Shared>,
        mut demux: Demux,
        mut lines: mpsc::UnboundedReceiver<ReadEvent>,
        event_tx: mpsc::UnboundedSender<ProtocolEvent>,
        external_timeout: Duration,
    ) {
        while let Some(item) = lines.recv().await {
            let line = match item {
                ReadEvent::Line(line) => line,
                ReadEvent::Chunk(_) => continue,
                ReadEvent::Exited { code } => {
                    // Outstanding correlations are left to their own timeouts
                    shared.alive.store(false, Ordering::SeqCst);
                    shared.turn_active.store(false, Ordering::SeqCst);
                    let _ = event_tx.send(ProtocolEvent::Exited { code });
                    break;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let value = match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("[{}] dropping malformed line: {e}", shared.label);
                    continue;
                }
            };
            let message = match parse_message(value) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("[{}] dropping unrecognized line: {e}", shared.label);
                    continue;
                }
            };

            for dispatch in demux.handle(message) {
                match dispatch {
                    Dispatch::Event(event) => {
                        if matches!(event, ProtocolEvent::TurnComplete { .. }) {
                            shared.turn_active.store(false, Ordering::SeqCst);
                        }
                        let _ = event_tx.send(event);
                    }
                    Dispatch::Response(body) => {
                        shared.pending.lock().resolve(body);
                    }
                    Dispatch::Inbound {
                        request_id,
                        request,
                    } => {
                        Self::accept_inbound(&shared, &event_tx, request_id, request, external_timeout)
                            .await;
                    }
                    Dispatch::Cancel(request_id) => {
                        if shared.inbound.lock().take(&request_id).is_some() {
                            let _ = event_tx.send(ProtocolEvent::ControlCancelled { request_id });
                        }
                    }
                }
            }
        }
    }

    async fn accept_inbound(
        shared: &Arc<Shared>,
        event_tx: &mpsc::UnboundedSender<ProtocolEvent>,
        request_id: RequestId,
        request: InboundControlRequest,
        external_timeout: Duration,
    ) {
        shared
            .inbound
            .lock()
            .insert(request_id.clone(), request.clone());

        if matches!(request, InboundControlRequest::Other) {
            let reply = request.fallback_reply(&request_id);
            if let Err(e) = shared.answer(&request_id, reply).await {
                log::warn!("[{}] failed to refuse {request_id}: {e}", shared.label);
            }
            return;
        }

        if request.needs_external_responder() {
            let timer_shared = shared.clone();
            let timer_id = request_id.clone();
            let reply = request.fallback_reply(&request_id);
            tokio::spawn(async move {
                tokio::time::sleep(external_timeout).await;
                match timer_shared.answer(&timer_id, reply).await {
                    Ok(true) => log::warn!(
                        "[{}] no responder for {timer_id}, sent fallback",
                        timer_shared.label
                    ),
                    Ok(false) => {}
                    Err(e) => log::warn!(
                        "[{}] fallback for {timer_id} failed: {e}",
                        timer_shared.label
                    ),
                }
            });
        }

        let _ = event_tx.send(ProtocolEvent::ControlRequest {
            request_id,
            request,
        });
    }

    fn next_request_id(&self) -> RequestId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        RequestId::new(format!("req_{n}_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Send a control request and wait for its response
    ///
    /// Resolves with the response payload, or fails with a timeout when no
    /// response arrives within `timeout` (the configured default if `None`).
    /// The correlation entry is removed on every outcome.
    ///
    /// # Errors
    /// Returns `Timeout`, `ControlRejected` on an error response, or a
    /// transport error if the write fails
    pub async fn send_control_request(
        &self,
        request: ControlRequest,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let id = self.next_request_id();
        let subtype = request.subtype();
        let rx = self.shared.pending.lock().register(id.clone())?;
        let _guard = CorrelationGuard {
            table: self.shared.pending.clone(),
            id: id.clone(),
        };

        self.shared
            .write(&OutboundMessage::ControlRequest {
                request_id: id.clone(),
                request,
            })
            .await?;

        let timeout = timeout.unwrap_or(self.config.control_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RunnerError::control_protocol(format!(
                "Correlation for {id} dropped"
            ))),
            Err(_) => Err(RunnerError::timeout(format!(
                "Control request {subtype} ({id}) timed out after {timeout:?}"
            ))),
        }
    }

    /// Start a turn with a user message
    ///
    /// # Errors
    /// Returns error if the write fails
    pub async fn send_user_message(&self, text: &str) -> Result<()> {
        let message = OutboundMessage::user(text, self.backend_session_id());
        self.shared.turn_active.store(true, Ordering::SeqCst);
        if let Err(e) = self.shared.write(&message).await {
            self.shared.turn_active.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Answer an inbound control request
    ///
    /// Returns `false` if the request was already answered, cancelled, or
    /// covered by its fallback.
    ///
    /// # Errors
    /// Returns error if the write fails
    pub async fn respond(&self, request_id: &RequestId, reply: InboundReply) -> Result<bool> {
        let request_id_str = request_id.to_string();
        let body = match reply {
            InboundReply::Success(response) => ControlResponseBody::Success {
                request_id: request_id_str,
                response: Some(response),
            },
            InboundReply::Error(error) => ControlResponseBody::Error {
                request_id: request_id_str,
                error,
            },
        };
        self.shared.answer(request_id, body).await
    }

    /// Answer every unanswered inbound request with its fallback
    ///
    /// # Errors
    /// Returns error if a write fails
    pub async fn refuse_all_inbound(&self) -> Result<usize> {
        let outstanding = self.shared.inbound.lock().drain();
        let count = outstanding.len();
        for (request_id, request) in outstanding {
            let body = request.fallback_reply(&request_id);
            self.shared
                .write(&OutboundMessage::ControlResponse { response: body })
                .await?;
        }
        Ok(count)
    }

    /// Ask the backend to abort the in-flight turn
    ///
    /// # Errors
    /// Returns error if the request fails or times out
    pub async fn interrupt(&self) -> Result<()> {
        self.send_control_request(ControlRequest::Interrupt, None)
            .await
            .map(|_| ())
    }

    /// Switch the backend model
    ///
    /// # Errors
    /// Returns error if the request fails or times out
    pub async fn set_model(&self, model: Option<String>) -> Result<()> {
        self.send_control_request(ControlRequest::SetModel { model }, None)
            .await
            .map(|_| ())
    }

    /// Change the permission mode
    ///
    /// # Errors
    /// Returns error if the request fails or times out
    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()> {
        self.send_control_request(ControlRequest::SetPermissionMode { mode }, None)
            .await
            .map(|_| ())
    }

    /// Cap extended thinking tokens
    ///
    /// # Errors
    /// Returns error if the request fails or times out
    pub async fn set_max_thinking_tokens(&self, max_thinking_tokens: u32) -> Result<()> {
        self.send_control_request(
            ControlRequest::SetMaxThinkingTokens {
                max_thinking_tokens,
            },
            None,
        )
        .await
        .map(|_| ())
    }

    /// Backend session id, once captured
    #[must_use]
    pub fn backend_session_id(&self) -> Option<&str> {
        self.shared.session_id.get().map(String::as_str)
    }

    /// Whether the ready signal has fired
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.shared.latch.is_fired()
    }

    /// Whether the subprocess is still running
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Whether a turn is in flight
    #[must_use]
    pub fn is_turn_active(&self) -> bool {
        self.shared.turn_active.load(Ordering::SeqCst)
    }

    /// Number of outbound requests awaiting a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Number of inbound requests awaiting an answer
    #[must_use]
    pub fn inbound_count(&self) -> usize {
        self.shared.inbound.lock().len()
    }

    /// Close stdin and wait for the subprocess to exit
    ///
    /// # Errors
    /// Returns error if cleanup fails
    pub async fn close(&self) -> Result<()> {
        self.shared.alive.store(false, Ordering::SeqCst);
        let mut transport = self.shared.transport.lock().await;
        transport.close().await
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
