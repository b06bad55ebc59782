//! The runner event loop
//!
//! One task owns the session registry and the approval coordinator. It
//! consumes controller frames, session events and sweep ticks, so all
//! session and approval state changes happen in one place without locks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::approval::{
    ApprovalCoordinator, DecisionOutcome, ReissueLock, ReissueOutcome, ReissueReason,
};
use crate::config::RunnerConfig;
use crate::error::Result;
use crate::launcher::{LaunchOptions, LaunchRequest, SessionLauncher};
use crate::registry::{SessionRegistry, SessionStore};
use crate::session::AgentSession;
use crate::sync::{SyncHandle, SyncMessage, TransportEvent};
use crate::types::identifiers::{RequestId, SessionId};
use crate::types::session::{SessionEnvelope, SessionEvent, SessionRecord};

/// Message sent to a backend when its approval expires undecided
const EXPIRED_APPROVAL_MESSAGE: &str = "The approval request expired without a decision";

/// Longest delay between an approval expiring and its session hearing of it
const APPROVAL_EXPIRY_CHECK: std::time::Duration = std::time::Duration::from_secs(30);

/// Parameters of a `session_start` frame
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// External session id
    pub session_id: SessionId,
    /// Backend CLI type
    pub cli_type: String,
    /// Backend flavour
    pub plugin: crate::types::session::BackendKind,
    /// Working directory
    pub folder_path: String,
    /// Backend id the controller asked to resume
    pub resume_session_id: Option<String>,
    /// Chat channel or thread of the session
    pub channel_id: Option<String>,
    /// Model override
    pub model: Option<String>,
    /// Message to queue right away
    pub initial_message: Option<String>,
}

/// Owner of all sessions and approvals on this host
pub struct Runner {
    config: RunnerConfig,
    registry: SessionRegistry,
    approvals: ApprovalCoordinator,
    launcher: SessionLauncher,
    sync: SyncHandle,
    channels: HashMap<SessionId, String>,
    session_events: mpsc::UnboundedReceiver<SessionEnvelope>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("runner_id", &self.config.runner_id)
            .field("registry", &self.registry)
            .field("approvals", &self.approvals.len())
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Build a runner that reports through `sync`
    ///
    /// Session records are loaded from the data directory; a corrupt store
    /// starts empty.
    #[must_use]
    pub fn new(config: RunnerConfig, sync: SyncHandle) -> Self {
        let (event_tx, session_events) = mpsc::unbounded_channel();
        let launcher = SessionLauncher::new(
            config.protocol_config(),
            config.session_config(),
            event_tx,
        );
        let registry = SessionRegistry::open(
            SessionStore::in_dir(&config.data_dir),
            config.session_max_age,
        );
        let approvals = ApprovalCoordinator::new(
            ReissueLock::new(config.lock_dir(), config.reissue_cooldown),
            config.approval_ttl,
        );
        Self {
            config,
            registry,
            approvals,
            launcher,
            sync,
            channels: HashMap::new(),
            session_events,
        }
    }

    /// Replace CLI discovery
    #[must_use]
    pub fn with_locator(
        mut self,
        locate: impl Fn(&str) -> Option<PathBuf> + Send + Sync + 'static,
    ) -> Self {
        self.launcher = self.launcher.with_locator(locate);
        self
    }

    /// Session registry
    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Approval coordinator
    #[must_use]
    pub const fn approvals(&self) -> &ApprovalCoordinator {
        &self.approvals
    }

    /// Run until `shutdown` fires, then close every live session
    ///
    /// Session records are kept so the sessions resume on the next start.
    ///
    /// # Errors
    /// Currently infallible; reserved for fatal loop errors
    pub async fn run(
        mut self,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut expiry = tokio::time::interval(APPROVAL_EXPIRY_CHECK.min(self.config.approval_ttl));
        expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(event) = transport.recv() => self.handle_transport_event(event).await,
                Some(envelope) = self.session_events.recv() => self.handle_session_event(envelope).await,
                _ = expiry.tick() => self.expire_approvals().await,
                _ = sweep.tick() => self.sweep().await,
            }
        }

        let sessions = self.registry.drain_live();
        log::info!("Shutting down {} session(s)", sessions.len());
        for session in sessions {
            if let Err(e) = session.close().await {
                log::warn!("Failed to close session {}: {e}", session.session_id());
            }
        }
        Ok(())
    }

    /// React to one event from the controller channel
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                let outcomes = self.approvals.reissue_all(
                    ReissueReason::Reconnect,
                    None,
                    &self.sync,
                    &self.registry,
                );
                let sent = outcomes
                    .iter()
                    .filter(|(_, o)| matches!(o, ReissueOutcome::Sent(_)))
                    .count();
                if !outcomes.is_empty() {
                    log::info!("Reissued {sent}/{} pending approval(s) after reconnect", outcomes.len());
                }
                self.sync.set_active_sessions(self.registry.len());
            }
            TransportEvent::Disconnected => {
                log::info!("Controller channel down; approvals will be resent on reconnect");
            }
            TransportEvent::Message(message) => self.handle_controller_message(message).await,
        }
    }

    async fn handle_controller_message(&mut self, message: SyncMessage) {
        match message {
            SyncMessage::SessionStart {
                session_id,
                cli_type,
                plugin,
                folder_path,
                resume_session_id,
                channel_id,
                model,
                initial_message,
            } => {
                self.start_session(StartRequest {
                    session_id,
                    cli_type,
                    plugin,
                    folder_path,
                    resume_session_id,
                    channel_id,
                    model,
                    initial_message,
                })
                .await;
            }
            SyncMessage::SessionEnd { session_id } => self.end_session(&session_id).await,
            SyncMessage::SessionInput { session_id, text } => {
                let Some(session) = self.live_session(&session_id) else {
                    return;
                };
                self.registry.touch(&session_id);
                if let Err(e) = session.send_message(text).await {
                    self.sync
                        .send(SyncMessage::session_error(session_id, e.to_string()));
                }
            }
            SyncMessage::Interrupt { session_id } => {
                let Some(session) = self.live_session(&session_id) else {
                    return;
                };
                if let Err(e) = session.interrupt().await {
                    self.sync
                        .send(SyncMessage::session_error(session_id, e.to_string()));
                }
            }
            SyncMessage::ApprovalResponse { request_id, answer } => {
                let session_id = self
                    .approvals
                    .get(&request_id)
                    .map(|p| p.session_id.clone());
                match self
                    .approvals
                    .apply_decision(&request_id, answer, &self.registry)
                    .await
                {
                    DecisionOutcome::Applied { session_id } => {
                        self.registry.touch(&session_id);
                    }
                    DecisionOutcome::Expired => {
                        self.sync
                            .send(SyncMessage::approval_expired(request_id, session_id));
                    }
                }
            }
            SyncMessage::PermissionSyncRequest {
                request_id,
                runner_id,
            } => match request_id {
                Some(id) => {
                    let outcome = self.approvals.reissue(
                        &id,
                        ReissueReason::SyncRequest,
                        runner_id.as_ref(),
                        &self.sync,
                        &self.registry,
                    );
                    if outcome == ReissueOutcome::NotFound {
                        self.sync.send(SyncMessage::approval_expired(id, None));
                    }
                }
                None => {
                    self.approvals.reissue_all(
                        ReissueReason::SyncRequest,
                        runner_id.as_ref(),
                        &self.sync,
                        &self.registry,
                    );
                }
            },
            other => log::debug!("Ignoring controller frame {}", other.kind()),
        }
    }

    /// Start (or resume) a session
    ///
    /// A stored backend id takes precedence over the requested resume id.
    pub async fn start_session(&mut self, request: StartRequest) {
        let session_id = request.session_id.clone();

        if let Some(channel) = &request.channel_id {
            self.channels.insert(session_id.clone(), channel.clone());
            self.approvals
                .note_channel(channel.clone(), self.config.runner_id.clone());
        }

        if let Some(session) = self.registry.get(&session_id) {
            log::info!("Session {session_id} already running");
            if let Some(text) = request.initial_message
                && let Err(e) = session.send_message(text).await
            {
                self.sync
                    .send(SyncMessage::session_error(session_id, e.to_string()));
            }
            return;
        }

        let resume_id = self
            .registry
            .resolve_resume_id(&session_id, request.resume_session_id.as_deref());
        let launch = LaunchRequest {
            session_id: session_id.clone(),
            cli_type: request.cli_type.clone(),
            plugin: request.plugin,
            folder_path: PathBuf::from(&request.folder_path),
            options: LaunchOptions {
                resume_id: resume_id.clone(),
                model: request.model,
                ..LaunchOptions::default()
            },
        };

        let session = match self.launcher.launch(launch).await {
            Ok(session) => session,
            Err(e) => {
                log::error!("Failed to start session {session_id}: {e}");
                self.sync.send(SyncMessage::session_error(
                    session_id,
                    format!("Failed to start session: {e}"),
                ));
                return;
            }
        };

        let now = chrono::Utc::now();
        self.registry.insert(
            Arc::clone(&session),
            SessionRecord {
                backend_session_id: resume_id,
                cli_type: request.cli_type,
                plugin: request.plugin,
                folder_path: request.folder_path,
                runner_id: Some(self.config.runner_id.clone()),
                created_at: now,
                last_activity_at: now,
            },
        );
        self.sync.set_active_sessions(self.registry.len());

        if let Some(text) = request.initial_message
            && let Err(e) = session.send_message(text).await
        {
            self.sync
                .send(SyncMessage::session_error(session_id, e.to_string()));
        }
    }

    /// End a session and forget everything about it
    pub async fn end_session(&mut self, session_id: &SessionId) {
        let known = self
            .registry
            .end_session(session_id, &mut self.approvals)
            .await;
        self.channels.remove(session_id);
        self.sync.set_active_sessions(self.registry.len());
        if known {
            self.sync.send(SyncMessage::SessionEnd {
                session_id: session_id.clone(),
            });
        }
    }

    /// React to one session event
    pub async fn handle_session_event(&mut self, envelope: SessionEnvelope) {
        let SessionEnvelope { session_id, event } = envelope;
        match event {
            SessionEvent::Ready { backend_session_id } => {
                if let Some(id) = &backend_session_id {
                    self.registry.set_backend_session_id(&session_id, id.clone());
                }
                self.sync.send(SyncMessage::SessionReady {
                    session_id,
                    backend_session_id,
                });
            }
            SessionEvent::BackendSessionId(id) => {
                self.registry.set_backend_session_id(&session_id, id);
            }
            SessionEvent::StatusChanged(status) => {
                self.sync.send(SyncMessage::Status { session_id, status });
            }
            SessionEvent::TurnStarted { .. } | SessionEvent::TurnCompleted { .. } => {
                self.registry.touch(&session_id);
            }
            SessionEvent::Output(flush) => {
                self.sync.send(SyncMessage::Output {
                    session_id,
                    content: flush.content,
                    is_complete: flush.is_complete,
                });
            }
            SessionEvent::ToolUse { name, .. } => {
                log::debug!("[{session_id}] tool use: {name}");
            }
            SessionEvent::ApprovalRequested(prompt) => {
                let origin = self.channels.get(&session_id).cloned();
                self.approvals.raise(
                    prompt,
                    session_id,
                    Some(self.config.runner_id.clone()),
                    origin,
                    &self.sync,
                    &self.registry,
                );
            }
            SessionEvent::ApprovalCleared { request_id } => {
                self.approvals.remove(&request_id);
            }
            SessionEvent::Metadata(metadata) => {
                self.sync.send(SyncMessage::Metadata {
                    session_id,
                    metadata,
                });
            }
            SessionEvent::Error(message) => {
                self.sync.send(SyncMessage::session_error(session_id, message));
            }
            SessionEvent::Exited { code } => {
                // Sessions ended on request are already gone from the registry
                if self.registry.detach(&session_id).is_some() {
                    log::warn!("Session {session_id} backend exited unexpectedly (code {code:?})");
                    self.approvals.remove_for_session(&session_id);
                    self.sync.set_active_sessions(self.registry.len());
                    self.sync.send(SyncMessage::session_error(
                        session_id,
                        format!("Backend exited (code {code:?})"),
                    ));
                }
            }
        }
    }

    /// Handle the session events already queued, without waiting for more
    ///
    /// Returns how many were handled.
    pub async fn handle_queued_session_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.session_events.try_recv() {
            self.handle_session_event(envelope).await;
            handled += 1;
        }
        handled
    }

    /// Deny every approval that outlived its TTL and tell the controller
    pub async fn expire_approvals(&mut self) {
        for expired in self.approvals.prune_expired() {
            self.deny_expired(&expired.session_id, expired.request_id.clone())
                .await;
            self.sync.send(SyncMessage::approval_expired(
                expired.request_id,
                Some(expired.session_id),
            ));
        }
    }

    /// Expire approvals, purge stale records and sweep reissue locks
    pub async fn sweep(&mut self) {
        self.expire_approvals().await;
        self.registry.sweep_stale();
        self.approvals.lock().sweep();
    }

    async fn deny_expired(&self, session_id: &SessionId, request_id: RequestId) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        if let Err(e) = session
            .expire_approval(request_id, EXPIRED_APPROVAL_MESSAGE.to_string())
            .await
        {
            log::debug!("[{session_id}] expired approval already gone: {e}");
        }
    }

    fn live_session(&self, session_id: &SessionId) -> Option<Arc<dyn AgentSession>> {
        let session = self.registry.get(session_id);
        if session.is_none() {
            log::warn!("Frame for unknown session {session_id}");
            self.sync.send(SyncMessage::session_error(
                session_id.clone(),
                format!("Session {session_id} is not running"),
            ));
        }
        session
    }
}
