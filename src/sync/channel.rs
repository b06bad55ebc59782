//! Reconnecting websocket channel to the controller

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalSink;
use crate::error::{Result, RunnerError};
use crate::types::approval::PendingApproval;
use crate::types::identifiers::RunnerId;

use super::capabilities::RunnerCapabilities;
use super::messages::SyncMessage;

/// Connection settings for [`SyncChannel`]
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Controller websocket URL
    pub url: String,
    /// Bearer token sent on connect
    pub token: Option<String>,
    /// This runner's id
    pub runner_id: RunnerId,
    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Interval of application heartbeats
    pub heartbeat_interval: Duration,
    /// Interval of websocket pings
    pub ping_interval: Duration,
    /// Silence after which the socket is considered dead
    pub ping_timeout: Duration,
    /// Capabilities advertised on register
    pub capabilities: RunnerCapabilities,
    /// Backend CLI types advertised on register
    pub cli_types: Vec<String>,
}

/// What the channel reports to the runner loop
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connected and registered
    Connected,
    /// The connection was lost; a reconnect is scheduled
    Disconnected,
    /// A frame from the controller
    Message(SyncMessage),
}

type Outbound = mpsc::UnboundedSender<SyncMessage>;

/// Sending side of the channel, cheap to clone
#[derive(Debug, Clone)]
pub struct SyncHandle {
    runner_id: RunnerId,
    outbound: Arc<parking_lot::Mutex<Option<Outbound>>>,
    active_sessions: Arc<AtomicUsize>,
}

impl SyncHandle {
    /// A handle that is not attached to any connection
    #[must_use]
    pub fn detached(runner_id: RunnerId) -> Self {
        Self {
            runner_id,
            outbound: Arc::new(parking_lot::Mutex::new(None)),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// This runner's id
    #[must_use]
    pub const fn runner_id(&self) -> &RunnerId {
        &self.runner_id
    }

    /// Whether a connection is currently open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.outbound
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Queue a frame on the open connection
    ///
    /// Never waits: returns `false` immediately when no connection is open.
    pub fn send(&self, message: SyncMessage) -> bool {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            log::debug!("Sync channel closed, dropping {}", message.kind());
            return false;
        };
        if tx.send(message).is_err() {
            log::debug!("Sync connection went away while sending");
            return false;
        }
        true
    }

    /// Session count reported in heartbeats
    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.store(count, Ordering::Relaxed);
    }

    fn attach(&self, tx: Outbound) {
        *self.outbound.lock() = Some(tx);
    }

    fn detach(&self) {
        *self.outbound.lock() = None;
    }
}

impl ApprovalSink for SyncHandle {
    fn connected_runners(&self) -> Vec<RunnerId> {
        if self.is_open() {
            vec![self.runner_id.clone()]
        } else {
            Vec::new()
        }
    }

    fn deliver(&self, runner: &RunnerId, approval: &PendingApproval) -> bool {
        self.send(SyncMessage::approval_request(runner.clone(), approval))
    }
}

/// Background task keeping one controller connection alive
pub struct SyncChannel {
    config: SyncConfig,
    handle: SyncHandle,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
}

impl SyncChannel {
    /// Start connecting in the background
    ///
    /// Returns the sending handle, the event stream and the task handle.
    /// The task ends when `shutdown` is cancelled.
    #[must_use]
    pub fn spawn(
        config: SyncConfig,
        shutdown: CancellationToken,
    ) -> (SyncHandle, mpsc::UnboundedReceiver<TransportEvent>, JoinHandle<()>) {
        let handle = SyncHandle::detached(config.runner_id.clone());
        let (events, events_rx) = mpsc::unbounded_channel();
        let channel = Self {
            config,
            handle: handle.clone(),
            events,
            shutdown,
        };
        let task = tokio::spawn(channel.run());
        (handle, events_rx, task)
    }

    async fn run(self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.connect_once().await {
                Ok(()) => {}
                Err(e) => log::warn!("Controller connection to {} failed: {e}", self.config.url),
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            log::info!(
                "Reconnecting to controller in {}ms",
                self.config.reconnect_delay.as_millis()
            );
            tokio::select! {
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
                () = self.shutdown.cancelled() => break,
            }
        }
        log::debug!("Sync channel stopped");
    }

    async fn connect_once(&self) -> Result<()> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RunnerError::invalid_config(format!("Invalid controller URL: {e}")))?;
        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| RunnerError::invalid_config(format!("Invalid token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RunnerError::connection(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let register = SyncMessage::Register {
            runner_id: self.config.runner_id.clone(),
            version: crate::VERSION.to_string(),
            capabilities: self.config.capabilities,
            cli_types: self.config.cli_types.clone(),
        };
        write
            .send(Message::Text(to_text(&register)?))
            .await
            .map_err(|e| RunnerError::connection(e.to_string()))?;

        let (tx, mut outbound) = mpsc::unbounded_channel();
        self.handle.attach(tx);
        log::info!("Connected to controller at {}", self.config.url);
        let _ = self.events.send(TransportEvent::Connected);

        let mut heartbeat = interval_after(self.config.heartbeat_interval);
        let mut ping = interval_after(self.config.ping_interval);
        let mut last_seen = Instant::now();

        let result = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break Ok(());
                }
                Some(message) = outbound.recv() => {
                    let text = match to_text(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            log::warn!("Dropping unserializable {} frame: {e}", message.kind());
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        break Err(RunnerError::connection(e.to_string()));
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = SyncMessage::Heartbeat {
                        runner_id: self.config.runner_id.clone(),
                        timestamp: chrono::Utc::now(),
                        active_sessions: self.handle.active_sessions.load(Ordering::Relaxed),
                    };
                    let sent = match to_text(&beat) {
                        Ok(text) => write.send(Message::Text(text)).await,
                        Err(_) => continue,
                    };
                    if let Err(e) = sent {
                        break Err(RunnerError::connection(e.to_string()));
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        break Err(RunnerError::connection(e.to_string()));
                    }
                }
                () = tokio::time::sleep_until(last_seen + self.config.ping_timeout) => {
                    log::warn!(
                        "No traffic from controller for {}ms, dropping connection",
                        self.config.ping_timeout.as_millis()
                    );
                    break Ok(());
                }
                frame = read.next() => {
                    last_seen = Instant::now();
                    match frame {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                            Ok(message) => {
                                let _ = self.events.send(TransportEvent::Message(message));
                            }
                            Err(e) => log::warn!("Ignoring malformed controller frame: {e}"),
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Controller closed the connection");
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(RunnerError::connection(e.to_string())),
                    }
                }
            }
        };

        self.handle.detach();
        let _ = self.events.send(TransportEvent::Disconnected);
        result
    }
}

fn interval_after(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

fn to_text(message: &SyncMessage) -> Result<String> {
    serde_json::to_string(message).map_err(RunnerError::from)
}
