//! Runner configuration
//!
//! Built either programmatically via [`RunnerConfig::builder`] or from
//! `RUNNER_AGENT_*` environment variables via [`RunnerConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use crate::approval::{DEFAULT_APPROVAL_TTL, DEFAULT_REISSUE_COOLDOWN};
use crate::error::{Result, RunnerError};
use crate::protocol::{DeltaMode, ProtocolConfig};
use crate::registry::DEFAULT_SESSION_MAX_AGE;
use crate::session::SessionConfig;
use crate::sync::{RunnerCapabilities, SyncConfig};
use crate::types::identifiers::RunnerId;

/// Prefix of every environment variable read by [`RunnerConfig::from_env`]
pub const ENV_PREFIX: &str = "RUNNER_AGENT_";

/// Minimum ratio of ping timeout to ping interval
pub const PING_TIMEOUT_FACTOR: u32 = 3;

/// Complete runner configuration
#[derive(Clone)]
pub struct RunnerConfig {
    /// Runner identity
    pub runner_id: RunnerId,
    /// Controller websocket URL
    pub controller_url: String,
    /// Bearer token for the controller
    pub token: Option<String>,
    /// Holds `sessions.json` and `reissue-locks/`
    pub data_dir: PathBuf,
    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Application heartbeat interval
    pub heartbeat_interval: Duration,
    /// Websocket ping interval
    pub ping_interval: Duration,
    /// Silence after which the socket is dropped
    pub ping_timeout: Duration,
    /// How long an approval waits for a decision
    pub approval_ttl: Duration,
    /// Reissue dedup window
    pub reissue_cooldown: Duration,
    /// Age after which inactive session records are purged
    pub session_max_age: Duration,
    /// How often stale records, approvals and locks are swept
    pub sweep_interval: Duration,
    /// Session output flush interval
    pub flush_interval: Duration,
    /// Wait for control responses
    pub control_timeout: Duration,
    /// How protocol backends stream text deltas
    pub delta_mode: DeltaMode,
    /// Ready fallback for silent backends
    pub ready_fallback: Duration,
    /// Fallback answer delay for hook and MCP requests
    pub external_responder_timeout: Duration,
    /// Longest accepted backend stdout line
    pub max_line_length: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_id: RunnerId::new(default_runner_id()),
            controller_url: "ws://127.0.0.1:8787/runner".to_string(),
            token: None,
            data_dir: default_data_dir(),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(30),
            approval_ttl: DEFAULT_APPROVAL_TTL,
            reissue_cooldown: DEFAULT_REISSUE_COOLDOWN,
            session_max_age: DEFAULT_SESSION_MAX_AGE,
            sweep_interval: Duration::from_secs(60 * 60),
            flush_interval: Duration::from_millis(500),
            control_timeout: Duration::from_secs(30),
            delta_mode: DeltaMode::default(),
            ready_fallback: Duration::from_millis(100),
            external_responder_timeout: Duration::from_secs(60),
            max_line_length: crate::transport::subprocess::DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl std::fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("runner_id", &self.runner_id)
            .field("controller_url", &self.controller_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("data_dir", &self.data_dir)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("approval_ttl", &self.approval_ttl)
            .field("reissue_cooldown", &self.reissue_cooldown)
            .field("session_max_age", &self.session_max_age)
            .field("sweep_interval", &self.sweep_interval)
            .field("flush_interval", &self.flush_interval)
            .field("control_timeout", &self.control_timeout)
            .field("delta_mode", &self.delta_mode)
            .finish_non_exhaustive()
    }
}

impl RunnerConfig {
    /// Create a new builder for `RunnerConfig`
    #[must_use]
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::default()
    }

    /// Read configuration from `RUNNER_AGENT_*` variables
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if a variable is set but cannot be parsed
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    ///
    /// # Errors
    /// Returns `InvalidConfig` if a variable is set but cannot be parsed
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|value| !value.trim().is_empty())
        };
        let millis = |name: &str| -> Result<Option<Duration>> {
            get(name).map(|v| parse_u64(name, &v).map(Duration::from_millis)).transpose()
        };
        let secs = |name: &str| -> Result<Option<Duration>> {
            get(name).map(|v| parse_u64(name, &v).map(Duration::from_secs)).transpose()
        };

        let mut builder = Self::builder();
        if let Some(id) = get("ID") {
            builder = builder.runner_id(id);
        }
        if let Some(url) = get("CONTROLLER_URL") {
            builder = builder.controller_url(url);
        }
        if let Some(token) = get("TOKEN") {
            builder = builder.token(token);
        }
        if let Some(dir) = get("DATA_DIR") {
            builder = builder.data_dir(dir);
        }
        if let Some(d) = millis("RECONNECT_DELAY_MS")? {
            builder = builder.reconnect_delay(d);
        }
        if let Some(d) = millis("HEARTBEAT_MS")? {
            builder = builder.heartbeat_interval(d);
        }
        if let Some(d) = millis("PING_MS")? {
            builder = builder.ping_interval(d);
        }
        if let Some(d) = millis("PING_TIMEOUT_MS")? {
            builder = builder.ping_timeout(d);
        }
        if let Some(d) = secs("APPROVAL_TTL_SECS")? {
            builder = builder.approval_ttl(d);
        }
        if let Some(d) = millis("REISSUE_COOLDOWN_MS")? {
            builder = builder.reissue_cooldown(d);
        }
        if let Some(d) = secs("SESSION_MAX_AGE_SECS")? {
            builder = builder.session_max_age(d);
        }
        if let Some(d) = millis("FLUSH_MS")? {
            builder = builder.flush_interval(d);
        }
        if let Some(d) = millis("CONTROL_TIMEOUT_MS")? {
            builder = builder.control_timeout(d);
        }
        if let Some(mode) = get("DELTA_MODE") {
            let parsed = mode.parse::<DeltaMode>().map_err(|_| {
                RunnerError::invalid_config(format!(
                    "{ENV_PREFIX}DELTA_MODE={mode} must be append or replace"
                ))
            })?;
            builder = builder.delta_mode(parsed);
        }
        builder.build()
    }

    /// Directory of reissue lock files
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.data_dir.join("reissue-locks")
    }

    /// Settings for the controller channel
    #[must_use]
    pub fn sync_config(&self, cli_types: Vec<String>) -> SyncConfig {
        SyncConfig {
            url: self.controller_url.clone(),
            token: self.token.clone(),
            runner_id: self.runner_id.clone(),
            reconnect_delay: self.reconnect_delay,
            heartbeat_interval: self.heartbeat_interval,
            ping_interval: self.ping_interval,
            ping_timeout: self.ping_timeout,
            capabilities: RunnerCapabilities::all(),
            cli_types,
        }
    }

    /// Settings for protocol clients
    #[must_use]
    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            control_timeout: self.control_timeout,
            delta_mode: self.delta_mode,
            ready_fallback: self.ready_fallback,
            external_responder_timeout: self.external_responder_timeout,
            max_line_length: self.max_line_length,
            ..ProtocolConfig::default()
        }
    }

    /// Settings for session actors
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            flush_interval: self.flush_interval,
            ..SessionConfig::default()
        }
    }
}

// ============================================================================
// Builder for RunnerConfig
// ============================================================================

/// Builder for `RunnerConfig`
#[derive(Debug, Default)]
pub struct RunnerConfigBuilder {
    config: RunnerConfig,
}

impl RunnerConfigBuilder {
    /// Set runner id
    #[must_use]
    pub fn runner_id(mut self, id: impl Into<RunnerId>) -> Self {
        self.config.runner_id = id.into();
        self
    }

    /// Set controller URL
    #[must_use]
    pub fn controller_url(mut self, url: impl Into<String>) -> Self {
        self.config.controller_url = url.into();
        self
    }

    /// Set bearer token
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Set data directory
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    /// Set reconnect delay
    #[must_use]
    pub const fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Set heartbeat interval
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set ping interval
    #[must_use]
    pub const fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Set ping timeout
    #[must_use]
    pub const fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    /// Set approval TTL
    #[must_use]
    pub const fn approval_ttl(mut self, ttl: Duration) -> Self {
        self.config.approval_ttl = ttl;
        self
    }

    /// Set reissue cooldown
    #[must_use]
    pub const fn reissue_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.reissue_cooldown = cooldown;
        self
    }

    /// Set session record max age
    #[must_use]
    pub const fn session_max_age(mut self, age: Duration) -> Self {
        self.config.session_max_age = age;
        self
    }

    /// Set sweep interval
    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set output flush interval
    #[must_use]
    pub const fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Set control response timeout
    #[must_use]
    pub const fn control_timeout(mut self, timeout: Duration) -> Self {
        self.config.control_timeout = timeout;
        self
    }

    /// Set how protocol backends stream text deltas
    #[must_use]
    pub const fn delta_mode(mut self, mode: DeltaMode) -> Self {
        self.config.delta_mode = mode;
        self
    }

    /// Validate and build the configuration
    ///
    /// A ping timeout shorter than three ping intervals is raised to that
    /// minimum with a warning.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for zero intervals or a non-websocket URL
    pub fn build(mut self) -> Result<RunnerConfig> {
        let config = &mut self.config;

        if !(config.controller_url.starts_with("ws://") || config.controller_url.starts_with("wss://")) {
            return Err(RunnerError::invalid_config(format!(
                "controller URL must be ws:// or wss://, got {}",
                config.controller_url
            )));
        }
        for (name, value) in [
            ("ping interval", config.ping_interval),
            ("heartbeat interval", config.heartbeat_interval),
            ("flush interval", config.flush_interval),
            ("sweep interval", config.sweep_interval),
            ("approval TTL", config.approval_ttl),
        ] {
            if value.is_zero() {
                return Err(RunnerError::invalid_config(format!("{name} must be non-zero")));
            }
        }

        let minimum = config.ping_interval * PING_TIMEOUT_FACTOR;
        if config.ping_timeout < minimum {
            log::warn!(
                "Ping timeout {}ms is below {PING_TIMEOUT_FACTOR}x the ping interval, using {}ms",
                config.ping_timeout.as_millis(),
                minimum.as_millis()
            );
            config.ping_timeout = minimum;
        }

        Ok(self.config)
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|e| {
        RunnerError::invalid_config(format!("{ENV_PREFIX}{name}={value} is not a number: {e}"))
    })
}

fn default_runner_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .map_or_else(|| format!("runner-{}", uuid::Uuid::new_v4().simple()), |h| format!("runner-{h}"))
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".runner-agent"))
        .unwrap_or_else(|_| PathBuf::from(".runner-agent"))
}
