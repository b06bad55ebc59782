//! # Runner agent
//!
//! Bridges a remote chat controller to AI CLI backends running on this host.
//! The controller starts sessions, sends messages and answers approvals over
//! a websocket; the runner drives each backend as a subprocess and streams
//! throttled output and approval prompts back.
//!
//! ## Layers
//!
//! - [`transport`]: child-process stdio with line or chunk framing
//! - [`protocol`]: the line-delimited JSON control protocol, with request
//!   correlation and a typed event feed
//! - [`session`]: one actor per session behind the [`AgentSession`] trait,
//!   enforcing one turn in flight and throttling output
//! - [`approval`]: pending approvals that survive reconnects, with
//!   deduplicated reissue
//! - [`registry`]: live sessions plus durable resume records
//! - [`sync`]: the reconnecting controller channel
//! - [`runner`]: the single event loop tying them together
//!
//! ## Talking to a session directly
//!
//! ```no_run
//! use runner_agent::session::{AgentSession, ProtocolSession, SessionConfig};
//! use runner_agent::protocol::ProtocolConfig;
//! use runner_agent::transport::ProcessSpec;
//! use runner_agent::types::SessionId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let spec = ProcessSpec::from_argv(&["claude".to_string()]).ok_or("empty argv")?;
//! let session = ProtocolSession::spawn(
//!     SessionId::generate(),
//!     spec,
//!     ProtocolConfig::default(),
//!     SessionConfig::default(),
//!     events_tx,
//! )
//! .await?;
//!
//! session.send_message("Summarize this repository".to_string()).await?;
//! while let Some(envelope) = events.recv().await {
//!     log::info!("{:?}", envelope.event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod approval;
pub mod config;
pub mod error;
pub mod launcher;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod session;
pub mod sync;
pub mod transport;
pub mod types;

// Re-export commonly used types for external API
pub use approval::{ApprovalCoordinator, ApprovalSink, DecisionOutcome, ReissueLock};
pub use config::{RunnerConfig, RunnerConfigBuilder};
pub use error::{Result, RunnerError};
pub use protocol::{ProtocolClient, ProtocolConfig, ProtocolEvent};
pub use registry::{SessionRegistry, SessionStore};
pub use runner::Runner;
pub use session::{AgentSession, ProtocolSession, SessionConfig, SessionHandle, TerminalSession};
pub use sync::{SyncChannel, SyncHandle, SyncMessage, TransportEvent};
pub use transport::{SubprocessTransport, Transport};

// Re-export type submodules for flat public API
pub use types::identifiers::{RequestId, RunnerId, SessionId, ToolName};
pub use types::permissions::{ControllerDecision, PermissionResult, wire_behavior};

/// Version of the runner
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
