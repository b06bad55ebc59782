//! Control protocol implementation for bidirectional communication
//!
//! This module provides the client and message types for the line-delimited
//! JSON protocol spoken with protocol backends over stdio.
//!
//! # Overview
//!
//! The control protocol enables:
//! - Correlated request/response pairs in both directions
//! - Tool permission prompts from the backend
//! - Hook and MCP callbacks with bounded fallback answers
//! - A streaming event feed demultiplexed into typed events
//!
//! # Example: Talking to a backend
//!
//! ```no_run
//! use runner_agent::protocol::{ProtocolClient, ProtocolConfig, ProtocolEvent};
//! use runner_agent::transport::ProcessSpec;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let argv = vec!["claude".to_string(), "--print".to_string()];
//! let spec = ProcessSpec::from_argv(&argv).ok_or("empty argv")?;
//! let (client, mut events) = ProtocolClient::start(spec, ProtocolConfig::default()).await?;
//!
//! client.send_user_message("hello").await?;
//! while let Some(event) = events.recv().await {
//!     if let ProtocolEvent::TurnComplete { result, .. } = event {
//!         log::info!("turn finished: {result:?}");
//!         break;
//!     }
//! }
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

mod accumulator;
mod client;
mod demux;
mod messages;
mod pending;

// Re-export public types
pub use accumulator::{CompletedToolUse, DeltaMode, MessageAccumulator};
pub use client::{InboundReply, ProtocolClient, ProtocolConfig};
pub use demux::{Demux, Dispatch, ProtocolEvent, ReadyLatch};
pub use messages::{ControlRequest, ControlResponseBody, InboundControlRequest, OutboundMessage};
pub use pending::{ControlOutcome, InboundRequests, PendingRequests};
