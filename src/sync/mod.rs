//! Duplex channel to the remote controller
//!
//! A websocket that reconnects forever after a fixed delay, re-registers on
//! every connect, and keeps itself honest with heartbeats and pings. Sends
//! are best-effort: when the socket is down they fail immediately and the
//! approval coordinator resends on the next connect.

mod capabilities;
mod channel;
mod messages;

pub use capabilities::RunnerCapabilities;
pub use channel::{SyncChannel, SyncConfig, SyncHandle, TransportEvent};
pub use messages::{APPROVAL_EXPIRED, SyncMessage};
