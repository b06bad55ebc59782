//! Transport layer for communicating with backend CLI processes
//!
//! This module provides the transport abstraction and the subprocess
//! implementation both session backends are built on.

pub mod subprocess;

use tokio::sync::mpsc;

use crate::error::Result;

/// Transport trait for communicating with a backend process
///
/// This trait defines the interface for sending input to and receiving
/// output from a backend CLI process.
pub trait Transport: Send + Sync {
    /// Connect to the transport
    ///
    /// # Errors
    /// Returns error if connection fails
    fn connect(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Write data to the transport
    ///
    /// Suspends until the data has been accepted by the OS pipe.
    ///
    /// # Arguments
    /// * `data` - String data to write (typically a JSON line)
    ///
    /// # Errors
    /// Returns error if write fails or transport is not ready
    fn write(&mut self, data: &str) -> impl std::future::Future<Output = Result<()>> + Send;

    /// End the input stream (close stdin)
    ///
    /// # Errors
    /// Returns error if closing fails
    fn end_input(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Read output from the transport
    ///
    /// Returns a receiver fed by a background task, allowing concurrent
    /// writes. The last item is always [`ReadEvent::Exited`].
    fn read_output(&mut self, framing: OutputFraming) -> mpsc::UnboundedReceiver<ReadEvent>;

    /// Check if transport is ready for communication
    fn is_ready(&self) -> bool;

    /// Close the transport and clean up resources
    ///
    /// # Errors
    /// Returns error if cleanup fails
    fn close(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

pub use subprocess::{OutputFraming, ProcessSpec, ReadEvent, SubprocessTransport};
