//! Subprocess transport over a child's stdio pipes

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::Transport;
use crate::error::{Result, RunnerError};

use super::config::{DEFAULT_CLOSE_GRACE, OutputFraming, ProcessSpec, ReadEvent};

/// Exit state shared between the exit watcher and readers
///
/// `None` while the process runs; `Some(code)` once it has exited.
pub(super) type ExitState = Option<Option<i32>>;

/// Subprocess transport for a backend CLI
pub struct SubprocessTransport {
    pub(super) spec: ProcessSpec,
    pub(super) stdin: Option<ChildStdin>,
    pub(super) stdout: Option<ChildStdout>,
    pub(super) pid: Option<u32>,
    pub(super) ready: Arc<AtomicBool>,
    pub(super) close_grace: std::time::Duration,
    pub(super) kill_tx: Option<oneshot::Sender<()>>,
    pub(super) exit_rx: Option<watch::Receiver<ExitState>>,
    pub(super) reader_task: Option<JoinHandle<()>>,
    pub(super) stderr_task: Option<JoinHandle<()>>,
}

impl SubprocessTransport {
    /// Create a transport for `spec`; nothing is spawned until `connect`
    #[must_use]
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            stdin: None,
            stdout: None,
            pid: None,
            ready: Arc::new(AtomicBool::new(false)),
            close_grace: DEFAULT_CLOSE_GRACE,
            kill_tx: None,
            exit_rx: None,
            reader_task: None,
            stderr_task: None,
        }
    }

    /// Override the grace period `close` allows before killing the process
    #[must_use]
    pub const fn with_close_grace(mut self, grace: std::time::Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// The launch spec
    #[must_use]
    pub const fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// OS process id, once spawned
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Watch the process exit state
    ///
    /// The value is `None` while running and `Some(code)` after exit.
    #[must_use]
    pub fn exit_watch(&self) -> Option<watch::Receiver<ExitState>> {
        self.exit_rx.clone()
    }

    /// Write one framed line (a trailing newline is added when missing)
    ///
    /// # Errors
    /// Returns error if the transport is not ready or the write fails
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        if line.ends_with('\n') {
            self.write(line).await
        } else {
            self.write(&format!("{line}\n")).await
        }
    }
}

impl Transport for SubprocessTransport {
    async fn connect(&mut self) -> Result<()> {
        self.connect_impl().await
    }

    async fn write(&mut self, data: &str) -> Result<()> {
        if !self.is_ready() {
            return Err(RunnerError::transport("Transport is not ready for writing"));
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RunnerError::transport("stdin not available"))?;

        // write_all suspends while the pipe is full, which is the drain wait
        stdin
            .write_all(data.as_bytes())
            .await
            .map_err(|e| RunnerError::transport(format!("Failed to write to stdin: {e}")))?;

        stdin
            .flush()
            .await
            .map_err(|e| RunnerError::transport(format!("Failed to flush stdin: {e}")))?;

        Ok(())
    }

    async fn end_input(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin
                .shutdown()
                .await
                .map_err(|e| RunnerError::transport(format!("Failed to close stdin: {e}")))?;
        }
        Ok(())
    }

    fn read_output(&mut self, framing: OutputFraming) -> mpsc::UnboundedReceiver<ReadEvent> {
        self.read_output_impl(framing)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> Result<()> {
        self.close_impl().await
    }
}

impl Drop for SubprocessTransport {
    fn drop(&mut self) {
        self.drop_impl();
    }
}
