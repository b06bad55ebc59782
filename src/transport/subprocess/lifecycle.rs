//! Lifecycle management for subprocess transport (connect, close)

use std::collections::HashMap;
use std::env;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use crate::error::{Result, RunnerError};

use super::config::DANGEROUS_ENV_VARS;
use super::transport::SubprocessTransport;

impl SubprocessTransport {
    /// Spawn the process and wire its stdio
    ///
    /// Stdout is kept for `read_output`; stderr is drained into the log; an
    /// exit watcher task owns the child and publishes its exit code.
    ///
    /// # Errors
    /// Returns error if process spawning fails or stdio handles cannot be obtained
    pub(super) async fn connect_impl(&mut self) -> Result<()> {
        if self.exit_rx.is_some() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args);

        // Set up environment - filter dangerous variables
        let mut process_env = env::vars().collect::<HashMap<_, _>>();
        for (key, value) in &self.spec.env {
            if DANGEROUS_ENV_VARS.contains(&key.as_str()) {
                log::warn!("[{}] refusing to pass {key} to backend", self.spec.label);
                continue;
            }
            process_env.insert(key.clone(), value.clone());
        }

        if let Some(ref cwd) = self.spec.cwd {
            process_env.insert("PWD".to_string(), cwd.to_string_lossy().to_string());
            cmd.current_dir(cwd);
        }

        cmd.env_clear().envs(process_env);

        // Pipe stderr so the child never touches the parent terminal
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if let Some(ref cwd) = self.spec.cwd
                && !cwd.exists()
            {
                return RunnerError::connection(format!(
                    "Working directory does not exist: {}",
                    cwd.display()
                ));
            }
            RunnerError::connection(format!(
                "Failed to start {}: {e}",
                self.spec.program.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::connection("Failed to get stdin handle"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::connection("Failed to get stdout handle"))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::connection("Failed to get stderr handle"))?;

        let label = self.spec.label.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("[{label}] stderr: {line}");
            }
        });

        self.pid = child.id();

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let ready = self.ready.clone();
        let label = self.spec.label.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on an explicit kill and when the transport is dropped
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            ready.store(false, Ordering::SeqCst);
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    log::warn!("[{label}] failed to wait for backend: {e}");
                    None
                }
            };
            log::debug!("[{label}] backend exited with {code:?}");
            let _ = exit_tx.send(Some(code));
        });

        self.stdin = Some(stdin);
        self.stdout = Some(stdout);
        self.kill_tx = Some(kill_tx);
        self.exit_rx = Some(exit_rx);
        self.stderr_task = Some(stderr_task);
        self.ready.store(true, Ordering::SeqCst);

        Ok(())
    }

    /// Close stdin, give the process a grace period, then kill it
    ///
    /// # Errors
    /// Returns error if cleanup fails
    pub(super) async fn close_impl(&mut self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);

        if let Some(mut stdin) = self.stdin.take() {
            use tokio::io::AsyncWriteExt;
            let _ = stdin.shutdown().await;
        }

        let Some(mut exit_rx) = self.exit_rx.clone() else {
            return Ok(());
        };

        let exited = tokio::time::timeout(self.close_grace, exit_rx.wait_for(Option::is_some))
            .await
            .is_ok();

        if !exited {
            log::debug!("[{}] backend ignored stdin close, killing", self.spec.label);
            if let Some(kill_tx) = self.kill_tx.take() {
                let _ = kill_tx.send(());
            }
            exit_rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| RunnerError::transport("Exit watcher ended unexpectedly"))?;
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        Ok(())
    }

    /// Handle Drop cleanup
    pub(super) fn drop_impl(&mut self) {
        self.ready.store(false, Ordering::SeqCst);
        drop(self.stdin.take());

        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}
