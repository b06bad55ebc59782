//! Backend launch collaborators
//!
//! Turning a session request into a running backend takes two small pieces:
//! an [`ArgvBuilder`] for the command line and [`find_cli`] for the binary.
//! [`SessionLauncher`] combines them with the session actors.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Result, RunnerError};
use crate::protocol::ProtocolConfig;
use crate::session::{AgentSession, ProtocolSession, SessionConfig, TerminalSession};
use crate::transport::ProcessSpec;
use crate::types::identifiers::SessionId;
use crate::types::permissions::PermissionMode;
use crate::types::session::{BackendKind, SessionEnvelope};

/// What a backend should be started with
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Backend-native session to resume
    pub resume_id: Option<String>,
    /// Model override
    pub model: Option<String>,
    /// Initial permission mode
    pub permission_mode: Option<PermissionMode>,
    /// Extra arguments appended verbatim
    pub extra_args: Vec<String>,
}

/// Builds the argv for one backend type
pub trait ArgvBuilder: Send + Sync {
    /// Full argv, program first
    fn build(&self, cli_path: &Path, options: &LaunchOptions) -> Vec<String>;
}

/// Argv for a stream-json protocol backend
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeArgvBuilder;

impl ArgvBuilder for ClaudeArgvBuilder {
    fn build(&self, cli_path: &Path, options: &LaunchOptions) -> Vec<String> {
        let mut argv: Vec<String> = [
            cli_path.to_string_lossy().as_ref(),
            "--print",
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
            "--permission-prompt-tool",
            "stdio",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        if let Some(resume) = &options.resume_id {
            argv.push("--resume".to_string());
            argv.push(resume.clone());
        }
        if let Some(model) = &options.model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }
        if let Some(mode) = options.permission_mode {
            argv.push("--permission-mode".to_string());
            argv.push(mode.as_str().to_string());
        }
        argv.extend(options.extra_args.iter().cloned());
        argv
    }
}

/// Argv for a plain interactive backend: the binary plus extra arguments
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalArgvBuilder;

impl ArgvBuilder for TerminalArgvBuilder {
    fn build(&self, cli_path: &Path, options: &LaunchOptions) -> Vec<String> {
        std::iter::once(cli_path.to_string_lossy().into_owned())
            .chain(options.extra_args.iter().cloned())
            .collect()
    }
}

/// Locate a backend CLI binary
///
/// Tries `PATH` first, then the usual per-user install locations.
#[must_use]
pub fn find_cli(cli_type: &str) -> Option<PathBuf> {
    if let Ok(path) = which::which(cli_type) {
        return Some(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| String::from("/root"));
    let home = PathBuf::from(home);
    let locations = [
        home.join(".npm-global/bin").join(cli_type),
        PathBuf::from("/usr/local/bin").join(cli_type),
        home.join(".local/bin").join(cli_type),
        home.join("node_modules/.bin").join(cli_type),
        home.join(".yarn/bin").join(cli_type),
    ];

    locations
        .into_iter()
        .find(|path| path.exists() && path.is_file())
}

/// Everything needed to start one session
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// External session id
    pub session_id: SessionId,
    /// Backend CLI type, resolved through [`find_cli`]
    pub cli_type: String,
    /// Backend flavour
    pub plugin: BackendKind,
    /// Working directory
    pub folder_path: PathBuf,
    /// Launch options
    pub options: LaunchOptions,
}

/// Starts session actors for launch requests
pub struct SessionLauncher {
    protocol: ProtocolConfig,
    session: SessionConfig,
    events: mpsc::UnboundedSender<SessionEnvelope>,
    locate: Box<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>,
}

impl std::fmt::Debug for SessionLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLauncher")
            .field("protocol", &self.protocol)
            .field("session", &self.session)
            .field("locate", &"<fn>")
            .finish_non_exhaustive()
    }
}

impl SessionLauncher {
    /// Launcher reporting session events on `events`
    #[must_use]
    pub fn new(
        protocol: ProtocolConfig,
        session: SessionConfig,
        events: mpsc::UnboundedSender<SessionEnvelope>,
    ) -> Self {
        Self {
            protocol,
            session,
            events,
            locate: Box::new(find_cli),
        }
    }

    /// Replace CLI discovery, e.g. to pin binaries in tests
    #[must_use]
    pub fn with_locator(
        mut self,
        locate: impl Fn(&str) -> Option<PathBuf> + Send + Sync + 'static,
    ) -> Self {
        self.locate = Box::new(locate);
        self
    }

    /// Start a session for `request`
    ///
    /// # Errors
    /// Returns `CliNotFound` if the binary is missing, or the spawn error
    pub async fn launch(&self, request: LaunchRequest) -> Result<Arc<dyn AgentSession>> {
        let cli_path = (self.locate)(&request.cli_type)
            .ok_or_else(|| RunnerError::cli_not_found(&request.cli_type))?;

        let argv = match request.plugin {
            BackendKind::Protocol => ClaudeArgvBuilder.build(&cli_path, &request.options),
            BackendKind::Terminal => TerminalArgvBuilder.build(&cli_path, &request.options),
        };
        let spec = ProcessSpec::from_argv(&argv)
            .ok_or_else(|| RunnerError::invalid_config("empty backend command line"))?
            .cwd(&request.folder_path)
            .label(request.session_id.as_str());

        log::info!(
            "Starting {:?} session {} with {} in {}",
            request.plugin,
            request.session_id,
            cli_path.display(),
            request.folder_path.display()
        );

        let session: Arc<dyn AgentSession> = match request.plugin {
            BackendKind::Protocol => Arc::new(
                ProtocolSession::spawn(
                    request.session_id,
                    spec,
                    self.protocol.clone(),
                    self.session.clone(),
                    self.events.clone(),
                )
                .await?,
            ),
            BackendKind::Terminal => Arc::new(
                TerminalSession::spawn(
                    request.session_id,
                    spec,
                    self.session.clone(),
                    self.events.clone(),
                )
                .await?,
            ),
        };
        Ok(session)
    }
}
