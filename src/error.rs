//! Error types for the runner agent

use thiserror::Error;

/// Main error type for the runner agent
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Backend CLI not found or not installed
    #[error("CLI not found: {0}")]
    CliNotFound(String),

    /// Connection error when starting or talking to a backend or the controller
    #[error("Connection error: {0}")]
    Connection(String),

    /// Process execution error with exit code and stderr
    #[error("Process error (exit code {exit_code}): {message}")]
    Process {
        /// Error message
        message: String,
        /// Process exit code
        exit_code: i32,
        /// Standard error output
        stderr: Option<String>,
    },

    /// JSON decode error when parsing backend or controller output
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),

    /// Message parse error with optional raw data
    #[error("Message parse error: {message}")]
    MessageParse {
        /// Error message
        message: String,
        /// Raw message data that failed to parse
        data: Option<serde_json::Value>,
    },

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Control protocol error
    #[error("Control protocol error: {0}")]
    ControlProtocol(String),

    /// The backend answered a control request with an error response
    #[error("Control request {request_id} rejected: {message}")]
    ControlRejected {
        /// Correlation id of the rejected request
        request_id: String,
        /// Error text supplied by the backend
        message: String,
    },

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session already closed or its backend has exited
    #[error("Session {0} is closed")]
    SessionClosed(String),

    /// No pending approval matches the supplied request id
    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    /// Durable session store failure
    #[error("Session store error: {0}")]
    Store(String),
}

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

impl RunnerError {
    /// Create a CLI not found error for a backend type
    pub fn cli_not_found(cli_type: impl AsRef<str>) -> Self {
        Self::CliNotFound(format!(
            "No executable found for backend '{}'. Install it or put it on PATH.",
            cli_type.as_ref()
        ))
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a process error
    pub fn process(msg: impl Into<String>, exit_code: i32, stderr: Option<String>) -> Self {
        Self::Process {
            message: msg.into(),
            exit_code,
            stderr,
        }
    }

    /// Create a message parse error
    pub fn message_parse(msg: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self::MessageParse {
            message: msg.into(),
            data,
        }
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a control protocol error
    pub fn control_protocol(msg: impl Into<String>) -> Self {
        Self::ControlProtocol(msg.into())
    }

    /// Create a control rejected error
    pub fn control_rejected(request_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ControlRejected {
            request_id: request_id.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a session not found error
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound(session_id.into())
    }

    /// Create a session closed error
    pub fn session_closed(session_id: impl Into<String>) -> Self {
        Self::SessionClosed(session_id.into())
    }

    /// Create an approval not found error
    pub fn approval_not_found(request_id: impl Into<String>) -> Self {
        Self::ApprovalNotFound(request_id.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Whether this error is a timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
