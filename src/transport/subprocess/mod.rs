//! Subprocess transport
//!
//! Spawns a backend CLI as a child process and talks to it over its stdio
//! pipes. Stdout is framed either as lines (protocol backends) or raw
//! chunks (terminal backends); stderr is logged, never forwarded.

mod config;
mod lifecycle;
mod reader;
mod transport;

// Re-export public types
pub use config::{
    DANGEROUS_ENV_VARS, DEFAULT_CLOSE_GRACE, DEFAULT_MAX_LINE_LENGTH, OutputFraming, ProcessSpec,
    ReadEvent,
};
pub use transport::SubprocessTransport;
