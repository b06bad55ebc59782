//! Configuration constants and types for subprocess transport

use std::collections::HashMap;
use std::path::PathBuf;

/// Default maximum length of one stdout line (1MB)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Grace period between closing stdin and killing the process
pub const DEFAULT_CLOSE_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Dangerous environment variables that should not be passed to subprocess
///
/// These variables can affect how the subprocess loads and executes code,
/// potentially creating security vulnerabilities.
pub const DANGEROUS_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "NODE_OPTIONS",
    "PYTHONPATH",
    "PERL5LIB",
    "RUBYLIB",
];

/// How stdout is framed by the reader task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFraming {
    /// Newline-delimited text, one event per line
    Lines {
        /// Lines longer than this are dropped
        max_length: usize,
    },
    /// Raw chunks as the process writes them
    Chunks,
}

impl Default for OutputFraming {
    fn default() -> Self {
        Self::Lines {
            max_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Everything needed to launch a backend process
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Executable path
    pub program: PathBuf,
    /// Arguments, not including the program
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Label used to tag log lines (usually the session id)
    pub label: String,
}

impl ProcessSpec {
    /// Build a spec from an argv vector whose first element is the program
    ///
    /// Returns `None` for an empty argv.
    #[must_use]
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
            ..Self::default()
        })
    }

    /// Set the working directory
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add one environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the log label
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// One item produced by the stdout reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// A complete line, without its terminator
    Line(String),
    /// A raw chunk, lossily decoded as UTF-8
    Chunk(String),
    /// Stdout closed and the process exited
    Exited {
        /// Exit code, when the process exited normally
        code: Option<i32>,
    },
}
