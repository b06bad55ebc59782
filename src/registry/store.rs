//! Durable session record store
//!
//! One JSON document maps external session ids to [`SessionRecord`]s. Writes
//! go to a temp file that is renamed over the document, so a crash never
//! leaves a half-written store behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, RunnerError};
use crate::types::identifiers::SessionId;
use crate::types::session::SessionRecord;

/// File name of the store inside the data directory
pub const STORE_FILE: &str = "sessions.json";

/// Keyed session records as persisted
pub type RecordMap = BTreeMap<SessionId, SessionRecord>;

/// JSON-file session store
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Store at an explicit path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `sessions.json` inside `data_dir`
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(STORE_FILE))
    }

    /// Path of the document
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all records
    ///
    /// A missing, unreadable or corrupt document yields an empty map.
    #[must_use]
    pub fn load(&self) -> RecordMap {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return RecordMap::new(),
            Err(e) => {
                log::warn!(
                    "Failed to read session store {}, starting empty: {e}",
                    self.path.display()
                );
                return RecordMap::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                log::warn!(
                    "Session store {} is corrupt, starting empty: {e}",
                    self.path.display()
                );
                RecordMap::new()
            }
        }
    }

    /// Replace the document with `records`
    ///
    /// # Errors
    /// Returns `Store` if the document cannot be written
    pub fn save(&self, records: &RecordMap) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                RunnerError::store(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let content = serde_json::to_string_pretty(records)
            .map_err(|e| RunnerError::store(format!("Failed to serialize sessions: {e}")))?;
        atomic_write(&self.path, &content)
    }
}

fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");

    fs::write(&temp_path, content)
        .map_err(|e| RunnerError::store(format!("Failed to write temp file: {e}")))?;

    fs::rename(&temp_path, path)
        .map_err(|e| RunnerError::store(format!("Failed to rename temp file: {e}")))?;

    Ok(())
}
