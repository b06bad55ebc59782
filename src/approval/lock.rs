//! Cross-process advisory lock for reissue dedup
//!
//! A claim is a file created with `create_new` in the lock directory. The
//! file holds the claim time in unix millis; a claim older than the cooldown
//! is stale and may be taken over. Several runner processes (or a restarted
//! one) may share the directory, and exclusive create makes exactly one of
//! them win.

use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Result of trying to claim a reissue slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the slot until the cooldown elapses
    Claimed,
    /// Someone claimed the slot within the cooldown
    Held,
    /// The lock could not be evaluated; treat the reissue as already done
    FailedOpen,
}

impl ClaimOutcome {
    /// Whether the caller should go ahead and resend
    #[must_use]
    pub const fn should_send(self) -> bool {
        matches!(self, Self::Claimed)
    }
}

/// File-backed reissue lock namespace
#[derive(Debug, Clone)]
pub struct ReissueLock {
    dir: PathBuf,
    cooldown: Duration,
}

impl ReissueLock {
    /// Lock namespace rooted at `dir`
    ///
    /// The directory is created lazily on the first claim.
    pub fn new(dir: impl Into<PathBuf>, cooldown: Duration) -> Self {
        Self {
            dir: dir.into(),
            cooldown,
        }
    }

    /// Lock directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cooldown window of a claim
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Claim the slot for `key` now
    #[must_use]
    pub fn try_claim(&self, key: &str) -> ClaimOutcome {
        self.try_claim_at(key, Utc::now())
    }

    /// Claim the slot for `key` as of `now`
    #[must_use]
    pub fn try_claim_at(&self, key: &str, now: DateTime<Utc>) -> ClaimOutcome {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            log::error!(
                "Reissue lock directory {} unavailable, failing open: {e}",
                self.dir.display()
            );
            return ClaimOutcome::FailedOpen;
        }

        let path = self.path_for(key);
        match create_claim(&path, now) {
            Ok(()) => return ClaimOutcome::Claimed,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                log::error!("Failed to claim reissue lock {}, failing open: {e}", path.display());
                return ClaimOutcome::FailedOpen;
            }
        }

        if !self.is_stale(&path, now) {
            return ClaimOutcome::Held;
        }

        log::warn!("Taking over stale reissue lock {}", path.display());
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != ErrorKind::NotFound
        {
            log::error!("Failed to clear stale reissue lock {}, failing open: {e}", path.display());
            return ClaimOutcome::FailedOpen;
        }

        // Another process may win the race between remove and create
        match create_claim(&path, now) {
            Ok(()) => ClaimOutcome::Claimed,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => ClaimOutcome::Held,
            Err(e) => {
                log::error!("Failed to claim reissue lock {}, failing open: {e}", path.display());
                ClaimOutcome::FailedOpen
            }
        }
    }

    /// Remove lock files whose cooldown has elapsed
    ///
    /// Returns the number of files removed. Safe to call at any time.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Remove lock files whose cooldown has elapsed as of `now`
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "lock")
                && self.is_stale(&path, now)
                && fs::remove_file(&path).is_ok()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("Swept {removed} expired reissue locks");
        }
        removed
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.lock"))
    }

    /// A claim is stale once its recorded time is a full cooldown old
    ///
    /// Unreadable claims are judged by file mtime instead.
    fn is_stale(&self, path: &Path, now: DateTime<Utc>) -> bool {
        let claimed_at = fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .or_else(|| {
                fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .map(DateTime::<Utc>::from)
            });

        let Some(claimed_at) = claimed_at else {
            return true;
        };
        let Ok(cooldown) = chrono::Duration::from_std(self.cooldown) else {
            return false;
        };
        now - claimed_at >= cooldown
    }
}

fn create_claim(path: &Path, now: DateTime<Utc>) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(now.timestamp_millis().to_string().as_bytes())
}
