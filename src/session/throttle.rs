//! Output throttling
//!
//! Streaming fragments are coalesced and released at a bounded interval.
//! The throttler never emits the same content twice in a row, and the
//! completion flush is always marked `is_complete`.

use crate::types::session::OutputFlush;

/// How pushed fragments combine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleMode {
    /// Each push is the full content so far
    Replace,
    /// Each push is a fragment to concatenate
    Append,
}

/// Coalescing buffer for one turn's output
#[derive(Debug)]
pub struct OutputThrottler {
    mode: ThrottleMode,
    buffer: String,
    last_emitted: Option<String>,
    last_complete: bool,
}

impl OutputThrottler {
    /// Create an empty throttler
    #[must_use]
    pub const fn new(mode: ThrottleMode) -> Self {
        Self {
            mode,
            buffer: String::new(),
            last_emitted: None,
            last_complete: false,
        }
    }

    /// Accumulation mode
    #[must_use]
    pub const fn mode(&self) -> ThrottleMode {
        self.mode
    }

    /// Feed a fragment
    pub fn push(&mut self, fragment: &str) {
        match self.mode {
            ThrottleMode::Replace => {
                self.buffer.clear();
                self.buffer.push_str(fragment);
            }
            ThrottleMode::Append => self.buffer.push_str(fragment),
        }
    }

    /// Content accumulated so far
    #[must_use]
    pub fn content(&self) -> &str {
        &self.buffer
    }

    /// Whether a regular flush would emit anything
    #[must_use]
    pub fn has_unflushed(&self) -> bool {
        self.last_emitted.as_deref() != Some(self.buffer.as_str())
            && !(self.buffer.is_empty() && self.last_emitted.is_none())
    }

    /// Periodic flush; `None` when the content has not changed
    pub fn flush(&mut self) -> Option<OutputFlush> {
        if !self.has_unflushed() {
            return None;
        }
        self.last_emitted = Some(self.buffer.clone());
        self.last_complete = false;
        Some(OutputFlush {
            content: self.buffer.clone(),
            is_complete: false,
        })
    }

    /// Drop unflushed content without emitting it
    pub fn discard(&mut self) {
        self.buffer.clear();
        self.last_emitted = None;
    }

    /// Final flush of the turn, then reset for the next one
    ///
    /// Emits when the content changed since the last flush, or when the last
    /// flush carried content but was not yet marked complete.
    pub fn finish(&mut self) -> Option<OutputFlush> {
        let changed = self.has_unflushed();
        let needs_marker = !self.last_complete && !self.buffer.is_empty();
        let flush = (changed || needs_marker).then(|| OutputFlush {
            content: self.buffer.clone(),
            is_complete: true,
        });
        self.buffer.clear();
        self.last_emitted = None;
        self.last_complete = flush.is_some();
        flush
    }
}
