//! Per-session message queue
//!
//! At most one message is in flight. The next one is released only after
//! the current turn completes, or after an interrupt has settled.

use std::collections::VecDeque;
use tokio::time::Instant;

/// FIFO of messages waiting for their turn
#[derive(Debug, Default)]
pub struct MessageQueue {
    pending: VecDeque<String>,
    in_flight: bool,
    settle_until: Option<Instant>,
}

impl MessageQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message; returns how many messages are now waiting
    pub fn push(&mut self, text: String) -> usize {
        self.pending.push_back(text);
        self.pending.len()
    }

    /// Release the next message if no turn is in flight or settling
    pub fn take_next(&mut self, now: Instant) -> Option<String> {
        if self.in_flight {
            return None;
        }
        if let Some(until) = self.settle_until {
            if now < until {
                return None;
            }
            self.settle_until = None;
        }
        let next = self.pending.pop_front()?;
        self.in_flight = true;
        Some(next)
    }

    /// Mark the in-flight turn finished; returns whether one was in flight
    pub fn complete_turn(&mut self) -> bool {
        std::mem::replace(&mut self.in_flight, false)
    }

    /// Abort the in-flight turn and hold the queue until `until`
    ///
    /// Returns whether a turn was in flight.
    pub fn abort_turn(&mut self, until: Instant) -> bool {
        let was_in_flight = self.complete_turn();
        if was_in_flight {
            self.settle_until = Some(until);
        }
        was_in_flight
    }

    /// Release the settle hold early
    pub fn end_settle(&mut self) {
        self.settle_until = None;
    }

    /// Deadline of the current settle hold
    #[must_use]
    pub const fn settle_deadline(&self) -> Option<Instant> {
        self.settle_until
    }

    /// Whether a turn is in flight
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Number of messages waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no messages are waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
