//! Correlation tables for in-flight control requests
//!
//! [`PendingRequests`] tracks requests this process sent and is waiting on;
//! [`InboundRequests`] tracks requests the backend sent and is waiting on.
//! Both are plain maps: every entry leaves the map exactly once, and the
//! caller that removes it owns the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

use crate::error::{Result, RunnerError};
use crate::types::identifiers::RequestId;

use super::messages::{ControlResponseBody, InboundControlRequest};

/// Outcome delivered to the waiting caller
pub type ControlOutcome = Result<serde_json::Value>;

/// One outbound request awaiting its `control_response`
#[derive(Debug)]
struct PendingControlRequest {
    sent_at: Instant,
    resolve: oneshot::Sender<ControlOutcome>,
}

/// Outbound correlation table
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: HashMap<RequestId, PendingControlRequest>,
}

impl PendingRequests {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiver its outcome arrives on
    ///
    /// # Errors
    /// Returns error if `id` is already registered
    pub fn register(&mut self, id: RequestId) -> Result<oneshot::Receiver<ControlOutcome>> {
        if self.entries.contains_key(&id) {
            return Err(RunnerError::control_protocol(format!(
                "Duplicate control request id: {id}"
            )));
        }
        let (resolve, rx) = oneshot::channel();
        self.entries.insert(
            id,
            PendingControlRequest {
                sent_at: Instant::now(),
                resolve,
            },
        );
        Ok(rx)
    }

    /// Settle the entry matching a `control_response`
    ///
    /// Returns `false` when no entry matches; such responses are ignored.
    pub fn resolve(&mut self, body: ControlResponseBody) -> bool {
        let id = RequestId::new(body.request_id());
        let Some(entry) = self.entries.remove(&id) else {
            log::debug!("Ignoring control_response for unknown request {id}");
            return false;
        };

        let outcome = match body {
            ControlResponseBody::Success { response, .. } => {
                Ok(response.unwrap_or(serde_json::Value::Null))
            }
            ControlResponseBody::Error { request_id, error } => {
                Err(RunnerError::control_rejected(request_id, error))
            }
        };

        log::debug!(
            "Control request {id} settled after {:?}",
            entry.sent_at.elapsed()
        );
        // The waiter may already have given up; the entry is gone either way
        let _ = entry.resolve.send(outcome);
        true
    }

    /// Remove an entry without settling it (timeout or cancelled waiter)
    ///
    /// Returns `true` if the entry was still present.
    pub fn expire(&mut self, id: &RequestId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Number of outstanding requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no requests are outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Removes its correlation entry when the waiting future goes away
pub(crate) struct CorrelationGuard {
    pub(crate) table: Arc<parking_lot::Mutex<PendingRequests>>,
    pub(crate) id: RequestId,
}

impl Drop for CorrelationGuard {
    fn drop(&mut self) {
        self.table.lock().expire(&self.id);
    }
}

/// Inbound control requests awaiting an answer from this process
#[derive(Debug, Default)]
pub struct InboundRequests {
    entries: HashMap<RequestId, InboundControlRequest>,
}

impl InboundRequests {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request from the backend
    pub fn insert(&mut self, id: RequestId, request: InboundControlRequest) {
        if self.entries.insert(id.clone(), request).is_some() {
            log::warn!("Backend reused control request id {id}");
        }
    }

    /// Claim the right to answer `id`
    ///
    /// Only the first claim succeeds, so a request is answered at most once.
    pub fn take(&mut self, id: &RequestId) -> Option<InboundControlRequest> {
        self.entries.remove(id)
    }

    /// Whether `id` still awaits an answer
    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of unanswered requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether every request has been answered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain every unanswered request
    pub fn drain(&mut self) -> Vec<(RequestId, InboundControlRequest)> {
        self.entries.drain().collect()
    }
}

