//! Approval synchronization
//!
//! [`ApprovalCoordinator`] keeps every outstanding human decision until it is
//! answered, expires, or its session ends, and resends them when the
//! controller reconnects. Reissue storms collapse through [`ReissueLock`],
//! and [`route`] decides where an approval goes when the connection that
//! raised it is gone.

mod coordinator;
mod lock;
mod routing;

pub use coordinator::{
    ApprovalCoordinator, DEFAULT_APPROVAL_TTL, DEFAULT_REISSUE_COOLDOWN, DecisionOutcome,
    ReissueOutcome, ReissueReason,
};
pub use lock::{ClaimOutcome, ReissueLock};
pub use routing::{RouteTarget, SessionLookup, route, session_from_request_id};

use crate::types::approval::PendingApproval;
use crate::types::identifiers::RunnerId;

/// Delivery side of approval sync
///
/// Implemented by the controller channel; tests use an in-memory sink.
pub trait ApprovalSink {
    /// Runners currently reachable
    fn connected_runners(&self) -> Vec<RunnerId>;

    /// Send `approval` to `runner`; `false` if it could not be sent
    fn deliver(&self, runner: &RunnerId, approval: &PendingApproval) -> bool;
}
