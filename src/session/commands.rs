//! Session command protocol
//!
//! Defines the command messages sent from a [`SessionHandle`](super::SessionHandle)
//! to its session actor, so no caller ever holds a lock on the backend.

use tokio::sync::oneshot;

use crate::error::Result;
use crate::types::identifiers::RequestId;

/// Commands that can be sent to a session actor
pub(crate) enum SessionCommand {
    /// Queue a message for the backend
    SendMessage {
        /// Message text
        text: String,
        /// Channel to send the operation result back
        response_tx: oneshot::Sender<Result<()>>,
    },

    /// Answer an outstanding approval
    SendApproval {
        /// 1-based option number; anything else means "other"
        option_number: usize,
        /// Free text accompanying the choice
        message: Option<String>,
        /// Prompt being answered; the oldest outstanding one if absent
        request_id: Option<RequestId>,
        /// Channel to send the operation result back
        response_tx: oneshot::Sender<Result<()>>,
    },

    /// Withdraw a prompt nobody answered in time, denying it
    ExpireApproval {
        /// Prompt that expired
        request_id: RequestId,
        /// Reason passed to the backend
        reason: String,
        /// Channel to send the operation result back
        response_tx: oneshot::Sender<Result<()>>,
    },

    /// Abort the in-flight turn
    Interrupt {
        /// Channel to send the operation result back
        response_tx: oneshot::Sender<Result<()>>,
    },

    /// Shut the session down
    Close {
        /// Channel to send the shutdown confirmation back
        response_tx: oneshot::Sender<Result<()>>,
    },
}
