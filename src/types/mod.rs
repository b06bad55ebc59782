//! Type definitions for the runner agent
//!
//! This module contains the data model shared by every layer, organized
//! into logical submodules:
//!
//! - [`identifiers`] - Type-safe ID wrappers (`SessionId`, `RequestId`, `RunnerId`, `ToolName`)
//! - [`permissions`] - Permission modes, controller decisions and the wire mapping
//! - [`messages`] - Backend wire lines, content blocks and stream events
//! - [`approval`] - Normalized approval prompts and pending entries
//! - [`session`] - Session status, durable records and session events

pub mod approval;
pub mod identifiers;
pub mod messages;
pub mod permissions;
pub mod session;

// Re-export commonly used types
pub use approval::{ApprovalAnswer, ApprovalPrompt, PendingApproval};
pub use identifiers::{RequestId, RunnerId, SessionId, ToolName};
pub use messages::{
    AssistantMessageContent, ContentBlock, ContentBlockStart, ContentDelta, StreamEvent,
    WireMessage,
};
pub use permissions::{
    ControllerDecision, PermissionBehavior, PermissionMode, PermissionResult, PermissionUpdate,
    wire_behavior,
};
pub use session::{
    BackendKind, OutputFlush, SessionEnvelope, SessionEvent, SessionRecord, SessionStatus,
};
