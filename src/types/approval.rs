//! Approval prompt types
//!
//! Every backend-specific "needs a human" signal is normalized into one
//! [`ApprovalPrompt`]. The coordinator wraps a prompt into a
//! [`PendingApproval`] while it waits for a decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identifiers::{RequestId, RunnerId, SessionId, ToolName};

/// Normalized approval event raised by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPrompt {
    /// Id the decision must quote
    pub request_id: RequestId,
    /// Tool (or pseudo-tool for questions) the decision is about
    pub tool_name: ToolName,
    /// Tool input or question payload
    pub input: serde_json::Value,
    /// Option labels, numbered from 1 in the order given
    pub options: Vec<String>,
    /// Whether more than one option may be chosen
    pub is_multi_select: bool,
    /// Whether free text is accepted in place of an option
    pub has_other: bool,
}

/// An outstanding human decision tracked across reconnects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    /// Prompt id
    pub request_id: RequestId,
    /// Owning session
    pub session_id: SessionId,
    /// Runner the prompt was last associated with
    #[serde(default)]
    pub runner_id: Option<RunnerId>,
    /// Tool name
    pub tool_name: ToolName,
    /// Tool input
    pub tool_input: serde_json::Value,
    /// Option labels
    pub options: Vec<String>,
    /// Whether more than one option may be chosen
    pub is_multi_select: bool,
    /// Whether free text is accepted
    pub has_other: bool,
    /// Chat channel/thread the session reports to, if known
    #[serde(default)]
    pub origin_channel: Option<String>,
    /// When the prompt was first raised
    pub first_seen_at: DateTime<Utc>,
    /// When the prompt was last sent to the controller
    pub last_sent_at: DateTime<Utc>,
    /// How many times the prompt has been resent
    pub resend_count: u32,
}

impl PendingApproval {
    /// Create a fresh entry for a prompt raised at `now`
    #[must_use]
    pub fn from_prompt(
        prompt: ApprovalPrompt,
        session_id: SessionId,
        runner_id: Option<RunnerId>,
        origin_channel: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: prompt.request_id,
            session_id,
            runner_id,
            tool_name: prompt.tool_name,
            tool_input: prompt.input,
            options: prompt.options,
            is_multi_select: prompt.is_multi_select,
            has_other: prompt.has_other,
            origin_channel,
            first_seen_at: now,
            last_sent_at: now,
            resend_count: 0,
        }
    }

    /// The prompt as it is presented to the controller
    #[must_use]
    pub fn prompt(&self) -> ApprovalPrompt {
        ApprovalPrompt {
            request_id: self.request_id.clone(),
            tool_name: self.tool_name.clone(),
            input: self.tool_input.clone(),
            options: self.options.clone(),
            is_multi_select: self.is_multi_select,
            has_other: self.has_other,
        }
    }

    /// Whether the entry has outlived `ttl` as of `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.first_seen_at < now - ttl
    }
}

/// Answer to an approval prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalAnswer {
    /// 1-based option number; 0 or out-of-range means "other"
    pub option_number: usize,
    /// Free text accompanying the choice
    #[serde(default)]
    pub message: Option<String>,
}
