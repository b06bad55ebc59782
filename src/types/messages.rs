//! Backend wire message definitions
//!
//! Every line a backend writes to stdout is one JSON object tagged by
//! `type`. This module contains the typed shape of those lines, including the
//! nested partial-message stream events.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

// ============================================================================
// Content Blocks
// ============================================================================

/// Content value for tool results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ContentValue {
    /// String content
    String(String),
    /// Structured content blocks
    Blocks(Vec<serde_json::Value>),
}

/// Content block types found in complete assistant and user messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text content block
    Text {
        /// Text content
        text: String,
    },
    /// Thinking content block (extended thinking)
    Thinking {
        /// Thinking content
        thinking: String,
        /// Signature for verification
        #[serde(default)]
        signature: String,
    },
    /// Tool use request
    ToolUse {
        /// Tool use ID
        id: String,
        /// Tool name
        name: String,
        /// Tool input parameters
        input: serde_json::Value,
    },
    /// Tool execution result
    ToolResult {
        /// ID of the tool use this is a result for
        tool_use_id: String,
        /// Result content
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ContentValue>,
        /// Whether this is an error result
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    /// Block types this crate does not interpret
    #[serde(other)]
    Unknown,
}

/// User content can be string or blocks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UserContent {
    /// Plain string content
    String(String),
    /// Structured content blocks
    Blocks(Vec<ContentBlock>),
}

/// User message content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserMessageContent {
    /// Message role (always "user")
    #[serde(default = "user_role")]
    pub role: String,
    /// Message content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<UserContent>,
}

fn user_role() -> String {
    "user".to_string()
}

/// Assistant message content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantMessageContent {
    /// Model that generated the message
    #[serde(default)]
    pub model: String,
    /// Message content blocks
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl AssistantMessageContent {
    /// Concatenated text of all text blocks
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// Stream Events
// ============================================================================

/// Block header announced by `content_block_start`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockStart {
    /// Text block
    Text {
        /// Initial text, usually empty
        #[serde(default)]
        text: String,
    },
    /// Thinking block
    Thinking {
        /// Initial thinking text, usually empty
        #[serde(default)]
        thinking: String,
    },
    /// Tool use block whose input arrives as JSON fragments
    ToolUse {
        /// Tool use ID
        id: String,
        /// Tool name
        name: String,
    },
    /// Block types this crate does not interpret
    #[serde(other)]
    Other,
}

/// Delta payload carried by `content_block_delta`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    /// Assistant text
    TextDelta {
        /// Text fragment (or full text, depending on backend)
        text: String,
    },
    /// Extended thinking text
    ThinkingDelta {
        /// Thinking fragment
        thinking: String,
    },
    /// Partial tool input JSON
    InputJsonDelta {
        /// Raw JSON fragment
        partial_json: String,
    },
    /// Delta types this crate does not interpret
    #[serde(other)]
    Other,
}

/// Partial-message stream event nested inside a `stream_event` line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A new assistant message begins; per-message buffers reset
    MessageStart {
        /// Message envelope (id, model, initial usage)
        #[serde(default)]
        message: serde_json::Value,
    },
    /// A content block begins
    ContentBlockStart {
        /// Block index within the message
        index: usize,
        /// Block header
        content_block: ContentBlockStart,
    },
    /// A content block receives more data
    ContentBlockDelta {
        /// Block index within the message
        index: usize,
        /// Delta payload
        delta: ContentDelta,
    },
    /// A content block is complete
    ContentBlockStop {
        /// Block index within the message
        index: usize,
    },
    /// Message-level update, typically stop reason and usage
    MessageDelta {
        /// Delta fields such as `stop_reason`
        #[serde(default)]
        delta: serde_json::Value,
        /// Token usage so far
        #[serde(default)]
        usage: Option<serde_json::Value>,
    },
    /// The assistant message is complete
    MessageStop,
    /// Event types this crate does not interpret
    #[serde(other)]
    Other,
}

// ============================================================================
// Top-level Lines
// ============================================================================

/// One line of backend output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// System message; `subtype == "init"` carries the backend session id
    System {
        /// System message subtype
        #[serde(default)]
        subtype: String,
        /// Backend session id
        #[serde(default)]
        session_id: Option<String>,
        /// Additional system message data
        #[serde(flatten)]
        data: serde_json::Value,
    },
    /// Complete assistant message
    Assistant {
        /// Message content
        message: AssistantMessageContent,
        /// Parent tool use ID for nested conversations
        #[serde(default)]
        parent_tool_use_id: Option<String>,
        /// Backend session id
        #[serde(default)]
        session_id: Option<String>,
    },
    /// User message echo, including tool results
    User {
        /// Message content
        message: UserMessageContent,
        /// Parent tool use ID for nested conversations
        #[serde(default)]
        parent_tool_use_id: Option<String>,
        /// Backend session id
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Partial message stream event
    StreamEvent {
        /// Raw stream event
        event: StreamEvent,
        /// Backend session id
        #[serde(default)]
        session_id: Option<String>,
        /// Parent tool use ID
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    /// The backend asks the caller something
    ControlRequest {
        /// Correlation id chosen by the backend
        request_id: String,
        /// Request body, tagged by `subtype`
        request: serde_json::Value,
    },
    /// Answer to a control request the caller sent
    ControlResponse {
        /// Response body
        response: crate::protocol::ControlResponseBody,
    },
    /// The backend withdraws a control request it sent earlier
    ControlCancelRequest {
        /// Correlation id of the withdrawn request
        request_id: String,
    },
    /// Terminal signal of one turn
    Result {
        /// Result subtype
        #[serde(default)]
        subtype: String,
        /// Whether the turn ended in error
        #[serde(default)]
        is_error: bool,
        /// Final result text
        #[serde(default)]
        result: Option<String>,
        /// Backend session id
        #[serde(default)]
        session_id: Option<String>,
        /// Number of conversation turns
        #[serde(default)]
        num_turns: Option<u32>,
        /// Total duration in milliseconds
        #[serde(default)]
        duration_ms: Option<u64>,
        /// Total cost in USD
        #[serde(default)]
        total_cost_usd: Option<f64>,
        /// Token usage statistics
        #[serde(default)]
        usage: Option<serde_json::Value>,
    },
    /// Liveness line with no content
    KeepAlive,
}

impl WireMessage {
    /// Backend session id carried by this line, if any
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. }
            | Self::Assistant { session_id, .. }
            | Self::User { session_id, .. }
            | Self::StreamEvent { session_id, .. }
            | Self::Result { session_id, .. } => session_id.as_deref(),
            Self::ControlRequest { .. }
            | Self::ControlResponse { .. }
            | Self::ControlCancelRequest { .. }
            | Self::KeepAlive => None,
        }
    }
}

/// Parse a JSON value into a typed wire message
///
/// # Errors
/// Returns `RunnerError::MessageParse` if the value is not a known message shape
pub fn parse_message(data: serde_json::Value) -> Result<WireMessage> {
    serde_json::from_value(data.clone()).map_err(|e| {
        RunnerError::message_parse(format!("Failed to parse message: {e}"), Some(data))
    })
}
