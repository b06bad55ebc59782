//! Control protocol message types
//!
//! Control requests and responses travel on the same line stream as content
//! events. Requests carry an opaque `request_id`; responses quote it back.

use serde::{Deserialize, Serialize};

use crate::types::identifiers::RequestId;
use crate::types::messages::{UserContent, UserMessageContent};
use crate::types::permissions::{PermissionMode, PermissionUpdate};

// ============================================================================
// Outbound
// ============================================================================

/// Control request sent from this process to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Announce the caller and optional hook registrations
    Initialize {
        /// Hook configuration, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hooks: Option<serde_json::Value>,
    },
    /// Abort the in-flight turn
    Interrupt,
    /// Change how tool permissions are decided
    SetPermissionMode {
        /// New mode
        mode: PermissionMode,
    },
    /// Switch model; `None` restores the default
    SetModel {
        /// Model name
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Cap extended thinking
    SetMaxThinkingTokens {
        /// Token budget
        max_thinking_tokens: u32,
    },
}

impl ControlRequest {
    /// Wire subtype of this request
    #[must_use]
    pub const fn subtype(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::Interrupt => "interrupt",
            Self::SetPermissionMode { .. } => "set_permission_mode",
            Self::SetModel { .. } => "set_model",
            Self::SetMaxThinkingTokens { .. } => "set_max_thinking_tokens",
        }
    }
}

/// Body of a `control_response` line, in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponseBody {
    /// The request succeeded
    Success {
        /// Correlation id being answered
        request_id: String,
        /// Response payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<serde_json::Value>,
    },
    /// The request failed
    Error {
        /// Correlation id being answered
        request_id: String,
        /// Error description
        error: String,
    },
}

impl ControlResponseBody {
    /// Correlation id being answered
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::Success { request_id, .. } | Self::Error { request_id, .. } => request_id,
        }
    }
}

/// Every line this process writes to a protocol backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A new user turn
    User {
        /// Message content
        message: UserMessageContent,
        /// Parent tool use id, always absent for top-level turns
        parent_tool_use_id: Option<String>,
        /// Backend session id, `default` until one is known
        session_id: String,
    },
    /// A control request expecting a `control_response`
    ControlRequest {
        /// Correlation id
        request_id: RequestId,
        /// Request body
        request: ControlRequest,
    },
    /// Answer to a control request the backend sent
    ControlResponse {
        /// Response body
        response: ControlResponseBody,
    },
}

impl OutboundMessage {
    /// Frame a user turn
    #[must_use]
    pub fn user(text: impl Into<String>, session_id: Option<&str>) -> Self {
        Self::User {
            message: UserMessageContent {
                role: "user".to_string(),
                content: Some(UserContent::String(text.into())),
            },
            parent_tool_use_id: None,
            session_id: session_id.unwrap_or("default").to_string(),
        }
    }

    /// Serialize to one newline-terminated line
    ///
    /// # Errors
    /// Returns error if JSON serialization fails
    pub fn to_line(&self) -> crate::error::Result<String> {
        Ok(format!("{}\n", serde_json::to_string(self)?))
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Control request the backend sends to this process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum InboundControlRequest {
    /// Ask whether a tool may run
    CanUseTool {
        /// Tool name
        tool_name: String,
        /// Tool input
        #[serde(default)]
        input: serde_json::Value,
        /// Rule updates the backend proposes for "allow for session"
        #[serde(default)]
        permission_suggestions: Vec<serde_json::Value>,
        /// Path that triggered the prompt, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocked_path: Option<String>,
        /// Tool use id, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
    },
    /// Invoke a registered hook
    HookCallback {
        /// Hook callback id
        callback_id: String,
        /// Hook input
        #[serde(default)]
        input: serde_json::Value,
        /// Tool use id, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
    },
    /// JSON-RPC message for an in-process MCP server
    McpMessage {
        /// Target server
        server_name: String,
        /// JSON-RPC payload
        message: serde_json::Value,
    },
    /// Subtypes this crate does not answer
    #[serde(other)]
    Other,
}

impl InboundControlRequest {
    /// Parse a raw `request` object; unknown shapes become [`Self::Other`]
    #[must_use]
    pub fn from_value(value: serde_json::Value) -> Self {
        serde_json::from_value(value).unwrap_or_else(|e| {
            log::warn!("Unrecognized control request body: {e}");
            Self::Other
        })
    }

    /// Whether an external responder must answer, bounded by a fallback timer
    #[must_use]
    pub const fn needs_external_responder(&self) -> bool {
        matches!(self, Self::HookCallback { .. } | Self::McpMessage { .. })
    }

    /// Reply sent when nobody answers in time
    #[must_use]
    pub fn fallback_reply(&self, request_id: &RequestId) -> ControlResponseBody {
        let request_id = request_id.to_string();
        match self {
            Self::CanUseTool { .. } => ControlResponseBody::Success {
                request_id,
                response: Some(serde_json::json!({
                    "behavior": "deny",
                    "message": "No decision was made for this tool use",
                })),
            },
            Self::HookCallback { .. } => ControlResponseBody::Success {
                request_id,
                response: Some(serde_json::json!({ "continue": true })),
            },
            Self::McpMessage { message, .. } => ControlResponseBody::Success {
                request_id,
                response: Some(serde_json::json!({
                    "mcp_response": {
                        "jsonrpc": "2.0",
                        "id": message.get("id").cloned().unwrap_or(serde_json::Value::Null),
                        "error": {
                            "code": -32601,
                            "message": "No MCP server responded",
                        },
                    },
                })),
            },
            Self::Other => ControlResponseBody::Error {
                request_id,
                error: "Unsupported control request".to_string(),
            },
        }
    }

    /// Permission suggestions that parse as known updates
    #[must_use]
    pub fn permission_updates(&self) -> Vec<PermissionUpdate> {
        match self {
            Self::CanUseTool {
                permission_suggestions,
                ..
            } => permission_suggestions
                .iter()
                .filter_map(|value| match serde_json::from_value(value.clone()) {
                    Ok(update) => Some(update),
                    Err(e) => {
                        log::debug!("Skipping permission suggestion {value}: {e}");
                        None
                    }
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}
