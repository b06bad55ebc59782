//! Permission-related type definitions
//!
//! Two vocabularies meet here. The controller speaks in decisions
//! (`approve`, `deny`, `delegate`); backends speak in behaviors (`allow`,
//! `deny`). [`wire_behavior`] is the only place one becomes the other.

use serde::{Deserialize, Serialize};

// ============================================================================
// Permission Types
// ============================================================================

/// Permission modes for tool execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Default mode - backend prompts for dangerous tools
    Default,
    /// Auto-accept file edits
    AcceptEdits,
    /// Plan mode
    Plan,
    /// Allow all tools (use with caution)
    BypassPermissions,
}

impl PermissionMode {
    /// Wire spelling used on the command line and in control requests
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

/// Permission behavior understood by backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    /// Allow the action
    Allow,
    /// Deny the action
    Deny,
}

/// Decision vocabulary used by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerDecision {
    /// The human approved the action
    Approve,
    /// The human refused the action
    Deny,
    /// The human handed the decision back to the agent, usually with guidance
    Delegate,
}

/// Map a controller decision onto the backend wire behavior
///
/// `Delegate` carries no grant, so the backend sees a denial and the
/// accompanying message tells the agent how to proceed.
///
/// # Examples
/// ```
/// use runner_agent::types::{wire_behavior, ControllerDecision, PermissionBehavior};
///
/// assert_eq!(wire_behavior(ControllerDecision::Approve), PermissionBehavior::Allow);
/// assert_eq!(wire_behavior(ControllerDecision::Deny), PermissionBehavior::Deny);
/// assert_eq!(wire_behavior(ControllerDecision::Delegate), PermissionBehavior::Deny);
/// ```
#[must_use]
pub const fn wire_behavior(decision: ControllerDecision) -> PermissionBehavior {
    match decision {
        ControllerDecision::Approve => PermissionBehavior::Allow,
        ControllerDecision::Deny | ControllerDecision::Delegate => PermissionBehavior::Deny,
    }
}

/// Permission update destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionUpdateDestination {
    /// Save to user settings
    UserSettings,
    /// Save to project settings
    ProjectSettings,
    /// Save to local settings
    LocalSettings,
    /// Save to session only (temporary)
    Session,
}

/// Permission rule value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRuleValue {
    /// Name of the tool
    pub tool_name: String,
    /// Optional rule content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_content: Option<String>,
}

/// Permission update suggested by a backend and echoed back on "allow for session"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PermissionUpdate {
    /// Add permission rules
    AddRules {
        /// Rules to add
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rules: Option<Vec<PermissionRuleValue>>,
        /// Rule behavior
        #[serde(default, skip_serializing_if = "Option::is_none")]
        behavior: Option<PermissionBehavior>,
        /// Where to save the rules
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionUpdateDestination>,
    },
    /// Set permission mode
    SetMode {
        /// New permission mode
        mode: PermissionMode,
        /// Where to save the mode
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionUpdateDestination>,
    },
    /// Add directories to allowed list
    AddDirectories {
        /// Directories to add
        #[serde(default, skip_serializing_if = "Option::is_none")]
        directories: Option<Vec<String>>,
        /// Where to save
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<PermissionUpdateDestination>,
    },
}

/// Reply body for a `can_use_tool` control request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionResult {
    /// Allow the tool use
    Allow {
        /// Tool input to run with; backends require it even when unchanged
        #[serde(rename = "updatedInput")]
        updated_input: serde_json::Value,
        /// Permission updates to apply
        #[serde(
            rename = "updatedPermissions",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        updated_permissions: Option<Vec<PermissionUpdate>>,
    },
    /// Deny the tool use
    Deny {
        /// Reason shown to the agent
        message: String,
        /// Whether to interrupt the conversation
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        interrupt: bool,
    },
}

impl PermissionResult {
    /// Build a reply from a controller decision
    #[must_use]
    pub fn from_decision(
        decision: ControllerDecision,
        input: serde_json::Value,
        message: Option<String>,
        updated_permissions: Option<Vec<PermissionUpdate>>,
    ) -> Self {
        match wire_behavior(decision) {
            PermissionBehavior::Allow => Self::Allow {
                updated_input: input,
                updated_permissions,
            },
            PermissionBehavior::Deny => Self::Deny {
                message: message.unwrap_or_else(|| match decision {
                    ControllerDecision::Delegate => {
                        "The user delegated this decision back to you".to_string()
                    }
                    _ => "The user denied this action".to_string(),
                }),
                interrupt: false,
            },
        }
    }

    /// Wire behavior of this reply
    #[must_use]
    pub const fn behavior(&self) -> PermissionBehavior {
        match self {
            Self::Allow { .. } => PermissionBehavior::Allow,
            Self::Deny { .. } => PermissionBehavior::Deny,
        }
    }
}
