//! Newtype wrappers for type safety
//!
//! Session ids, request ids, runner ids and tool names all travel as plain
//! strings on the wire. Wrapping them keeps a request id from being passed
//! where a session id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Newtype Wrappers for Type Safety
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a string identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the identifier as a string slice
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// External session id assigned by the controller
    SessionId
);

string_id!(
    /// Correlation id for control requests and approval prompts
    RequestId
);

string_id!(
    /// Identity of a runner agent process connected to the controller
    RunnerId
);

string_id!(
    /// Tool name newtype
    ToolName
);

impl SessionId {
    /// Generate a fresh random session id
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
