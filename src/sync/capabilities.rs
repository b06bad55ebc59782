//! Runner capability flags
//!
//! Advertised to the controller in every `register` message.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// What this runner can do for the controller
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RunnerCapabilities: u8 {
        /// Hosts control-protocol sessions
        const PROTOCOL_SESSIONS = 0b0_0001;
        /// Hosts plain terminal sessions
        const TERMINAL_SESSIONS = 0b0_0010;
        /// Raises and applies approvals
        const APPROVALS = 0b0_0100;
        /// Resumes sessions from stored backend ids
        const RESUME = 0b0_1000;
        /// Interrupts in-flight turns
        const INTERRUPT = 0b1_0000;
    }
}

impl Default for RunnerCapabilities {
    fn default() -> Self {
        Self::all()
    }
}

// Serialized as named booleans so the controller need not know bit layout
impl Serialize for RunnerCapabilities {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("RunnerCapabilities", 5)?;
        state.serialize_field("protocolSessions", &self.contains(Self::PROTOCOL_SESSIONS))?;
        state.serialize_field("terminalSessions", &self.contains(Self::TERMINAL_SESSIONS))?;
        state.serialize_field("approvals", &self.contains(Self::APPROVALS))?;
        state.serialize_field("resume", &self.contains(Self::RESUME))?;
        state.serialize_field("interrupt", &self.contains(Self::INTERRUPT))?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for RunnerCapabilities {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        #[allow(clippy::struct_excessive_bools)]
        struct Helper {
            #[serde(default)]
            protocol_sessions: bool,
            #[serde(default)]
            terminal_sessions: bool,
            #[serde(default)]
            approvals: bool,
            #[serde(default)]
            resume: bool,
            #[serde(default)]
            interrupt: bool,
        }

        let h = Helper::deserialize(deserializer)?;
        let mut caps = Self::empty();
        caps.set(Self::PROTOCOL_SESSIONS, h.protocol_sessions);
        caps.set(Self::TERMINAL_SESSIONS, h.terminal_sessions);
        caps.set(Self::APPROVALS, h.approvals);
        caps.set(Self::RESUME, h.resume);
        caps.set(Self::INTERRUPT, h.interrupt);
        Ok(caps)
    }
}
