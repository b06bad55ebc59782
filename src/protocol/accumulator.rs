//! Per-message accumulation of streamed content
//!
//! Text and thinking deltas build up per assistant message and reset at
//! `message_start`. Tool input arrives as JSON fragments per content block
//! and is parsed once when the block stops.

use std::collections::HashMap;

/// How a backend's text deltas relate to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaMode {
    /// Each delta is a new fragment to concatenate
    #[default]
    Append,
    /// Each delta is the full text so far
    Replace,
}

impl std::str::FromStr for DeltaMode {
    type Err = crate::error::RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "replace" => Ok(Self::Replace),
            other => Err(crate::error::RunnerError::invalid_config(format!(
                "unknown delta mode '{other}', expected append or replace"
            ))),
        }
    }
}

/// A tool invocation whose input has been fully received
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedToolUse {
    /// Tool use id
    pub id: String,
    /// Tool name
    pub name: String,
    /// Parsed input; `{}` when the fragments were not valid JSON
    pub input: serde_json::Value,
}

#[derive(Debug)]
struct ToolInputBuffer {
    id: String,
    name: String,
    json: String,
}

/// Accumulation state for the assistant message currently streaming
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    mode: DeltaMode,
    text: String,
    thinking: String,
    tools: HashMap<usize, ToolInputBuffer>,
    streamed_text: bool,
}

impl MessageAccumulator {
    /// Create an accumulator for `mode`
    #[must_use]
    pub fn new(mode: DeltaMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Forget everything from the previous message
    pub fn reset(&mut self) {
        self.text.clear();
        self.thinking.clear();
        self.tools.clear();
        self.streamed_text = false;
    }

    /// Apply a text delta and return the message text so far
    pub fn push_text(&mut self, delta: &str) -> &str {
        self.streamed_text = true;
        Self::apply(self.mode, &mut self.text, delta);
        &self.text
    }

    /// Apply a thinking delta and return the thinking text so far
    pub fn push_thinking(&mut self, delta: &str) -> &str {
        Self::apply(self.mode, &mut self.thinking, delta);
        &self.thinking
    }

    /// Begin buffering tool input for block `index`
    pub fn start_tool(&mut self, index: usize, id: String, name: String) {
        self.tools.insert(
            index,
            ToolInputBuffer {
                id,
                name,
                json: String::new(),
            },
        );
    }

    /// Append a partial JSON fragment for block `index`
    pub fn push_tool_json(&mut self, index: usize, fragment: &str) {
        match self.tools.get_mut(&index) {
            Some(buffer) => buffer.json.push_str(fragment),
            None => log::debug!("Tool input fragment for unknown block {index}"),
        }
    }

    /// Close block `index`, returning the tool use if it was one
    pub fn finish_block(&mut self, index: usize) -> Option<CompletedToolUse> {
        let buffer = self.tools.remove(&index)?;
        let input = if buffer.json.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&buffer.json).unwrap_or_else(|e| {
                log::warn!(
                    "Invalid tool input JSON for {} ({}): {e}",
                    buffer.name,
                    buffer.id
                );
                serde_json::json!({})
            })
        };
        Some(CompletedToolUse {
            id: buffer.id,
            name: buffer.name,
            input,
        })
    }

    /// Text accumulated for the current message
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether any text delta arrived since the last reset
    #[must_use]
    pub const fn streamed_text(&self) -> bool {
        self.streamed_text
    }

    fn apply(mode: DeltaMode, target: &mut String, delta: &str) {
        match mode {
            DeltaMode::Append => target.push_str(delta),
            DeltaMode::Replace => {
                target.clear();
                target.push_str(delta);
            }
        }
    }
}
