//! Inbound line demultiplexing
//!
//! [`Demux`] turns parsed wire lines into [`Dispatch`] items without doing
//! any I/O, so the reader task only has to act on its output.

use std::collections::HashSet;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::identifiers::RequestId;
use crate::types::messages::{
    ContentBlock, ContentBlockStart, ContentDelta, StreamEvent, UserContent, WireMessage,
};

use super::accumulator::{DeltaMode, MessageAccumulator};
use super::messages::{ControlResponseBody, InboundControlRequest};

/// Events a [`ProtocolClient`](super::ProtocolClient) reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// The backend can accept messages; fires once per client
    Ready {
        /// Backend session id, when known at that moment
        session_id: Option<String>,
    },
    /// The backend session id became known; fires once per client
    SessionId(String),
    /// A new assistant message started
    MessageStarted,
    /// Text of the current assistant message so far
    Text {
        /// Full message text accumulated so far
        text: String,
    },
    /// Thinking of the current assistant message so far
    Thinking {
        /// Full thinking text accumulated so far
        text: String,
    },
    /// The current assistant message finished
    MessageStopped,
    /// The agent invoked a tool
    ToolUse {
        /// Tool use id
        id: String,
        /// Tool name
        name: String,
        /// Parsed tool input
        input: serde_json::Value,
    },
    /// A tool produced output
    ToolResult {
        /// Tool use this result belongs to
        tool_use_id: String,
        /// Result content as sent by the backend
        content: serde_json::Value,
        /// Whether the tool failed
        is_error: bool,
    },
    /// The backend asks for a decision or an external answer
    ControlRequest {
        /// Id to answer with [`respond`](super::ProtocolClient::respond)
        request_id: RequestId,
        /// Request body
        request: InboundControlRequest,
    },
    /// The backend withdrew an unanswered control request
    ControlCancelled {
        /// Withdrawn request id
        request_id: RequestId,
    },
    /// Token usage update
    Usage(serde_json::Value),
    /// The turn ended
    TurnComplete {
        /// Whether the turn ended in error
        is_error: bool,
        /// Final result text
        result: Option<String>,
        /// Turn statistics (cost, duration, usage)
        metadata: serde_json::Value,
    },
    /// The backend process exited
    Exited {
        /// Exit code, when the process exited normally
        code: Option<i32>,
    },
}

/// What the reader task must do with one demultiplexed item
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Forward to the event channel
    Event(ProtocolEvent),
    /// Settle an outbound correlation
    Response(ControlResponseBody),
    /// Track, forward and possibly arm a fallback for an inbound request
    Inbound {
        /// Backend-chosen id
        request_id: RequestId,
        /// Request body
        request: InboundControlRequest,
    },
    /// Drop an inbound request the backend no longer wants answered
    Cancel(RequestId),
}

/// One-shot ready signal shared by the reader and the fallback timer
#[derive(Debug, Default)]
pub struct ReadyLatch {
    fired: AtomicBool,
}

impl ReadyLatch {
    /// Create an unfired latch
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Fire the latch; only the first call returns `true`
    pub fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    /// Whether the latch has fired
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Stateful demultiplexer for one backend stream
#[derive(Debug)]
pub struct Demux {
    accumulator: MessageAccumulator,
    emitted_tools: HashSet<String>,
    latch: std::sync::Arc<ReadyLatch>,
    session_id: std::sync::Arc<OnceLock<String>>,
}

impl Demux {
    /// Create a demultiplexer sharing `latch` and `session_id` with its client
    #[must_use]
    pub fn new(
        mode: DeltaMode,
        latch: std::sync::Arc<ReadyLatch>,
        session_id: std::sync::Arc<OnceLock<String>>,
    ) -> Self {
        Self {
            accumulator: MessageAccumulator::new(mode),
            emitted_tools: HashSet::new(),
            latch,
            session_id,
        }
    }

    /// Demultiplex one parsed line
    pub fn handle(&mut self, message: WireMessage) -> Vec<Dispatch> {
        let mut out = Vec::new();

        let is_init = matches!(&message, WireMessage::System { subtype, .. } if subtype == "init");
        if let Some(id) = message.session_id() {
            self.capture_session_id(id, &mut out);
        }
        if (is_init || self.session_id.get().is_some()) && self.latch.fire() {
            out.push(Dispatch::Event(ProtocolEvent::Ready {
                session_id: self.session_id.get().cloned(),
            }));
        }

        match message {
            WireMessage::System { subtype, .. } => {
                log::debug!("system message: {subtype}");
            }
            WireMessage::StreamEvent { event, .. } => self.handle_stream_event(event, &mut out),
            WireMessage::Assistant { message, .. } => {
                let text = message.text();
                if !self.accumulator.streamed_text() && !text.is_empty() {
                    out.push(Dispatch::Event(ProtocolEvent::Text { text }));
                }
                for block in message.content {
                    if let ContentBlock::ToolUse { id, name, input } = block
                        && self.emitted_tools.insert(id.clone())
                    {
                        out.push(Dispatch::Event(ProtocolEvent::ToolUse { id, name, input }));
                    }
                }
            }
            WireMessage::User { message, .. } => {
                if let Some(UserContent::Blocks(blocks)) = message.content {
                    for block in blocks {
                        if let ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } = block
                        {
                            out.push(Dispatch::Event(ProtocolEvent::ToolResult {
                                tool_use_id,
                                content: serde_json::to_value(content)
                                    .unwrap_or(serde_json::Value::Null),
                                is_error: is_error.unwrap_or(false),
                            }));
                        }
                    }
                }
            }
            WireMessage::ControlRequest {
                request_id,
                request,
            } => out.push(Dispatch::Inbound {
                request_id: RequestId::new(request_id),
                request: InboundControlRequest::from_value(request),
            }),
            WireMessage::ControlResponse { response } => out.push(Dispatch::Response(response)),
            WireMessage::ControlCancelRequest { request_id } => {
                out.push(Dispatch::Cancel(RequestId::new(request_id)));
            }
            WireMessage::Result {
                subtype,
                is_error,
                result,
                num_turns,
                duration_ms,
                total_cost_usd,
                usage,
                ..
            } => {
                self.emitted_tools.clear();
                out.push(Dispatch::Event(ProtocolEvent::TurnComplete {
                    is_error,
                    result,
                    metadata: serde_json::json!({
                        "subtype": subtype,
                        "numTurns": num_turns,
                        "durationMs": duration_ms,
                        "totalCostUsd": total_cost_usd,
                        "usage": usage,
                    }),
                }));
            }
            WireMessage::KeepAlive => {}
        }

        out
    }

    fn capture_session_id(&self, id: &str, out: &mut Vec<Dispatch>) {
        if self.session_id.get().is_none() && self.session_id.set(id.to_string()).is_ok() {
            out.push(Dispatch::Event(ProtocolEvent::SessionId(id.to_string())));
        }
    }

    fn handle_stream_event(&mut self, event: StreamEvent, out: &mut Vec<Dispatch>) {
        match event {
            StreamEvent::MessageStart { .. } => {
                self.accumulator.reset();
                out.push(Dispatch::Event(ProtocolEvent::MessageStarted));
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlockStart::ToolUse { id, name },
            } => self.accumulator.start_tool(index, id, name),
            StreamEvent::ContentBlockStart { .. } => {}
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta { text } => {
                    let text = self.accumulator.push_text(&text).to_string();
                    out.push(Dispatch::Event(ProtocolEvent::Text { text }));
                }
                ContentDelta::ThinkingDelta { thinking } => {
                    let text = self.accumulator.push_thinking(&thinking).to_string();
                    out.push(Dispatch::Event(ProtocolEvent::Thinking { text }));
                }
                ContentDelta::InputJsonDelta { partial_json } => {
                    self.accumulator.push_tool_json(index, &partial_json);
                }
                ContentDelta::Other => {}
            },
            StreamEvent::ContentBlockStop { index } => {
                if let Some(tool) = self.accumulator.finish_block(index)
                    && self.emitted_tools.insert(tool.id.clone())
                {
                    out.push(Dispatch::Event(ProtocolEvent::ToolUse {
                        id: tool.id,
                        name: tool.name,
                        input: tool.input,
                    }));
                }
            }
            StreamEvent::MessageDelta { usage, .. } => {
                if let Some(usage) = usage {
                    out.push(Dispatch::Event(ProtocolEvent::Usage(usage)));
                }
            }
            StreamEvent::MessageStop => out.push(Dispatch::Event(ProtocolEvent::MessageStopped)),
            StreamEvent::Other => {}
        }
    }
}
