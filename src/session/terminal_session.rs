//! Session actor for plain interactive backends
//!
//! The backend is a child process whose stdout is raw text. A turn ends when
//! output goes quiet. Numbered choice menus at the end of the output are
//! raised as approvals and answered by writing the chosen number.

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::Transport;
use crate::error::{Result, RunnerError};
use crate::transport::{OutputFraming, ProcessSpec, ReadEvent, SubprocessTransport};
use crate::types::approval::ApprovalPrompt;
use crate::types::identifiers::{RequestId, SessionId, ToolName};
use crate::types::session::{BackendKind, SessionEnvelope, SessionEvent, SessionStatus};

use super::commands::SessionCommand;
use super::queue::MessageQueue;
use super::throttle::{OutputThrottler, ThrottleMode};
use super::{SessionConfig, SessionHandle, SessionReporter};

/// Pseudo tool name used for menus detected in terminal output
pub const TERMINAL_PROMPT_TOOL: &str = "TerminalPrompt";

/// Output kept for menu detection
const TAIL_LIMIT: usize = 8 * 1024;

/// Session backed by an interactive process without a control protocol
#[derive(Debug, Clone)]
pub struct TerminalSession {
    handle: SessionHandle,
}

impl TerminalSession {
    /// Spawn the backend and its session actor
    ///
    /// # Errors
    /// Returns error if the backend cannot be spawned
    pub async fn spawn(
        session_id: SessionId,
        spec: ProcessSpec,
        config: SessionConfig,
        event_tx: mpsc::UnboundedSender<SessionEnvelope>,
    ) -> Result<Self> {
        let mut transport = SubprocessTransport::new(spec);
        transport.connect().await?;
        let output = transport.read_output(OutputFraming::Chunks);

        let (reporter, state_rx) = SessionReporter::new(session_id.clone(), event_tx);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let ready_at = Some(Instant::now() + config.quiet_period);
        let actor = TerminalActor {
            transport,
            reporter,
            config,
            queue: MessageQueue::new(),
            throttler: OutputThrottler::new(ThrottleMode::Append),
            tail: String::new(),
            prompt: None,
            last_prompt: None,
            flush_at: None,
            quiet_at: None,
            ready_at,
        };
        tokio::spawn(actor.run(command_rx, output));

        Ok(Self {
            handle: SessionHandle::new(session_id, BackendKind::Terminal, command_tx, state_rx),
        })
    }

    /// Caller-side handle
    #[must_use]
    pub const fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

super::delegate_agent_session!(TerminalSession);

/// A numbered menu found at the end of terminal output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPrompt {
    /// Line above the menu
    pub question: String,
    /// Option labels in menu order
    pub options: Vec<String>,
}

/// Find a numbered menu (`1. Yes`, `2) No`, `❯ 1. Yes` …) at the end of `output`
///
/// At least two consecutive options numbered from 1 are required. Up to
/// three trailing hint lines below the menu are tolerated.
///
/// # Examples
/// ```
/// use runner_agent::session::detect_prompt;
///
/// let output = "Do you want to proceed?\n❯ 1. Yes\n  2. No\n";
/// let prompt = detect_prompt(output).unwrap();
/// assert_eq!(prompt.question, "Do you want to proceed?");
/// assert_eq!(prompt.options, vec!["Yes", "No"]);
/// ```
#[must_use]
pub fn detect_prompt(output: &str) -> Option<DetectedPrompt> {
    let clean = strip_ansi(output);
    let lines: Vec<&str> = clean
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();

    let mut end = lines.len();
    let mut skipped = 0;
    while end > 0 && parse_option(lines[end - 1]).is_none() {
        skipped += 1;
        if skipped > 3 {
            return None;
        }
        end -= 1;
    }

    let mut start = end;
    while start > 0 && parse_option(lines[start - 1]).is_some() {
        start -= 1;
    }

    let numbered: Vec<(usize, String)> = lines[start..end]
        .iter()
        .filter_map(|line| parse_option(line))
        .collect();
    if numbered.len() < 2 || numbered.iter().enumerate().any(|(i, (n, _))| *n != i + 1) {
        return None;
    }

    let question = start
        .checked_sub(1)
        .map(|i| lines[i].trim().to_string())
        .unwrap_or_default();

    Some(DetectedPrompt {
        question,
        options: numbered.into_iter().map(|(_, label)| label).collect(),
    })
}

fn parse_option(line: &str) -> Option<(usize, String)> {
    let rest = line
        .trim_start()
        .trim_start_matches(['❯', '>', '›', '*'])
        .trim_start();
    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let number = rest[..digits].parse().ok()?;
    let rest = rest[digits..].strip_prefix(['.', ')'])?;
    if !rest.starts_with(' ') {
        return None;
    }
    let label = rest.trim();
    (!label.is_empty()).then(|| (number, label.to_string()))
}

/// Remove ANSI escape sequences and carriage returns
fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => match chars.next() {
                Some('[') => {
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    while let Some(c) = chars.next() {
                        if c == '\u{7}' {
                            break;
                        }
                        if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            },
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

struct TerminalActor {
    transport: SubprocessTransport,
    reporter: SessionReporter,
    config: SessionConfig,
    queue: MessageQueue,
    throttler: OutputThrottler,
    tail: String,
    prompt: Option<ApprovalPrompt>,
    last_prompt: Option<DetectedPrompt>,
    flush_at: Option<Instant>,
    quiet_at: Option<Instant>,
    ready_at: Option<Instant>,
}

impl TerminalActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut output: mpsc::UnboundedReceiver<ReadEvent>,
    ) {
        loop {
            let flush_at = self.flush_at;
            let quiet_at = self.quiet_at;
            let ready_at = self.ready_at;
            let settle_at = self.queue.settle_deadline();

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        if let Err(e) = self.close().await {
                            log::warn!("[{}] close on drop failed: {e}", self.label());
                        }
                        break;
                    };
                    if self.handle_command(command).await {
                        break;
                    }
                }
                item = output.recv() => {
                    match item {
                        Some(ReadEvent::Chunk(chunk)) => self.on_output(&chunk),
                        Some(ReadEvent::Line(line)) => self.on_output(&format!("{line}\n")),
                        Some(ReadEvent::Exited { code }) => {
                            self.go_offline(code);
                            break;
                        }
                        None => {
                            self.go_offline(None);
                            break;
                        }
                    }
                }
                () = tokio::time::sleep_until(ready_at.unwrap_or_else(Instant::now)), if ready_at.is_some() => {
                    self.mark_ready().await;
                }
                () = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    self.flush_at = None;
                    if let Some(flush) = self.throttler.flush() {
                        self.reporter.emit(SessionEvent::Output(flush));
                    }
                }
                () = tokio::time::sleep_until(quiet_at.unwrap_or_else(Instant::now)), if quiet_at.is_some() => {
                    self.quiet_at = None;
                    self.on_quiet().await;
                }
                () = tokio::time::sleep_until(settle_at.unwrap_or_else(Instant::now)), if settle_at.is_some() => {
                    self.queue.end_settle();
                    self.drain().await;
                }
            }
        }
    }

    fn label(&self) -> &str {
        self.reporter.session_id.as_str()
    }

    async fn mark_ready(&mut self) {
        if self.ready_at.take().is_some() {
            self.reporter.set_ready(None);
            self.drain().await;
        }
    }

    /// Returns `true` when the actor should stop
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::SendMessage { text, response_tx } => {
                if self.reporter.status() == SessionStatus::Offline {
                    let _ = response_tx.send(Err(RunnerError::session_closed(self.label())));
                    return false;
                }
                self.queue.push(text);
                let _ = response_tx.send(Ok(()));
                self.drain().await;
                false
            }
            SessionCommand::SendApproval {
                option_number,
                message,
                request_id,
                response_tx,
            } => {
                let result = self.answer(option_number, message, request_id).await;
                let _ = response_tx.send(result);
                false
            }
            SessionCommand::ExpireApproval {
                request_id,
                reason,
                response_tx,
            } => {
                let result = self.expire(&request_id, &reason);
                let _ = response_tx.send(result);
                false
            }
            SessionCommand::Interrupt { response_tx } => {
                let result = self.interrupt().await;
                let _ = response_tx.send(result);
                false
            }
            SessionCommand::Close { response_tx } => {
                let result = self.close().await;
                let _ = response_tx.send(result);
                true
            }
        }
    }

    fn on_output(&mut self, chunk: &str) {
        if self.ready_at.is_some() {
            // First output means the backend is up; drain happens on the next tick
            self.ready_at = Some(Instant::now());
        }

        self.throttler.push(chunk);
        if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.config.flush_interval);
        }

        self.tail.push_str(chunk);
        if self.tail.len() > TAIL_LIMIT {
            let mut cut = self.tail.len() - TAIL_LIMIT;
            while !self.tail.is_char_boundary(cut) {
                cut += 1;
            }
            self.tail.drain(..cut);
        }

        if self.queue.is_in_flight() {
            self.quiet_at = Some(Instant::now() + self.config.quiet_period);
        }

        if self.prompt.is_none()
            && let Some(detected) = detect_prompt(&self.tail)
            && self.last_prompt.as_ref() != Some(&detected)
        {
            self.raise(detected);
        }
    }

    fn raise(&mut self, detected: DetectedPrompt) {
        let millis = chrono::Utc::now().timestamp_millis();
        let prompt = ApprovalPrompt {
            request_id: RequestId::new(format!("{}-{millis}", self.label())),
            tool_name: ToolName::new(TERMINAL_PROMPT_TOOL),
            input: serde_json::json!({ "question": detected.question }),
            options: detected.options.clone(),
            is_multi_select: false,
            has_other: true,
        };
        self.last_prompt = Some(detected);
        self.prompt = Some(prompt.clone());
        self.quiet_at = None;
        self.reporter.emit(SessionEvent::ApprovalRequested(prompt));
        self.reporter.set_status(SessionStatus::Waiting);
    }

    async fn answer(
        &mut self,
        option_number: usize,
        message: Option<String>,
        request_id: Option<RequestId>,
    ) -> Result<()> {
        let matches = match (&self.prompt, &request_id) {
            (Some(prompt), Some(id)) => &prompt.request_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let prompt = match self.prompt.take() {
            Some(prompt) if matches => prompt,
            other => {
                self.prompt = other;
                return Err(RunnerError::approval_not_found(
                    request_id.map_or_else(|| "<none outstanding>".to_string(), |id| id.to_string()),
                ));
            }
        };

        let input = if (1..=prompt.options.len()).contains(&option_number) {
            option_number.to_string()
        } else {
            message.unwrap_or_default()
        };
        self.tail.clear();
        self.reporter.emit(SessionEvent::ApprovalCleared {
            request_id: prompt.request_id,
        });
        self.transport.write_line(&input).await?;

        if self.queue.is_in_flight() {
            self.quiet_at = Some(Instant::now() + self.config.quiet_period);
            self.reporter.set_status(SessionStatus::Working);
        } else {
            self.reporter.set_status(SessionStatus::Idle);
        }
        Ok(())
    }

    /// Withdraw a timed-out menu; the backend keeps waiting on its own prompt
    fn expire(&mut self, request_id: &RequestId, reason: &str) -> Result<()> {
        if self.prompt.as_ref().map(|p| &p.request_id) != Some(request_id) {
            return Err(RunnerError::approval_not_found(request_id.as_str()));
        }
        log::info!("[{}] prompt {request_id} withdrawn: {reason}", self.label());
        self.clear_prompt();
        if self.queue.is_in_flight() {
            self.quiet_at = Some(Instant::now() + self.config.quiet_period);
            self.reporter.set_status(SessionStatus::Working);
        } else {
            self.reporter.set_status(SessionStatus::Idle);
        }
        Ok(())
    }

    async fn on_quiet(&mut self) {
        if self.prompt.is_some() || !self.queue.is_in_flight() {
            return;
        }
        self.finish_output();
        self.queue.complete_turn();
        self.reporter.emit(SessionEvent::TurnCompleted {
            is_error: false,
            result: None,
        });
        self.reporter.set_status(SessionStatus::Idle);
        self.drain().await;
    }

    async fn drain(&mut self) {
        if self.ready_at.is_some() || self.reporter.status() == SessionStatus::Offline {
            return;
        }
        while let Some(text) = self.queue.take_next(Instant::now()) {
            // Output printed between turns belongs to no turn
            self.finish_output();
            self.reporter
                .emit(SessionEvent::TurnStarted { text: text.clone() });
            self.reporter.set_status(SessionStatus::Working);
            self.tail.clear();
            self.last_prompt = None;
            match self.transport.write_line(&text).await {
                Ok(()) => {
                    self.quiet_at = Some(Instant::now() + self.config.quiet_period);
                    break;
                }
                Err(e) => {
                    log::warn!("[{}] failed to send message: {e}", self.label());
                    self.reporter
                        .emit(SessionEvent::Error(format!("Failed to send message: {e}")));
                    self.queue.complete_turn();
                    self.reporter.set_status(SessionStatus::Idle);
                }
            }
        }
    }

    fn finish_output(&mut self) {
        self.flush_at = None;
        if let Some(flush) = self.throttler.finish() {
            self.reporter.emit(SessionEvent::Output(flush));
        }
    }

    fn clear_prompt(&mut self) {
        if let Some(prompt) = self.prompt.take() {
            self.reporter.emit(SessionEvent::ApprovalCleared {
                request_id: prompt.request_id,
            });
        }
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.clear_prompt();
        let sequence = self.config.interrupt_sequence.clone();
        let result = self.transport.write(&sequence).await;
        if let Err(ref e) = result {
            log::warn!("[{}] failed to write interrupt: {e}", self.label());
        }
        self.queue
            .abort_turn(Instant::now() + self.config.interrupt_settle);
        self.quiet_at = None;
        self.finish_output();
        self.reporter.set_status(SessionStatus::Idle);
        result
    }

    async fn close(&mut self) -> Result<()> {
        self.clear_prompt();
        self.finish_output();
        let result = self.transport.close().await;
        self.reporter.set_status(SessionStatus::Offline);
        self.reporter.emit(SessionEvent::Exited { code: None });
        result
    }

    fn go_offline(&mut self, code: Option<i32>) {
        self.clear_prompt();
        self.finish_output();
        self.reporter.set_status(SessionStatus::Offline);
        self.reporter.emit(SessionEvent::Exited { code });
    }
}
