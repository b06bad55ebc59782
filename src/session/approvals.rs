//! Approval bridging for protocol backends
//!
//! Tool-permission requests and multi-question prompts both arrive as
//! `can_use_tool` control requests. [`ApprovalBridge`] turns them into
//! normalized [`ApprovalPrompt`]s and turns numbered answers back into
//! permission replies. It performs no I/O; callers act on [`BridgeAction`]s.

use std::collections::VecDeque;

use crate::error::{Result, RunnerError};
use crate::protocol::InboundControlRequest;
use crate::types::approval::ApprovalPrompt;
use crate::types::identifiers::{RequestId, ToolName};
use crate::types::permissions::{ControllerDecision, PermissionResult, PermissionUpdate};

/// Tool whose input carries questions rather than an action
pub const QUESTION_TOOL: &str = "AskUserQuestion";

/// Options offered for an ordinary tool-permission prompt
pub const TOOL_OPTIONS: [&str; 3] = ["Allow", "Allow for this session", "Deny"];

/// Side effect requested by the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeAction {
    /// Present a prompt to the controller
    Raise(ApprovalPrompt),
    /// Withdraw a prompt from the controller
    Clear(RequestId),
    /// Answer the backend's control request
    Reply {
        /// Control request being answered
        control_id: RequestId,
        /// Permission reply
        result: PermissionResult,
    },
}

#[derive(Debug)]
struct Question {
    text: String,
    header: Option<String>,
    options: Vec<String>,
    multi_select: bool,
}

#[derive(Debug)]
enum PromptKind {
    Tool {
        suggestions: Vec<PermissionUpdate>,
    },
    Questions {
        questions: Vec<Question>,
        answers: serde_json::Map<String, serde_json::Value>,
        current: usize,
    },
}

#[derive(Debug)]
struct Outstanding {
    control_id: RequestId,
    prompt: ApprovalPrompt,
    input: serde_json::Value,
    kind: PromptKind,
}

/// Outstanding approvals of one session, oldest first
#[derive(Debug, Default)]
pub struct ApprovalBridge {
    outstanding: VecDeque<Outstanding>,
}

impl ApprovalBridge {
    /// Create an empty bridge
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of prompts awaiting a decision
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Prompts currently shown to the controller
    #[must_use]
    pub fn prompts(&self) -> Vec<ApprovalPrompt> {
        self.outstanding.iter().map(|o| o.prompt.clone()).collect()
    }

    /// Accept a `can_use_tool` request
    ///
    /// Other request kinds produce no actions.
    pub fn on_request(
        &mut self,
        control_id: RequestId,
        request: &InboundControlRequest,
    ) -> Vec<BridgeAction> {
        let InboundControlRequest::CanUseTool {
            tool_name, input, ..
        } = request
        else {
            return Vec::new();
        };

        if tool_name == QUESTION_TOOL
            && let Some(questions) = parse_questions(input)
        {
            let prompt = question_prompt(&control_id, 0, &questions[0], input);
            self.outstanding.push_back(Outstanding {
                control_id,
                prompt: prompt.clone(),
                input: input.clone(),
                kind: PromptKind::Questions {
                    questions,
                    answers: serde_json::Map::new(),
                    current: 0,
                },
            });
            return vec![BridgeAction::Raise(prompt)];
        }

        let prompt = ApprovalPrompt {
            request_id: control_id.clone(),
            tool_name: ToolName::new(tool_name.as_str()),
            input: input.clone(),
            options: TOOL_OPTIONS.iter().map(ToString::to_string).collect(),
            is_multi_select: false,
            has_other: true,
        };
        self.outstanding.push_back(Outstanding {
            control_id,
            prompt: prompt.clone(),
            input: input.clone(),
            kind: PromptKind::Tool {
                suggestions: request.permission_updates(),
            },
        });
        vec![BridgeAction::Raise(prompt)]
    }

    /// Apply a numbered answer
    ///
    /// `request_id` selects the prompt; without it the oldest prompt is
    /// answered.
    ///
    /// # Errors
    /// Returns `ApprovalNotFound` when no matching prompt is outstanding
    pub fn answer(
        &mut self,
        option_number: usize,
        message: Option<String>,
        request_id: Option<&RequestId>,
    ) -> Result<Vec<BridgeAction>> {
        let index = match request_id {
            Some(id) => self
                .outstanding
                .iter()
                .position(|o| &o.prompt.request_id == id || &o.control_id == id),
            None => (!self.outstanding.is_empty()).then_some(0),
        }
        .ok_or_else(|| {
            RunnerError::approval_not_found(
                request_id.map_or_else(|| "<none outstanding>".to_string(), ToString::to_string),
            )
        })?;

        let is_tool = matches!(self.outstanding[index].kind, PromptKind::Tool { .. });
        if is_tool {
            let Some(entry) = self.outstanding.remove(index) else {
                return Ok(Vec::new());
            };
            return Ok(answer_tool(entry, option_number, message));
        }

        let Some(entry) = self.outstanding.get_mut(index) else {
            return Ok(Vec::new());
        };
        let mut actions = vec![BridgeAction::Clear(entry.prompt.request_id.clone())];
        let PromptKind::Questions {
            questions,
            answers,
            current,
        } = &mut entry.kind
        else {
            return Ok(actions);
        };

        let question = &questions[*current];
        let Some(answer) = pick_answer(question, option_number, message.as_deref()) else {
            // Declining to answer hands the decision back to the agent
            let control_id = entry.control_id.clone();
            self.outstanding.remove(index);
            actions.push(BridgeAction::Reply {
                control_id,
                result: PermissionResult::from_decision(
                    ControllerDecision::Delegate,
                    serde_json::Value::Null,
                    message.or_else(|| Some("The user declined to answer".to_string())),
                    None,
                ),
            });
            return Ok(actions);
        };
        answers.insert(question.text.clone(), serde_json::Value::String(answer));
        *current += 1;

        if *current < questions.len() {
            let prompt = question_prompt(
                &entry.control_id,
                *current,
                &questions[*current],
                &entry.input,
            );
            entry.prompt = prompt.clone();
            actions.push(BridgeAction::Raise(prompt));
            return Ok(actions);
        }

        let mut updated_input = entry.input.clone();
        if let Some(object) = updated_input.as_object_mut() {
            object.insert(
                "answers".to_string(),
                serde_json::Value::Object(std::mem::take(answers)),
            );
        }
        let control_id = entry.control_id.clone();
        self.outstanding.remove(index);
        actions.push(BridgeAction::Reply {
            control_id,
            result: PermissionResult::from_decision(
                ControllerDecision::Approve,
                updated_input,
                None,
                None,
            ),
        });
        Ok(actions)
    }

    /// Drop the prompt tied to a withdrawn control request
    pub fn cancel(&mut self, control_id: &RequestId) -> Vec<BridgeAction> {
        let mut actions = Vec::new();
        self.outstanding.retain(|o| {
            if &o.control_id == control_id {
                actions.push(BridgeAction::Clear(o.prompt.request_id.clone()));
                false
            } else {
                true
            }
        });
        actions
    }

    /// Deny the control request behind a prompt that timed out
    ///
    /// The whole request is denied, including questions not yet asked.
    ///
    /// # Errors
    /// Returns `ApprovalNotFound` when no matching prompt is outstanding
    pub fn expire(&mut self, request_id: &RequestId, reason: &str) -> Result<Vec<BridgeAction>> {
        let index = self
            .outstanding
            .iter()
            .position(|o| &o.prompt.request_id == request_id || &o.control_id == request_id)
            .ok_or_else(|| RunnerError::approval_not_found(request_id.as_str()))?;
        let Some(entry) = self.outstanding.remove(index) else {
            return Ok(Vec::new());
        };
        Ok(vec![
            BridgeAction::Clear(entry.prompt.request_id),
            BridgeAction::Reply {
                control_id: entry.control_id,
                result: PermissionResult::Deny {
                    message: reason.to_string(),
                    interrupt: false,
                },
            },
        ])
    }

    /// Deny everything outstanding, e.g. on interrupt or close
    pub fn deny_all(&mut self, reason: &str) -> Vec<BridgeAction> {
        let mut actions = Vec::new();
        for entry in self.outstanding.drain(..) {
            actions.push(BridgeAction::Clear(entry.prompt.request_id));
            actions.push(BridgeAction::Reply {
                control_id: entry.control_id,
                result: PermissionResult::Deny {
                    message: reason.to_string(),
                    interrupt: true,
                },
            });
        }
        actions
    }
}

fn answer_tool(entry: Outstanding, option_number: usize, message: Option<String>) -> Vec<BridgeAction> {
    let PromptKind::Tool { suggestions } = entry.kind else {
        return Vec::new();
    };
    let result = match option_number {
        1 => PermissionResult::from_decision(ControllerDecision::Approve, entry.input, None, None),
        2 => PermissionResult::from_decision(
            ControllerDecision::Approve,
            entry.input,
            None,
            (!suggestions.is_empty()).then_some(suggestions),
        ),
        3 => PermissionResult::from_decision(ControllerDecision::Deny, entry.input, message, None),
        _ => PermissionResult::from_decision(ControllerDecision::Delegate, entry.input, message, None),
    };
    vec![
        BridgeAction::Clear(entry.prompt.request_id),
        BridgeAction::Reply {
            control_id: entry.control_id,
            result,
        },
    ]
}

fn parse_questions(input: &serde_json::Value) -> Option<Vec<Question>> {
    let questions: Vec<Question> = input
        .get("questions")?
        .as_array()?
        .iter()
        .filter_map(|q| {
            let text = q.get("question")?.as_str()?.to_string();
            let options = q
                .get("options")
                .and_then(serde_json::Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(|o| {
                            o.get("label")
                                .and_then(serde_json::Value::as_str)
                                .or_else(|| o.as_str())
                                .map(str::to_string)
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(Question {
                text,
                header: q
                    .get("header")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
                options,
                multi_select: q
                    .get("multiSelect")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
            })
        })
        .collect();
    (!questions.is_empty()).then_some(questions)
}

fn question_prompt(
    control_id: &RequestId,
    index: usize,
    question: &Question,
    input: &serde_json::Value,
) -> ApprovalPrompt {
    ApprovalPrompt {
        request_id: RequestId::new(format!("{control_id}-q{index}")),
        tool_name: ToolName::new(QUESTION_TOOL),
        input: serde_json::json!({
            "question": question.text,
            "header": question.header,
            "index": index,
            "total": input
                .get("questions")
                .and_then(serde_json::Value::as_array)
                .map_or(1, Vec::len),
        }),
        options: question.options.clone(),
        is_multi_select: question.multi_select,
        has_other: true,
    }
}

/// Resolve an answer label; `None` when the user declined
fn pick_answer(question: &Question, option_number: usize, message: Option<&str>) -> Option<String> {
    if question.multi_select
        && let Some(text) = message
    {
        let picked: Vec<&str> = text
            .split(',')
            .filter_map(|n| n.trim().parse::<usize>().ok())
            .filter_map(|n| n.checked_sub(1).and_then(|i| question.options.get(i)))
            .map(String::as_str)
            .collect();
        if !picked.is_empty() {
            return Some(picked.join(", "));
        }
    }

    if let Some(label) = option_number
        .checked_sub(1)
        .and_then(|i| question.options.get(i))
    {
        return Some(label.clone());
    }

    message
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
