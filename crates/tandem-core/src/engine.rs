// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The tool loop: model call → tool executions → feed results back, until
//! the model stops calling tools or the step bound is hit.
//!
//! Continuation is provider-polymorphic and kept as an explicit enum — the
//! four wire contracts (response-id reuse, replayed conversation items,
//! message array, content array) differ too much for a shared interface to
//! help.  Tool executions within a turn run in parallel; results are
//! harvested in the model's call order so the continuation payload is
//! deterministic.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use tandem_model::providers::{
    chatgpt, fireworks, gemini, open_stream, ProviderEvent, ProviderRequest, TurnInput,
};
use tandem_model::{
    cost_usd, AbortHandle, Content, LlmError, LoopResult, LoopStep, ModelTool, Part, Prompt,
    Provider, ReasoningEffort, Role, ToolCallRecord, Usage,
};

use crate::context::{self, ToolContext};
use crate::events::LoopEvent;
use crate::tool::{ToolInput, ToolSet};

use futures::StreamExt;

/// Default step bound when the caller does not set one.
pub const DEFAULT_MAX_STEPS: u32 = 24;

pub struct LoopRequest {
    pub model: String,
    pub prompt: Prompt,
    pub tools: ToolSet,
    pub model_tools: Vec<ModelTool>,
    pub max_steps: u32,
    pub effort: Option<ReasoningEffort>,
    pub abort: Option<AbortHandle>,
    pub events: Option<mpsc::Sender<LoopEvent>>,
}

impl LoopRequest {
    pub fn new(model: impl Into<String>, prompt: Prompt, tools: ToolSet) -> Self {
        Self {
            model: model.into(),
            prompt,
            tools,
            model_tools: Vec::new(),
            max_steps: DEFAULT_MAX_STEPS,
            effort: None,
            abort: None,
            events: None,
        }
    }
}

/// Per-provider conversation state carried between turns.
enum Conversation {
    OpenAi {
        initial: Vec<Content>,
        previous_response_id: Option<String>,
        pending_items: Vec<Value>,
    },
    ChatGpt {
        items: Vec<Value>,
        conversation_id: String,
    },
    Fireworks {
        messages: Vec<Value>,
    },
    Gemini {
        contents: Vec<Value>,
    },
    Mock {
        contents: Vec<Content>,
    },
}

/// One assembled tool call from a model turn.
struct AssembledCall {
    id: String,
    name: String,
    arguments: String,
    custom: bool,
}

struct PendingToolCall {
    id: String,
    name: String,
    args: String,
    custom: bool,
}

/// Run the multi-step agent loop.
pub async fn run_tool_loop(req: LoopRequest) -> Result<LoopResult, LlmError> {
    if req.tools.is_empty() {
        return Err(LlmError::invalid_argument(
            "tool loop requires at least one tool",
        ));
    }
    let contents = req.prompt.resolved_contents();
    if contents.is_empty() {
        return Err(LlmError::invalid_argument("empty prompt"));
    }
    let provider = Provider::classify(&req.model)?;
    let max_steps = req.max_steps.max(1);
    let abort = AbortHandle::fan_in(req.abort.as_ref());
    let effort = req
        .effort
        .unwrap_or_else(|| ReasoningEffort::default_for(&req.model));

    // Split system/developer content into the instructions slot for providers
    // that carry one across turns; others keep it in their message shape.
    let (mut conversation, instructions) = match provider {
        Provider::OpenAi => (
            Conversation::OpenAi {
                initial: contents.clone(),
                previous_response_id: None,
                pending_items: Vec::new(),
            },
            req.prompt.instructions.clone(),
        ),
        Provider::ChatGpt => {
            let (instructions, rest) = hoist_system_text(&contents, &req.prompt.instructions);
            (
                Conversation::ChatGpt {
                    items: tandem_model::providers::openai::encode_contents(&rest, None),
                    conversation_id: Uuid::new_v4().to_string(),
                },
                instructions,
            )
        }
        Provider::Fireworks => (
            Conversation::Fireworks {
                messages: fireworks::encode_messages(
                    &contents,
                    req.prompt.instructions.as_deref(),
                ),
            },
            None,
        ),
        Provider::Gemini => {
            let (encoded, system_parts) = gemini::encode_contents(&contents);
            let mut instructions = req.prompt.instructions.clone().unwrap_or_default();
            for part in &system_parts {
                if let Some(text) = part["text"].as_str() {
                    if !instructions.is_empty() {
                        instructions.push_str("\n\n");
                    }
                    instructions.push_str(text);
                }
            }
            (
                Conversation::Gemini { contents: encoded },
                (!instructions.is_empty()).then_some(instructions),
            )
        }
        Provider::Mock => (
            Conversation::Mock { contents },
            req.prompt.instructions.clone(),
        ),
    };

    let mut steps: Vec<LoopStep> = Vec::new();
    let mut total_cost = 0.0;
    let mut final_text = String::new();
    let mut all_thoughts: Vec<String> = Vec::new();

    loop {
        let step_no = steps.len() as u32 + 1;
        let turn_input = build_turn_input(&conversation);
        let first_turn = steps.is_empty();

        let provider_req = ProviderRequest {
            model: req.model.clone(),
            turn: turn_input,
            instructions: turn_instructions(provider, first_turn, &instructions),
            tools: req.tools.decls(),
            model_tools: req.model_tools.clone(),
            effort,
            response_format: None,
            conversation_id: match &conversation {
                Conversation::ChatGpt {
                    conversation_id, ..
                } => Some(conversation_id.clone()),
                _ => None,
            },
            image_output: false,
        };

        let turn = stream_turn(provider_req, &abort, &req.events).await?;

        if !turn.thoughts.is_empty() {
            all_thoughts.push(turn.thoughts.clone());
        }
        total_cost += turn.cost_usd;

        if turn.calls.is_empty() {
            final_text = turn.text.clone();
            let step = LoopStep {
                step: step_no,
                model_version: turn.model_version,
                text: (!turn.text.is_empty()).then_some(turn.text),
                thoughts: (!turn.thoughts.is_empty()).then_some(turn.thoughts),
                tool_calls: Vec::new(),
                usage: turn.usage,
                cost_usd: turn.cost_usd,
            };
            if let Some(tx) = &req.events {
                let _ = tx.send(LoopEvent::StepCompleted(step.clone())).await;
            }
            steps.push(step);
            break;
        }

        // Execute this turn's tool calls in parallel and harvest them in the
        // model's call order.
        let records = execute_tools(&req.tools, &turn.calls, step_no, &abort, &req.events).await;

        if abort.is_aborted() {
            return Err(LlmError::cancelled(abort.reason()));
        }

        let step = LoopStep {
            step: step_no,
            model_version: turn.model_version,
            text: (!turn.text.is_empty()).then_some(turn.text),
            thoughts: (!turn.thoughts.is_empty()).then_some(turn.thoughts),
            tool_calls: records,
            usage: turn.usage,
            cost_usd: turn.cost_usd,
        };
        if let Some(tx) = &req.events {
            let _ = tx.send(LoopEvent::StepCompleted(step.clone())).await;
        }

        feed_back(&mut conversation, &turn.calls, &step.tool_calls, turn.response_id)?;
        steps.push(step);

        if steps.len() as u32 >= max_steps {
            return Err(LlmError::LimitExceeded {
                message: format!(
                    "tool loop reached max_steps ({max_steps}) with tool calls still pending"
                ),
                steps,
            });
        }
    }

    Ok(LoopResult {
        text: final_text,
        thoughts: all_thoughts.join("\n\n"),
        steps,
        total_cost_usd: total_cost,
    })
}

/// Instructions to attach this turn.  OpenAI carries its system message in
/// the first turn's items and inherits it through `previous_response_id`;
/// ChatGPT, Gemini, and the mock re-send instructions every turn.
fn turn_instructions(
    provider: Provider,
    first_turn: bool,
    instructions: &Option<String>,
) -> Option<String> {
    match provider {
        Provider::OpenAi => first_turn.then(|| instructions.clone()).flatten(),
        Provider::Fireworks => None,
        Provider::ChatGpt | Provider::Gemini | Provider::Mock => instructions.clone(),
    }
}

fn build_turn_input(conversation: &Conversation) -> TurnInput {
    match conversation {
        Conversation::OpenAi {
            initial,
            previous_response_id: None,
            ..
        } => TurnInput::Contents(initial.clone()),
        Conversation::OpenAi {
            previous_response_id: Some(id),
            pending_items,
            ..
        } => TurnInput::OpenAiFollowUp {
            previous_response_id: id.clone(),
            items: pending_items.clone(),
        },
        Conversation::ChatGpt { items, .. } => TurnInput::ChatGptItems(items.clone()),
        Conversation::Fireworks { messages } => TurnInput::FireworksMessages(messages.clone()),
        Conversation::Gemini { contents } => TurnInput::GeminiContents(contents.clone()),
        Conversation::Mock { contents } => TurnInput::Contents(contents.clone()),
    }
}

/// Outcome of one streamed model turn.
struct TurnOutcome {
    text: String,
    thoughts: String,
    calls: Vec<AssembledCall>,
    usage: Option<Usage>,
    cost_usd: f64,
    model_version: String,
    response_id: Option<String>,
}

async fn stream_turn(
    req: ProviderRequest,
    abort: &AbortHandle,
    events: &Option<mpsc::Sender<LoopEvent>>,
) -> Result<TurnOutcome, LlmError> {
    let model_id = req.model.clone();
    let mut stream = open_stream(req, abort).await?;

    let mut text = String::new();
    let mut thoughts = String::new();
    let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
    let mut usage: Option<Usage> = None;
    let mut model_version: Option<String> = None;
    let mut response_id: Option<String> = None;

    loop {
        let event = tokio::select! {
            biased;
            _ = abort.aborted() => {
                return Err(LlmError::cancelled(abort.reason()));
            }
            event = stream.next() => event,
        };
        let Some(event) = event else { break };
        match event? {
            ProviderEvent::TextDelta(delta) => {
                text.push_str(&delta);
                if let Some(tx) = events {
                    let _ = tx.send(LoopEvent::TextDelta(delta)).await;
                }
            }
            ProviderEvent::ThoughtDelta(delta) => {
                thoughts.push_str(&delta);
                if let Some(tx) = events {
                    let _ = tx.send(LoopEvent::ThoughtDelta(delta)).await;
                }
            }
            ProviderEvent::ToolCall {
                index,
                id,
                name,
                arguments,
                custom,
            } => {
                let entry = pending.entry(index).or_insert_with(|| PendingToolCall {
                    id: String::new(),
                    name: String::new(),
                    args: String::new(),
                    custom: false,
                });
                if !id.is_empty() {
                    entry.id = id;
                }
                if !name.is_empty() {
                    entry.name = name;
                }
                entry.args.push_str(&arguments);
                entry.custom |= custom;
            }
            ProviderEvent::Usage(u) => {
                usage.get_or_insert_with(Usage::default).merge_from(&u);
            }
            ProviderEvent::ModelVersion(version) => {
                model_version.get_or_insert(version);
            }
            ProviderEvent::ResponseId(id) => response_id = Some(id),
            ProviderEvent::Blocked => {
                if let Some(tx) = events {
                    let _ = tx.send(LoopEvent::Blocked).await;
                }
            }
            ProviderEvent::InlineData { .. } => {}
            ProviderEvent::Done => break,
        }
    }

    // Flush accumulated calls in the model's call order.  Calls without a
    // name cannot be dispatched and are dropped; an empty id gets a
    // synthetic fallback so the turn can still complete.  Function-call
    // arguments are normalized here — empty or malformed buffers are
    // repaired or replaced with `{}` — so both dispatch and the next turn's
    // replay always carry a valid JSON object.
    let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
    sorted.sort_by_key(|(index, _)| *index);
    let mut calls = Vec::with_capacity(sorted.len());
    for (i, (_, ptc)) in sorted.into_iter().enumerate() {
        if ptc.name.is_empty() {
            warn!(call_id = %ptc.id, "dropping tool call with empty name from model");
            continue;
        }
        let id = if ptc.id.is_empty() {
            warn!(tool_name = %ptc.name, "tool call had empty id; generating synthetic id");
            format!("tc_synthetic_{i}")
        } else {
            ptc.id
        };
        let arguments = if ptc.custom {
            ptc.args
        } else {
            resolve_function_arguments(&ptc.name, &id, ptc.args)
        };
        calls.push(AssembledCall {
            id,
            name: ptc.name,
            arguments,
            custom: ptc.custom,
        });
    }

    let cost = usage
        .as_ref()
        .map(|u| cost_usd(&model_id, u, 0, None))
        .unwrap_or(0.0);

    Ok(TurnOutcome {
        text: text.trim().to_string(),
        thoughts: thoughts.trim().to_string(),
        calls,
        usage,
        cost_usd: cost,
        model_version: model_version.unwrap_or(model_id),
        response_id,
    })
}

/// Launch all calls of a turn concurrently, then harvest them in call order.
async fn execute_tools(
    tools: &ToolSet,
    calls: &[AssembledCall],
    turn: u32,
    abort: &AbortHandle,
    events: &Option<mpsc::Sender<LoopEvent>>,
) -> Vec<ToolCallRecord> {
    let mut tasks = Vec::with_capacity(calls.len());
    for (k, call) in calls.iter().enumerate() {
        if let Some(tx) = events {
            let _ = tx
                .send(LoopEvent::ToolCallStarted {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    turn,
                })
                .await;
        }

        // Prepare input and dispatch; every failure mode becomes a structured
        // payload instead of aborting the loop.  Function-call arguments are
        // valid JSON by the time calls are assembled; an unparseable buffer
        // still falls back to an empty object rather than skipping the call.
        let prepared: Result<(std::sync::Arc<dyn crate::tool::Tool>, ToolInput), Value> =
            match tools.get(&call.name) {
                None => Err(json!({ "error": format!("unknown tool: {}", call.name) })),
                Some(tool) => {
                    if call.custom {
                        Ok((tool.clone(), ToolInput::Raw(call.arguments.clone())))
                    } else {
                        let value = serde_json::from_str::<Value>(&call.arguments)
                            .unwrap_or_else(|_| Value::Object(Default::default()));
                        Ok((tool.clone(), ToolInput::Value(value)))
                    }
                }
            };

        let ctx = ToolContext {
            tool_name: call.name.clone(),
            tool_id: format!("turn{turn}/tool{k}"),
            turn,
            tool_index: k as u32,
            abort: abort.clone(),
        };
        tasks.push(tokio::spawn(async move {
            match prepared {
                Err(payload) => Err(payload),
                Ok((tool, input)) => {
                    match context::scope(ctx, async move { tool.execute(input).await }).await {
                        Ok(value) => Ok(value),
                        Err(e) => Err(json!({ "error": e.to_string() })),
                    }
                }
            }
        }));
    }

    let mut records = Vec::with_capacity(calls.len());
    for (k, task) in tasks.into_iter().enumerate() {
        let call = &calls[k];
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(json!({ "error": format!("tool panicked: {e}") })),
        };
        let (output, error) = match outcome {
            Ok(v) => (Some(v), None),
            Err(payload) => (None, Some(payload)),
        };
        if let Some(tx) = events {
            let _ = tx
                .send(LoopEvent::ToolCallFinished {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    is_error: error.is_some(),
                })
                .await;
        }
        let input = if call.custom {
            Value::String(call.arguments.clone())
        } else {
            serde_json::from_str(&call.arguments)
                .unwrap_or_else(|_| Value::Object(Default::default()))
        };
        records.push(ToolCallRecord {
            tool_name: call.name.clone(),
            input,
            output,
            error,
            call_id: Some(call.id.clone()),
        });
    }
    records
}

/// The payload fed back to the model for one executed call.
fn feedback_value(record: &ToolCallRecord) -> Value {
    record
        .output
        .clone()
        .or_else(|| record.error.clone())
        .unwrap_or(Value::Null)
}

/// A string form of the payload: raw for string values, JSON-serialized for
/// structured ones.
fn feedback_string(record: &ToolCallRecord) -> String {
    match feedback_value(record) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Append this turn's calls and outputs in the provider's continuation shape.
fn feed_back(
    conversation: &mut Conversation,
    calls: &[AssembledCall],
    records: &[ToolCallRecord],
    response_id: Option<String>,
) -> Result<(), LlmError> {
    match conversation {
        Conversation::OpenAi {
            previous_response_id,
            pending_items,
            ..
        } => {
            let id = response_id.ok_or_else(|| {
                LlmError::provider("openai", None, "response carried no id for continuation")
            })?;
            *previous_response_id = Some(id);
            pending_items.clear();
            for (call, record) in calls.iter().zip(records) {
                let output = feedback_string(record);
                pending_items.push(if call.custom {
                    tandem_model::providers::openai::custom_tool_call_output_item(
                        &call.id, &output,
                    )
                } else {
                    tandem_model::providers::openai::function_call_output_item(&call.id, &output)
                });
            }
        }
        Conversation::ChatGpt { items, .. } => {
            for call in calls {
                items.push(if call.custom {
                    chatgpt::custom_tool_call_item(&call.id, &call.name, &call.arguments)
                } else {
                    chatgpt::function_call_item(&call.id, &call.name, &call.arguments)
                });
            }
            for (call, record) in calls.iter().zip(records) {
                let output = feedback_string(record);
                items.push(if call.custom {
                    chatgpt::custom_tool_call_output_item(&call.id, &output)
                } else {
                    chatgpt::function_call_output_item(&call.id, &output)
                });
            }
        }
        Conversation::Fireworks { messages } => {
            let call_tuples: Vec<(String, String, String)> = calls
                .iter()
                .map(|c| (c.id.clone(), c.name.clone(), c.arguments.clone()))
                .collect();
            messages.push(fireworks::assistant_tool_calls_message(&call_tuples));
            for (call, record) in calls.iter().zip(records) {
                messages.push(fireworks::tool_result_message(
                    &call.id,
                    &feedback_string(record),
                ));
            }
        }
        Conversation::Gemini { contents } => {
            let call_tuples: Vec<(String, Value, Option<String>)> = calls
                .iter()
                .map(|c| {
                    let args: Value =
                        serde_json::from_str(&c.arguments).unwrap_or(json!({}));
                    (c.name.clone(), args, Some(c.id.clone()))
                })
                .collect();
            contents.push(gemini::function_call_content(&call_tuples));
            let responses: Vec<(String, Value)> = calls
                .iter()
                .zip(records)
                .map(|(c, r)| (c.name.clone(), feedback_value(r)))
                .collect();
            contents.push(gemini::function_response_content(&responses));
        }
        Conversation::Mock { contents } => {
            for call in calls {
                contents.push(Content {
                    role: Role::Assistant,
                    parts: vec![Part::text(format!(
                        "[tool_call {} {}]",
                        call.name, call.arguments
                    ))],
                });
            }
            for (call, record) in calls.iter().zip(records) {
                contents.push(Content {
                    role: Role::Tool,
                    parts: vec![Part::text(format!(
                        "[tool_result {} {}]",
                        call.name,
                        feedback_string(record)
                    ))],
                });
            }
        }
    }
    Ok(())
}

/// Resolve an accumulated function-call argument buffer into a valid JSON
/// string.  Models occasionally send empty buffers for zero-argument tools,
/// or JSON with broken escapes / truncated endings; sending those back to a
/// provider on the next turn causes a 400, so the buffer is repaired — or
/// replaced with `{}` — before the call is dispatched or replayed.
fn resolve_function_arguments(tool_name: &str, call_id: &str, args: String) -> String {
    if args.trim().is_empty() {
        warn!(
            tool_name,
            call_id, "model sent tool call with empty arguments; substituting {{}}"
        );
        return "{}".to_string();
    }
    if serde_json::from_str::<Value>(&args).is_ok() {
        return args;
    }
    match attempt_json_repair(&args) {
        Some(repaired) => {
            warn!(tool_name, call_id, "repaired invalid JSON arguments from model");
            repaired.to_string()
        }
        None => {
            warn!(
                tool_name,
                call_id,
                args = %args,
                "model sent tool call with invalid JSON arguments; substituting {{}}"
            );
            "{}".to_string()
        }
    }
}

/// Attempt to repair common JSON syntax errors in model output:
/// - invalid escape sequences inside string values (e.g. `\c`, `\p`)
/// - truncated output missing a closing quote and/or brace
fn attempt_json_repair(args: &str) -> Option<Value> {
    let fixed = fix_invalid_json_escapes(args);
    if let Ok(v) = serde_json::from_str::<Value>(&fixed) {
        return Some(v);
    }

    if !fixed.trim_end().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim_end().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<Value>(&completed) {
            return Some(v);
        }
    }

    None
}

/// Walk through a JSON string and replace any invalid escape sequence inside
/// string values with a properly escaped backslash.
///
/// Valid JSON escape characters are: `"`, `\`, `/`, `b`, `f`, `n`, `r`, `t`,
/// `u`.  Anything else (e.g. `\c`, `\(`) is turned into `\\X` so the result
/// round-trips through serde_json without a parse error.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

/// Pull system/developer text out of the content list (ChatGPT carries it in
/// the dedicated instructions field).
fn hoist_system_text(
    contents: &[Content],
    instructions: &Option<String>,
) -> (Option<String>, Vec<Content>) {
    let mut combined = instructions.clone().unwrap_or_default();
    let mut rest = Vec::with_capacity(contents.len());
    for content in contents {
        match content.role {
            Role::System | Role::Developer => {
                let text = content.channel_text(false);
                if !text.is_empty() {
                    if !combined.is_empty() {
                        combined.push_str("\n\n");
                    }
                    combined.push_str(&text);
                }
            }
            _ => rest.push(content.clone()),
        }
    }
    ((!combined.is_empty()).then_some(combined), rest)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
