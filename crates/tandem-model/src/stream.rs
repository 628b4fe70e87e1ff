// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming call core.
//!
//! [`stream_text`] resolves the provider, opens the call under admission
//! control, and pumps normalized provider events into an event queue.
//! Exactly one of `close` / `fail` happens on the queue, and the result
//! settles exactly once: with a [`TextResult`], a normalized error, or
//! `cancelled` when either the returned handle or the caller's signal aborts.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::abort::AbortHandle;
use crate::catalog;
use crate::cost::cost_usd;
use crate::error::LlmError;
use crate::providers::{self, ProviderEvent, ProviderRequest, ResponseFormat, TurnInput};
use crate::queue::{EventQueue, EventStream};
use crate::content::{
    Channel, ModelTool, Part, Prompt, ReasoningEffort, StreamEvent, Usage,
};

/// Request for a plain streaming text call.
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub model: String,
    pub prompt: Prompt,
    /// Defaults per model family when unset (codex → medium, else high).
    pub effort: Option<ReasoningEffort>,
    pub model_tools: Vec<ModelTool>,
    /// Structured-output format; set by the JSON call layer.
    pub response_format: Option<ResponseFormat>,
    pub abort: Option<AbortHandle>,
}

impl TextRequest {
    pub fn new(model: impl Into<String>, prompt: Prompt) -> Self {
        Self {
            model: model.into(),
            prompt,
            effort: None,
            model_tools: Vec::new(),
            response_format: None,
            abort: None,
        }
    }
}

/// Aggregated outcome of a streaming call.
#[derive(Debug, Clone)]
pub struct TextResult {
    pub text: String,
    pub thoughts: String,
    /// Inline payloads produced by the model (image generation).
    pub images: Vec<Part>,
    pub usage: Usage,
    pub cost_usd: f64,
    pub model_version: String,
    pub blocked: bool,
    /// Provider response id, when the protocol has one.
    pub response_id: Option<String>,
}

/// A streaming call in flight: a multi-consumer event view, an abort handle,
/// and the settled result.
#[derive(Debug)]
pub struct StreamingCall {
    queue: Arc<EventQueue<StreamEvent>>,
    handle: JoinHandle<Result<TextResult, LlmError>>,
    abort: AbortHandle,
}

impl StreamingCall {
    /// Subscribe a reader.  Every reader observes the full event sequence.
    pub fn events(&self) -> EventStream<StreamEvent> {
        self.queue.subscribe()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self, reason: Option<&str>) {
        self.abort.abort(reason);
    }

    /// Await the terminal outcome.
    pub async fn result(self) -> Result<TextResult, LlmError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(LlmError::provider(
                "runtime",
                None,
                format!("call task failed: {e}"),
            )),
        }
    }
}

/// Open a streaming text call.
///
/// Validation errors (empty prompt, unknown model) surface synchronously;
/// everything after that arrives through the queue and the result.
pub fn stream_text(req: TextRequest) -> Result<StreamingCall, LlmError> {
    let contents = req.prompt.resolved_contents();
    let non_empty = contents.iter().any(|c| {
        c.parts.iter().any(|p| match p {
            Part::Text { text, .. } => !text.trim().is_empty(),
            Part::InlineData { .. } => true,
        })
    });
    if contents.is_empty() || !non_empty {
        return Err(LlmError::invalid_argument("empty prompt"));
    }
    // Classify up front so an unknown model id fails before any task spawns.
    catalog::Provider::classify(&req.model)?;

    let abort = AbortHandle::fan_in(req.abort.as_ref());
    let queue = Arc::new(EventQueue::new());

    let provider_req = ProviderRequest {
        model: req.model.clone(),
        turn: TurnInput::Contents(contents),
        instructions: req.prompt.instructions.clone(),
        tools: Vec::new(),
        model_tools: req.model_tools.clone(),
        effort: req
            .effort
            .unwrap_or_else(|| ReasoningEffort::default_for(&req.model)),
        response_format: req.response_format.clone(),
        conversation_id: None,
        image_output: catalog::classify_image(&req.model).is_ok(),
    };

    let task_queue = Arc::clone(&queue);
    let task_abort = abort.clone();
    let handle = tokio::spawn(async move { run_call(provider_req, task_queue, task_abort).await });

    Ok(StreamingCall {
        queue,
        handle,
        abort,
    })
}

/// Drain wrapper around [`stream_text`].
pub async fn generate_text(req: TextRequest) -> Result<TextResult, LlmError> {
    stream_text(req)?.result().await
}

async fn run_call(
    req: ProviderRequest,
    queue: Arc<EventQueue<StreamEvent>>,
    abort: AbortHandle,
) -> Result<TextResult, LlmError> {
    let model_id = req.model.clone();

    let mut stream = match providers::open_stream(req, &abort).await {
        Ok(stream) => stream,
        Err(err) => {
            let shared = Arc::new(err.clone());
            queue.fail(shared);
            return Err(err);
        }
    };

    let mut text = String::new();
    let mut thoughts = String::new();
    let mut images: Vec<Part> = Vec::new();
    let mut usage = Usage::default();
    let mut saw_usage = false;
    let mut model_version: Option<String> = None;
    let mut response_id: Option<String> = None;
    let mut blocked = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = abort.aborted() => {
                let reason = abort.reason();
                queue.abort(reason.clone());
                return Err(LlmError::cancelled(reason));
            }
            event = stream.next() => event,
        };
        let Some(event) = event else {
            break;
        };
        match event {
            Ok(ProviderEvent::TextDelta(delta)) => {
                text.push_str(&delta);
                queue.push(StreamEvent::Delta {
                    channel: Channel::Response,
                    text: delta,
                });
            }
            Ok(ProviderEvent::ThoughtDelta(delta)) => {
                thoughts.push_str(&delta);
                queue.push(StreamEvent::Delta {
                    channel: Channel::Thought,
                    text: delta,
                });
            }
            // Tool-call fragments are the loop engine's concern; a plain
            // text call ignores them.
            Ok(ProviderEvent::ToolCall { .. }) => {}
            Ok(ProviderEvent::InlineData { data, mime_type }) => {
                images.push(Part::InlineData { data, mime_type });
            }
            Ok(ProviderEvent::Usage(u)) => {
                saw_usage = true;
                usage.merge_from(&u);
            }
            Ok(ProviderEvent::ModelVersion(version)) => {
                if model_version.is_none() {
                    queue.push(StreamEvent::Model {
                        model_version: version.clone(),
                    });
                    model_version = Some(version);
                }
            }
            Ok(ProviderEvent::ResponseId(id)) => {
                response_id = Some(id);
            }
            Ok(ProviderEvent::Blocked) => {
                if !blocked {
                    blocked = true;
                    queue.push(StreamEvent::Blocked);
                }
            }
            Ok(ProviderEvent::Done) => break,
            Err(err) => {
                let shared = Arc::new(err.clone());
                queue.fail(Arc::clone(&shared));
                return Err(err);
            }
        }
    }

    let model_version = model_version.unwrap_or_else(|| model_id.clone());
    let cost = cost_usd(&model_id, &usage, images.len() as u32, None);
    if saw_usage {
        queue.push(StreamEvent::Usage {
            usage: usage.clone(),
            cost_usd: cost,
            model_version: model_version.clone(),
        });
    }
    queue.close();

    Ok(TextResult {
        text: text.trim().to_string(),
        thoughts: thoughts.trim().to_string(),
        images,
        usage,
        cost_usd: cost,
        model_version,
        blocked,
        response_id,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
