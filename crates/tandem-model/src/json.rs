// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Structured-JSON calls.
//!
//! Wraps the streaming core: derives a JSON Schema for the target type,
//! shapes it per provider, parses best-effort snapshots while deltas stream
//! (emitting `json` events only when the snapshot actually changes), and
//! validates the finalized text by deserializing into the target type.
//! Failed attempts are retried up to `max_attempts`; the composite error
//! carries every attempt's raw text and failure reason.

use std::sync::Arc;

use futures::StreamExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::abort::AbortHandle;
use crate::catalog::Provider;
use crate::error::{preview, JsonAttemptFailure, LlmError};
use crate::partial_json::{normalize_json_text, parse_partial_json};
use crate::providers::ResponseFormat;
use crate::queue::{EventQueue, EventStream};
use crate::stream::{stream_text, TextRequest, TextResult};
use crate::content::{Channel, JsonStage, Prompt, ReasoningEffort, StreamEvent};

/// Hook applied to the parsed value before validation.
pub type NormalizeJson = Arc<dyn Fn(Value) -> Value + Send + Sync>;

pub struct JsonRequest {
    pub model: String,
    pub prompt: Prompt,
    pub effort: Option<ReasoningEffort>,
    /// Total attempts including the first (default 2).
    pub max_attempts: u32,
    pub normalize: Option<NormalizeJson>,
    pub abort: Option<AbortHandle>,
}

impl JsonRequest {
    pub fn new(model: impl Into<String>, prompt: Prompt) -> Self {
        Self {
            model: model.into(),
            prompt,
            effort: None,
            max_attempts: 2,
            normalize: None,
            abort: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_normalize(mut self, normalize: NormalizeJson) -> Self {
        self.normalize = Some(normalize);
        self
    }
}

/// Successful outcome: the validated value plus the underlying call result
/// of the attempt that succeeded.
pub struct JsonOutcome<T> {
    pub value: T,
    pub raw: TextResult,
    /// 1-based number of the attempt that produced the value.
    pub attempts: u32,
}

/// A JSON call in flight.  The event view carries the streaming-core events
/// with `json` partial/final events overlaid.
pub struct JsonCall<T> {
    queue: Arc<EventQueue<StreamEvent>>,
    handle: JoinHandle<Result<JsonOutcome<T>, LlmError>>,
    abort: AbortHandle,
}

impl<T> JsonCall<T> {
    pub fn events(&self) -> EventStream<StreamEvent> {
        self.queue.subscribe()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub async fn result(self) -> Result<JsonOutcome<T>, LlmError> {
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

/// Open a streaming JSON call for `T`.
pub fn stream_json<T>(req: JsonRequest) -> Result<JsonCall<T>, LlmError>
where
    T: DeserializeOwned + JsonSchema + Send + 'static,
{
    let provider = Provider::classify(&req.model)?;
    let schema = serde_json::to_value(schemars::schema_for!(T))
        .map_err(|e| LlmError::invalid_argument(format!("unserializable schema: {e}")))?;

    let abort = AbortHandle::fan_in(req.abort.as_ref());
    let queue = Arc::new(EventQueue::new());

    let task_queue = Arc::clone(&queue);
    let task_abort = abort.clone();
    let handle =
        tokio::spawn(
            async move { run_json::<T>(req, provider, schema, task_queue, task_abort).await },
        );

    Ok(JsonCall {
        queue,
        handle,
        abort,
    })
}

/// Drain wrapper around [`stream_json`].
pub async fn generate_json<T>(req: JsonRequest) -> Result<T, LlmError>
where
    T: DeserializeOwned + JsonSchema + Send + 'static,
{
    Ok(stream_json::<T>(req)?.result().await?.value)
}

async fn run_json<T>(
    req: JsonRequest,
    provider: Provider,
    schema: Value,
    queue: Arc<EventQueue<StreamEvent>>,
    abort: AbortHandle,
) -> Result<JsonOutcome<T>, LlmError>
where
    T: DeserializeOwned + JsonSchema + Send + 'static,
{
    let mut failures: Vec<JsonAttemptFailure> = Vec::new();
    let max_attempts = req.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if abort.is_aborted() {
            let err = LlmError::cancelled(abort.reason());
            queue.fail(Arc::new(err.clone()));
            return Err(err);
        }

        // ChatGPT: after a failed strict attempt, fall back to free text
        // plus post-parsing.
        let strict_failed = !failures.is_empty();
        let response_format = if provider == Provider::ChatGpt && strict_failed {
            None
        } else {
            Some(ResponseFormat::JsonSchema {
                name: "response".into(),
                schema: schema.clone(),
                strict: true,
            })
        };

        let inner = match stream_text(TextRequest {
            model: req.model.clone(),
            prompt: req.prompt.clone(),
            effort: req.effort,
            model_tools: Vec::new(),
            response_format,
            abort: Some(abort.clone()),
        }) {
            Ok(call) => call,
            Err(err) => {
                queue.fail(Arc::new(err.clone()));
                return Err(err);
            }
        };

        // Pump inner events into the outer queue, overlaying partial
        // snapshots as the response channel grows.
        let mut inner_events = inner.events();
        let mut buf = String::new();
        let mut last_snapshot: Option<String> = None;
        while let Some(event) = inner_events.next().await {
            match event {
                Ok(StreamEvent::Delta {
                    channel: Channel::Response,
                    text,
                }) => {
                    buf.push_str(&text);
                    queue.push(StreamEvent::Delta {
                        channel: Channel::Response,
                        text,
                    });
                    if let Some(snapshot) = parse_partial_json(&buf) {
                        let serialized = snapshot.to_string();
                        if last_snapshot.as_deref() != Some(serialized.as_str()) {
                            last_snapshot = Some(serialized);
                            queue.push(StreamEvent::Json {
                                stage: JsonStage::Partial,
                                value: snapshot,
                            });
                        }
                    }
                }
                Ok(other) => queue.push(other),
                // Terminal error: surfaced through the result below.
                Err(_) => break,
            }
        }

        let text_result = match inner.result().await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => {
                queue.fail(Arc::new(err.clone()));
                return Err(err);
            }
            Err(err) => {
                // A strict-format rejection from the ChatGPT backend counts
                // as a failed attempt and triggers the free-text fallback;
                // other provider errors are not retried here.
                if provider == Provider::ChatGpt && attempt < max_attempts {
                    warn!(attempt, error = %err, "strict JSON attempt failed, retrying without format");
                    failures.push(JsonAttemptFailure {
                        attempt,
                        raw_text: buf,
                        error: err.to_string(),
                    });
                    continue;
                }
                queue.fail(Arc::new(err.clone()));
                return Err(err);
            }
        };

        match finalize::<T>(&text_result.text, req.normalize.as_ref()) {
            Ok((value, json_value)) => {
                queue.push(StreamEvent::Json {
                    stage: JsonStage::Final,
                    value: json_value,
                });
                queue.close();
                return Ok(JsonOutcome {
                    value,
                    raw: text_result,
                    attempts: attempt,
                });
            }
            Err(reason) => {
                warn!(attempt, %reason, "JSON attempt failed validation");
                failures.push(JsonAttemptFailure {
                    attempt,
                    raw_text: text_result.text,
                    error: reason,
                });
            }
        }
    }

    let last = failures.last();
    let err = LlmError::SchemaValidation {
        message: format!(
            "no valid JSON after {max_attempts} attempts; last error: {}; preview: {}",
            last.map(|f| f.error.clone()).unwrap_or_default(),
            preview(last.map(|f| f.raw_text.as_str()).unwrap_or_default()),
        ),
        attempts: failures,
    };
    queue.fail(Arc::new(err.clone()));
    Err(err)
}

/// Normalize, parse, hook, and validate the finalized text.
fn finalize<T: DeserializeOwned>(
    text: &str,
    normalize: Option<&NormalizeJson>,
) -> Result<(T, Value), String> {
    let normalized_text =
        normalize_json_text(text).ok_or_else(|| "no JSON value in response".to_string())?;
    let mut value: Value = serde_json::from_str(&normalized_text)
        .map_err(|e| format!("JSON parse failed: {e}"))?;
    if let Some(hook) = normalize {
        value = hook(value);
    }
    let typed: T = serde_json::from_value(value.clone())
        .map_err(|e| format!("schema validation failed: {e}"))?;
    Ok((typed, value))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
