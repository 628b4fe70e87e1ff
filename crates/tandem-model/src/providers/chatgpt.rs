// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! ChatGPT-backed Responses driver.
//!
//! Same item vocabulary as the OpenAI Responses API with three differences:
//! `store=false` plus a `prompt_cache_key` pin the conversation to a cached
//! prefix instead of server-side storage, `instructions` is a dedicated
//! request field, and every request carries a per-process session id header.
//!
//! Because there is no `previous_response_id`, multi-turn tool use replays
//! the conversation items — including synthesized `function_call` /
//! `custom_tool_call` items with sanitized ids — on every turn.

use std::sync::OnceLock;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{is_retryable_transport, LlmError};
use crate::sanitize;

use super::openai::{responses_body, sse_event_stream};
use super::{api_key, http_client, ProviderRequest, ProviderStream};

const RESPONSES_URL: &str = "https://chatgpt.com/backend-api/codex/responses";

/// Transport retries around opening the response collection.
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_millis(250);

/// Stable per-process session id sent with every request.
fn session_id() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| uuid::Uuid::new_v4().to_string())
}

pub(crate) async fn open(req: &ProviderRequest) -> Result<ProviderStream, LlmError> {
    let token = api_key("CHATGPT_ACCESS_TOKEN", "chatgpt")?;
    let body = responses_body(req, true)?;

    debug!(model = %req.model, tool_count = req.tools.len(), "sending ChatGPT Responses request");

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match try_open(&token, &body).await {
            Ok(stream) => return Ok(stream),
            Err(LlmError::TransportRetryable(message)) => {
                if attempt >= MAX_ATTEMPTS {
                    // Wrapped as a provider error only once retries are
                    // exhausted.
                    return Err(LlmError::provider(
                        "chatgpt",
                        None,
                        format!("{message} (after {attempt} attempts)"),
                    ));
                }
                warn!(attempt, %message, "retrying ChatGPT request after transport error");
                tokio::time::sleep(BACKOFF_STEP * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn try_open(token: &str, body: &Value) -> Result<ProviderStream, LlmError> {
    let result = http_client()
        .post(RESPONSES_URL)
        .bearer_auth(token)
        .header("session_id", session_id())
        .json(body)
        .send()
        .await;

    let resp = match result {
        Ok(resp) => resp,
        Err(e) => {
            let message = format!("request failed: {e}");
            return Err(if is_retryable_transport(&message) {
                LlmError::TransportRetryable(message)
            } else {
                LlmError::provider("chatgpt", None, message)
            });
        }
    };

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::provider("chatgpt", Some(status), text));
    }

    Ok(sse_event_stream(resp, "chatgpt"))
}

/// Synthesized `function_call` item replayed into the conversation so that
/// its output can be attached on the next turn.
pub fn function_call_item(call_id: &str, name: &str, arguments: &str) -> Value {
    json!({
        "type": "function_call",
        "call_id": sanitize::function_call_id(call_id),
        "name": name,
        "arguments": arguments,
    })
}

/// Synthesized `custom_tool_call` item for replay.
pub fn custom_tool_call_item(call_id: &str, name: &str, input: &str) -> Value {
    json!({
        "type": "custom_tool_call",
        "call_id": sanitize::custom_tool_call_id(call_id),
        "name": name,
        "input": input,
    })
}

/// Output item paired with a replayed function call.
pub fn function_call_output_item(call_id: &str, output: &str) -> Value {
    json!({
        "type": "function_call_output",
        "call_id": sanitize::function_call_id(call_id),
        "output": output,
    })
}

/// Output item paired with a replayed custom tool call.
pub fn custom_tool_call_output_item(call_id: &str, output: &str) -> Value {
    json!({
        "type": "custom_tool_call_output",
        "call_id": sanitize::custom_tool_call_id(call_id),
        "output": output,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
