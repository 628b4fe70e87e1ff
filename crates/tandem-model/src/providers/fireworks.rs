// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fireworks driver — OpenAI-style chat completions, single-object response.
//!
//! Fireworks is the one provider here that does not stream: the response
//! arrives as one JSON object and is decomposed into normalized events
//! (model version, one text delta, tool calls, usage, done) so downstream
//! consumers see the same event vocabulary everywhere.  Multi-turn tool use
//! appends an assistant `tool_calls` message plus one `role: tool` message
//! per call to the accumulated message array.

use futures::stream;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::LlmError;
use crate::schema;
use crate::content::{Content, Part, Role, ToolDeclKind, Usage};

use super::{
    api_key, http_client, ProviderEvent, ProviderRequest, ProviderStream, ResponseFormat,
    TurnInput,
};

const CHAT_URL: &str = "https://api.fireworks.ai/inference/v1/chat/completions";

pub(crate) async fn open(req: &ProviderRequest) -> Result<ProviderStream, LlmError> {
    let key = api_key("FIREWORKS_API_KEY", "fireworks")?;
    let body = chat_body(req)?;

    debug!(model = %req.model, tool_count = req.tools.len(), "sending Fireworks request");

    let resp = http_client()
        .post(CHAT_URL)
        .bearer_auth(&key)
        .json(&body)
        .send()
        .await
        .map_err(|e| LlmError::provider("fireworks", None, format!("request failed: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::provider("fireworks", Some(status), text));
    }

    let body: Value = resp
        .json()
        .await
        .map_err(|e| LlmError::provider("fireworks", None, format!("malformed response: {e}")))?;

    let events = decompose_response(&body);
    Ok(Box::pin(stream::iter(events)))
}

pub(crate) fn chat_body(req: &ProviderRequest) -> Result<Value, LlmError> {
    let messages = match &req.turn {
        TurnInput::Contents(contents) => {
            encode_messages(contents, req.instructions.as_deref())
        }
        TurnInput::FireworksMessages(messages) => messages.clone(),
        _ => {
            return Err(LlmError::invalid_argument(
                "continuation shape does not belong to the fireworks provider",
            ));
        }
    };

    let mut body = json!({
        "model": req.model,
        "messages": messages,
    });

    if !req.tools.is_empty() {
        let tools: Result<Vec<Value>, LlmError> = req
            .tools
            .iter()
            .map(|t| match &t.kind {
                ToolDeclKind::Function { parameters } => Ok(json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": schema::for_fireworks(parameters),
                    }
                })),
                ToolDeclKind::Custom { .. } => Err(LlmError::invalid_argument(format!(
                    "custom tool '{}' is not supported by the fireworks provider",
                    t.name
                ))),
            })
            .collect();
        body["tools"] = Value::Array(tools?);
        body["tool_choice"] = json!("auto");
        body["parallel_tool_calls"] = json!(true);
    }

    match &req.response_format {
        Some(ResponseFormat::JsonSchema { schema: s, .. }) => {
            body["response_format"] = json!({
                "type": "json_object",
                "schema": schema::for_fireworks(s),
            });
        }
        Some(ResponseFormat::JsonObject) => {
            body["response_format"] = json!({ "type": "json_object" });
        }
        None => {}
    }

    Ok(body)
}

/// Encode canonical contents into chat messages.  `instructions` becomes a
/// leading system message.
pub fn encode_messages(contents: &[Content], instructions: Option<&str>) -> Vec<Value> {
    let mut messages = Vec::with_capacity(contents.len() + 1);
    if let Some(instructions) = instructions {
        messages.push(json!({ "role": "system", "content": instructions }));
    }
    for content in contents {
        let role = match content.role {
            Role::System | Role::Developer => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let has_inline = content
            .parts
            .iter()
            .any(|p| matches!(p, Part::InlineData { .. }));
        let content_value = if has_inline {
            let parts: Vec<Value> = content
                .parts
                .iter()
                .map(|p| match p {
                    Part::Text { text, .. } => json!({ "type": "text", "text": text }),
                    Part::InlineData { data, mime_type } => {
                        let mime = mime_type.as_deref().unwrap_or("application/octet-stream");
                        json!({
                            "type": "image_url",
                            "image_url": { "url": format!("data:{mime};base64,{data}") }
                        })
                    }
                })
                .collect();
            Value::Array(parts)
        } else {
            Value::String(content.channel_text(false))
        };
        messages.push(json!({ "role": role, "content": content_value }));
    }
    messages
}

/// Assistant message carrying the model's tool calls, appended before the
/// per-call results on the next turn.
pub fn assistant_tool_calls_message(calls: &[(String, String, String)]) -> Value {
    let tool_calls: Vec<Value> = calls
        .iter()
        .map(|(id, name, arguments)| {
            json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": arguments },
            })
        })
        .collect();
    json!({ "role": "assistant", "content": Value::Null, "tool_calls": tool_calls })
}

/// One `role: tool` message per executed call.
pub fn tool_result_message(tool_call_id: &str, output: &str) -> Value {
    json!({
        "role": "tool",
        "tool_call_id": tool_call_id,
        "content": output,
    })
}

/// Turn the single response object into the normalized event sequence.
fn decompose_response(body: &Value) -> Vec<Result<ProviderEvent, LlmError>> {
    let mut events = Vec::new();

    if let Some(model) = body["model"].as_str() {
        events.push(Ok(ProviderEvent::ModelVersion(model.to_string())));
    }

    let choice = &body["choices"][0];
    if choice["finish_reason"].as_str() == Some("content_filter") {
        events.push(Ok(ProviderEvent::Blocked));
    }

    let message = &choice["message"];
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            events.push(Ok(ProviderEvent::TextDelta(text.to_string())));
        }
    }
    if let Some(reasoning) = message["reasoning_content"].as_str() {
        if !reasoning.is_empty() {
            events.push(Ok(ProviderEvent::ThoughtDelta(reasoning.to_string())));
        }
    }

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for (index, call) in tool_calls.iter().enumerate() {
            events.push(Ok(ProviderEvent::ToolCall {
                index: index as u32,
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments: call["function"]["arguments"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                custom: false,
            }));
        }
    }

    if let Some(usage) = body.get("usage").filter(|u| !u.is_null()) {
        events.push(Ok(ProviderEvent::Usage(Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64(),
            cached_tokens: usage["prompt_tokens_details"]["cached_tokens"].as_u64(),
            response_tokens: usage["completion_tokens"].as_u64(),
            thinking_tokens: usage["completion_tokens_details"]["reasoning_tokens"].as_u64(),
            total_tokens: usage["total_tokens"].as_u64(),
            response_image_tokens: None,
            tool_use_prompt_tokens: None,
        })));
    }

    events.push(Ok(ProviderEvent::Done));
    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ToolDecl;

    const MODEL: &str = "accounts/fireworks/models/deepseek-v3p1";

    #[test]
    fn body_carries_parallel_tool_calls() {
        let mut req = ProviderRequest::new(MODEL, vec![Content::user("hi")]);
        req.tools.push(ToolDecl {
            name: "calc".into(),
            description: "calculate".into(),
            kind: ToolDeclKind::Function {
                parameters: json!({"type": "object"}),
            },
        });
        let body = chat_body(&req).unwrap();
        assert_eq!(body["model"], json!(MODEL));
        assert_eq!(body["tool_choice"], json!("auto"));
        assert_eq!(body["parallel_tool_calls"], json!(true));
        assert_eq!(body["tools"][0]["function"]["name"], json!("calc"));
    }

    #[test]
    fn instructions_become_leading_system_message() {
        let mut req = ProviderRequest::new(MODEL, vec![Content::user("hi")]);
        req.instructions = Some("be brief".into());
        let body = chat_body(&req).unwrap();
        assert_eq!(body["messages"][0]["role"], json!("system"));
        assert_eq!(body["messages"][0]["content"], json!("be brief"));
    }

    #[test]
    fn continuation_messages_are_sent_verbatim() {
        let mut req = ProviderRequest::new(MODEL, vec![]);
        req.turn = TurnInput::FireworksMessages(vec![
            json!({"role": "user", "content": "hi"}),
            assistant_tool_calls_message(&[(
                "call_1".into(),
                "calc".into(),
                "{\"x\":1}".into(),
            )]),
            tool_result_message("call_1", "2"),
        ]);
        let body = chat_body(&req).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["tool_calls"][0]["id"], json!("call_1"));
        assert_eq!(messages[2]["role"], json!("tool"));
        assert_eq!(messages[2]["tool_call_id"], json!("call_1"));
    }

    #[test]
    fn response_decomposes_into_normalized_events() {
        let body = json!({
            "model": "deepseek-v3p1-fw",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": "calling now",
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "calc", "arguments": "{\"x\":1}" }
                    }]
                }
            }],
            "usage": {
                "prompt_tokens": 20,
                "completion_tokens": 5,
                "total_tokens": 25,
                "completion_tokens_details": { "reasoning_tokens": 2 }
            }
        });
        let events: Vec<ProviderEvent> = decompose_response(&body)
            .into_iter()
            .map(|e| e.unwrap())
            .collect();
        assert!(matches!(&events[0], ProviderEvent::ModelVersion(m) if m == "deepseek-v3p1-fw"));
        assert!(matches!(&events[1], ProviderEvent::TextDelta(t) if t == "calling now"));
        assert!(
            matches!(&events[2], ProviderEvent::ToolCall { id, name, .. } if id == "call_9" && name == "calc")
        );
        match &events[3] {
            ProviderEvent::Usage(u) => {
                assert_eq!(u.prompt_tokens, Some(20));
                assert_eq!(u.response_tokens, Some(5));
                assert_eq!(u.thinking_tokens, Some(2));
            }
            other => panic!("expected usage, got {other:?}"),
        }
        assert!(matches!(events.last().unwrap(), ProviderEvent::Done));
    }

    #[test]
    fn content_filter_maps_to_blocked() {
        let body = json!({
            "choices": [{ "finish_reason": "content_filter", "message": {} }]
        });
        let events: Vec<ProviderEvent> = decompose_response(&body)
            .into_iter()
            .map(|e| e.unwrap())
            .collect();
        assert!(events.iter().any(|e| matches!(e, ProviderEvent::Blocked)));
    }

    #[test]
    fn image_parts_become_image_url_entries() {
        let content = Content {
            role: Role::User,
            parts: vec![
                Part::text("see"),
                Part::inline_data("QUJD", Some("image/jpeg".into())),
            ],
        };
        let messages = encode_messages(&[content], None);
        let parts = messages[0]["content"].as_array().unwrap();
        assert_eq!(parts[1]["type"], json!("image_url"));
        assert_eq!(
            parts[1]["image_url"]["url"],
            json!("data:image/jpeg;base64,QUJD")
        );
    }
}
