// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI Responses driver — JSON over SSE.
//!
//! Multi-turn continuation reuses `previous_response_id`; only the new items
//! (tool outputs) are sent on follow-up turns.  The request/stream vocabulary
//! is shared with the ChatGPT-backed driver, which layers its own fields on
//! top (see `chatgpt.rs`).

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::catalog::wire_model;
use crate::error::LlmError;
use crate::schema;
use crate::content::{Content, ModelTool, Part, Role, ToolDeclKind, Usage, WebSearchMode};

use super::{
    api_key, drain_sse_lines, http_client, ProviderEvent, ProviderRequest, ProviderStream,
    ResponseFormat, TurnInput,
};

const RESPONSES_URL: &str = "https://api.openai.com/v1/responses";

pub(crate) async fn open(req: &ProviderRequest) -> Result<ProviderStream, LlmError> {
    let key = api_key("OPENAI_API_KEY", "openai")?;
    let body = responses_body(req, false)?;

    debug!(model = %req.model, tool_count = req.tools.len(), "sending OpenAI Responses request");

    let resp = http_client()
        .post(RESPONSES_URL)
        .bearer_auth(&key)
        .json(&body)
        .send()
        .await
        .map_err(|e| LlmError::provider("openai", None, format!("request failed: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::provider("openai", Some(status), text));
    }

    Ok(sse_event_stream(resp, "openai"))
}

/// Wrap an SSE response body into a normalized event stream.
pub(crate) fn sse_event_stream(resp: reqwest::Response, provider: &'static str) -> ProviderStream {
    let byte_stream = resp.bytes_stream();
    let stream = byte_stream
        .scan(
            (String::new(), ResponsesSseParser::new()),
            move |(buf, parser), chunk| {
                let events: Vec<Result<ProviderEvent, LlmError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        drain_sse_lines(buf, |data| parser.parse_data(data))
                    }
                    Err(e) => vec![Err(LlmError::provider(
                        provider,
                        None,
                        format!("stream error: {e}"),
                    ))],
                };
                std::future::ready(Some(events))
            },
        )
        .flat_map(futures::stream::iter);
    Box::pin(stream)
}

/// Build the Responses request body.  `chatgpt` layers on the backend's
/// extra fields: `store=false`, `prompt_cache_key`, top-level `instructions`.
pub(crate) fn responses_body(req: &ProviderRequest, chatgpt: bool) -> Result<Value, LlmError> {
    let expected = if chatgpt { "chatgpt" } else { "openai" };
    let mut body = json!({
        "model": wire_model(&req.model),
        "stream": true,
        "reasoning": {
            "effort": req.effort.wire_value(),
            "summary": "auto",
        },
        "text": { "verbosity": req.effort.wire_value() },
        "include": ["reasoning.encrypted_content"],
    });

    match (&req.turn, chatgpt) {
        (TurnInput::Contents(contents), false) => {
            body["input"] = Value::Array(encode_contents(contents, req.instructions.as_deref()));
        }
        (TurnInput::Contents(contents), true) => {
            body["input"] = Value::Array(encode_contents(contents, None));
        }
        (
            TurnInput::OpenAiFollowUp {
                previous_response_id,
                items,
            },
            false,
        ) => {
            body["previous_response_id"] = json!(previous_response_id);
            body["input"] = Value::Array(items.clone());
        }
        (TurnInput::ChatGptItems(items), true) => {
            body["input"] = Value::Array(items.clone());
        }
        _ => {
            return Err(LlmError::invalid_argument(format!(
                "continuation shape does not belong to the {expected} provider"
            )));
        }
    }

    if chatgpt {
        body["store"] = json!(false);
        if let Some(instructions) = &req.instructions {
            body["instructions"] = json!(instructions);
        }
        if let Some(cache_key) = &req.conversation_id {
            body["prompt_cache_key"] = json!(cache_key);
        }
    }

    let mut tools: Vec<Value> = req.model_tools.iter().map(model_tool_item).collect();
    for tool in &req.tools {
        tools.push(match &tool.kind {
            ToolDeclKind::Function { parameters } => json!({
                "type": "function",
                "name": tool.name,
                "description": tool.description,
                "parameters": schema::for_openai(parameters),
                "strict": true,
            }),
            ToolDeclKind::Custom { format } => {
                let mut item = json!({
                    "type": "custom",
                    "name": tool.name,
                    "description": tool.description,
                });
                if let Some(fmt) = format {
                    item["format"] = json!(fmt);
                }
                item
            }
        });
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools);
    }

    match &req.response_format {
        Some(ResponseFormat::JsonSchema {
            name,
            schema: s,
            strict,
        }) => {
            body["text"]["format"] = json!({
                "type": "json_schema",
                "name": name,
                "schema": schema::for_openai(s),
                "strict": strict,
            });
        }
        Some(ResponseFormat::JsonObject) => {
            body["text"]["format"] = json!({ "type": "json_object" });
        }
        None => {}
    }

    Ok(body)
}

fn model_tool_item(tool: &ModelTool) -> Value {
    match tool {
        ModelTool::WebSearch {
            mode: WebSearchMode::Cached,
        } => json!({ "type": "web_search_preview" }),
        ModelTool::WebSearch {
            mode: WebSearchMode::Live,
        } => json!({ "type": "web_search" }),
        ModelTool::CodeExecution => json!({
            "type": "code_interpreter",
            "container": { "type": "auto" },
        }),
    }
}

/// Encode canonical contents into Responses input items.  `instructions`
/// becomes a leading system message when provided.
pub fn encode_contents(contents: &[Content], instructions: Option<&str>) -> Vec<Value> {
    let mut items = Vec::with_capacity(contents.len() + 1);
    if let Some(instructions) = instructions {
        items.push(json!({
            "type": "message",
            "role": "system",
            "content": [{ "type": "input_text", "text": instructions }],
        }));
    }
    for content in contents {
        let role = match content.role {
            Role::System => "system",
            Role::Developer => "developer",
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
        };
        let assistant = content.role == Role::Assistant;
        let parts: Vec<Value> = content
            .parts
            .iter()
            .map(|p| match p {
                Part::Text { text, .. } if assistant => json!({
                    "type": "output_text",
                    "text": text,
                }),
                Part::Text { text, .. } => json!({
                    "type": "input_text",
                    "text": text,
                }),
                Part::InlineData { data, mime_type } => {
                    let mime = mime_type.as_deref().unwrap_or("application/octet-stream");
                    let url = format!("data:{mime};base64,{data}");
                    if p.is_image() {
                        json!({ "type": "input_image", "image_url": url })
                    } else {
                        json!({ "type": "input_file", "file_data": url })
                    }
                }
            })
            .collect();
        items.push(json!({ "type": "message", "role": role, "content": parts }));
    }
    items
}

/// Tool-output item for the next turn of a function call.  `output` is a
/// string — JSON-serialized when the tool returned structured data.
pub fn function_call_output_item(call_id: &str, output: &str) -> Value {
    json!({
        "type": "function_call_output",
        "call_id": call_id,
        "output": output,
    })
}

/// Tool-output item for the next turn of a custom tool call.
pub fn custom_tool_call_output_item(call_id: &str, output: &str) -> Value {
    json!({
        "type": "custom_tool_call_output",
        "call_id": call_id,
        "output": output,
    })
}

// ─── SSE parsing ──────────────────────────────────────────────────────────────

/// Incremental parser over Responses SSE `data:` payloads.
///
/// Tracks whether deltas were observed so that a final response with no
/// streamed deltas (rare, but allowed by the protocol) still yields text and
/// thought events synthesized from the terminal `response.completed` payload.
pub(crate) struct ResponsesSseParser {
    emitted_text: bool,
    emitted_thought: bool,
    emitted_model: bool,
    emitted_blocked: bool,
    tool_index: u32,
}

impl ResponsesSseParser {
    pub(crate) fn new() -> Self {
        Self {
            emitted_text: false,
            emitted_thought: false,
            emitted_model: false,
            emitted_blocked: false,
            tool_index: 0,
        }
    }

    pub(crate) fn parse_data(&mut self, data: &str) -> Vec<Result<ProviderEvent, LlmError>> {
        let Ok(v) = serde_json::from_str::<Value>(data) else {
            return vec![];
        };
        let Some(kind) = v["type"].as_str() else {
            return vec![];
        };
        match kind {
            "response.created" => {
                let mut events = Vec::new();
                if let Some(id) = v["response"]["id"].as_str() {
                    events.push(Ok(ProviderEvent::ResponseId(id.to_string())));
                }
                if !self.emitted_model {
                    if let Some(model) = v["response"]["model"].as_str() {
                        self.emitted_model = true;
                        events.push(Ok(ProviderEvent::ModelVersion(model.to_string())));
                    }
                }
                events
            }
            "response.output_text.delta" => match v["delta"].as_str() {
                Some(delta) if !delta.is_empty() => {
                    self.emitted_text = true;
                    vec![Ok(ProviderEvent::TextDelta(delta.to_string()))]
                }
                _ => vec![],
            },
            "response.reasoning_summary_text.delta" => match v["delta"].as_str() {
                Some(delta) if !delta.is_empty() => {
                    self.emitted_thought = true;
                    vec![Ok(ProviderEvent::ThoughtDelta(delta.to_string()))]
                }
                _ => vec![],
            },
            "response.refusal.delta" => {
                if self.emitted_blocked {
                    vec![]
                } else {
                    self.emitted_blocked = true;
                    vec![Ok(ProviderEvent::Blocked)]
                }
            }
            "response.completed" => self.parse_completed(&v["response"]),
            "response.failed" => {
                let message = v["response"]["error"]["message"]
                    .as_str()
                    .unwrap_or("response failed")
                    .to_string();
                vec![Err(LlmError::provider("openai", None, message))]
            }
            _ => vec![],
        }
    }

    fn parse_completed(&mut self, response: &Value) -> Vec<Result<ProviderEvent, LlmError>> {
        let mut events = Vec::new();

        if let Some(id) = response["id"].as_str() {
            events.push(Ok(ProviderEvent::ResponseId(id.to_string())));
        }
        if !self.emitted_model {
            if let Some(model) = response["model"].as_str() {
                self.emitted_model = true;
                events.push(Ok(ProviderEvent::ModelVersion(model.to_string())));
            }
        }

        if let Some(output) = response["output"].as_array() {
            for item in output {
                match item["type"].as_str() {
                    Some("message") => {
                        // Fallback path: synthesize deltas only when none
                        // streamed, so aggregate text matches streaming
                        // reality without duplication.
                        if !self.emitted_text {
                            let text: String = item["content"]
                                .as_array()
                                .into_iter()
                                .flatten()
                                .filter(|c| c["type"].as_str() == Some("output_text"))
                                .filter_map(|c| c["text"].as_str())
                                .collect();
                            if !text.is_empty() {
                                self.emitted_text = true;
                                events.push(Ok(ProviderEvent::TextDelta(text)));
                            }
                        }
                    }
                    Some("reasoning") => {
                        if !self.emitted_thought {
                            let text: String = item["summary"]
                                .as_array()
                                .into_iter()
                                .flatten()
                                .filter_map(|s| s["text"].as_str())
                                .collect();
                            if !text.is_empty() {
                                self.emitted_thought = true;
                                events.push(Ok(ProviderEvent::ThoughtDelta(text)));
                            }
                        }
                    }
                    Some("function_call") => {
                        let index = self.tool_index;
                        self.tool_index += 1;
                        events.push(Ok(ProviderEvent::ToolCall {
                            index,
                            id: item["call_id"].as_str().unwrap_or_default().to_string(),
                            name: item["name"].as_str().unwrap_or_default().to_string(),
                            arguments: item["arguments"].as_str().unwrap_or_default().to_string(),
                            custom: false,
                        }));
                    }
                    Some("custom_tool_call") => {
                        let index = self.tool_index;
                        self.tool_index += 1;
                        events.push(Ok(ProviderEvent::ToolCall {
                            index,
                            id: item["call_id"].as_str().unwrap_or_default().to_string(),
                            name: item["name"].as_str().unwrap_or_default().to_string(),
                            arguments: item["input"].as_str().unwrap_or_default().to_string(),
                            custom: true,
                        }));
                    }
                    _ => {}
                }
            }
        }

        if let Some(usage) = response.get("usage").filter(|u| !u.is_null()) {
            events.push(Ok(ProviderEvent::Usage(parse_usage(usage))));
        }
        events.push(Ok(ProviderEvent::Done));
        events
    }
}

fn parse_usage(usage: &Value) -> Usage {
    Usage {
        prompt_tokens: usage["input_tokens"].as_u64(),
        cached_tokens: usage["input_tokens_details"]["cached_tokens"].as_u64(),
        response_tokens: usage["output_tokens"].as_u64(),
        thinking_tokens: usage["output_tokens_details"]["reasoning_tokens"].as_u64(),
        total_tokens: usage["total_tokens"].as_u64(),
        response_image_tokens: None,
        tool_use_prompt_tokens: None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ToolDecl;

    fn base_request() -> ProviderRequest {
        ProviderRequest::new("gpt-5", vec![Content::user("hello")])
    }

    #[test]
    fn body_carries_reasoning_and_include() {
        let body = responses_body(&base_request(), false).unwrap();
        assert_eq!(body["model"], json!("gpt-5"));
        assert_eq!(body["reasoning"]["effort"], json!("high"));
        assert_eq!(body["reasoning"]["summary"], json!("auto"));
        assert_eq!(body["include"], json!(["reasoning.encrypted_content"]));
        assert!(body.get("store").is_none());
    }

    #[test]
    fn instructions_become_leading_system_message() {
        let mut req = base_request();
        req.instructions = Some("be brief".into());
        let body = responses_body(&req, false).unwrap();
        let input = body["input"].as_array().unwrap();
        assert_eq!(input[0]["role"], json!("system"));
        assert_eq!(input[0]["content"][0]["text"], json!("be brief"));
        assert_eq!(input[1]["role"], json!("user"));
    }

    #[test]
    fn follow_up_reuses_previous_response_id() {
        let mut req = base_request();
        req.turn = TurnInput::OpenAiFollowUp {
            previous_response_id: "resp_1".into(),
            items: vec![function_call_output_item("fc-1", "\"ok\"")],
        };
        let body = responses_body(&req, false).unwrap();
        assert_eq!(body["previous_response_id"], json!("resp_1"));
        assert_eq!(body["input"][0]["type"], json!("function_call_output"));
        assert_eq!(body["input"][0]["call_id"], json!("fc-1"));
    }

    #[test]
    fn function_tools_are_strict() {
        let mut req = base_request();
        req.tools.push(ToolDecl {
            name: "calc".into(),
            description: "calculate".into(),
            kind: ToolDeclKind::Function {
                parameters: json!({"type": "object", "properties": {"x": {"type": "number"}}}),
            },
        });
        let body = responses_body(&req, false).unwrap();
        let tool = &body["tools"][0];
        assert_eq!(tool["type"], json!("function"));
        assert_eq!(tool["strict"], json!(true));
        assert_eq!(tool["parameters"]["additionalProperties"], json!(false));
    }

    #[test]
    fn image_parts_encode_as_input_image() {
        let content = Content {
            role: Role::User,
            parts: vec![
                Part::text("look"),
                Part::inline_data("QUJD", Some("image/png".into())),
                Part::inline_data("QUJD", Some("application/pdf".into())),
            ],
        };
        let items = encode_contents(&[content], None);
        let parts = items[0]["content"].as_array().unwrap();
        assert_eq!(parts[1]["type"], json!("input_image"));
        assert_eq!(parts[1]["image_url"], json!("data:image/png;base64,QUJD"));
        assert_eq!(parts[2]["type"], json!("input_file"));
    }

    #[test]
    fn assistant_history_uses_output_text() {
        let items = encode_contents(&[Content::assistant("earlier reply")], None);
        assert_eq!(items[0]["content"][0]["type"], json!("output_text"));
    }

    #[test]
    fn sse_deltas_and_completion_parse() {
        let mut p = ResponsesSseParser::new();
        let created = p.parse_data(
            r#"{"type":"response.created","response":{"id":"resp_9","model":"gpt-5-2026-01"}}"#,
        );
        assert!(matches!(
            created[0].as_ref().unwrap(),
            ProviderEvent::ResponseId(id) if id == "resp_9"
        ));
        assert!(matches!(
            created[1].as_ref().unwrap(),
            ProviderEvent::ModelVersion(m) if m == "gpt-5-2026-01"
        ));

        let deltas =
            p.parse_data(r#"{"type":"response.output_text.delta","delta":"Hello"}"#);
        assert!(matches!(
            deltas[0].as_ref().unwrap(),
            ProviderEvent::TextDelta(t) if t == "Hello"
        ));

        let completed = p.parse_data(
            r#"{"type":"response.completed","response":{"id":"resp_9","model":"gpt-5-2026-01","output":[{"type":"message","content":[{"type":"output_text","text":"Hello"}]}],"usage":{"input_tokens":12,"input_tokens_details":{"cached_tokens":4},"output_tokens":3,"output_tokens_details":{"reasoning_tokens":1},"total_tokens":15}}}"#,
        );
        // Text already streamed: no synthesized delta, just id + usage + done.
        let has_delta = completed
            .iter()
            .any(|e| matches!(e.as_ref().unwrap(), ProviderEvent::TextDelta(_)));
        assert!(!has_delta, "must not duplicate streamed text");
        let usage = completed.iter().find_map(|e| match e.as_ref().unwrap() {
            ProviderEvent::Usage(u) => Some(u.clone()),
            _ => None,
        });
        let usage = usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(12));
        assert_eq!(usage.cached_tokens, Some(4));
        assert_eq!(usage.thinking_tokens, Some(1));
        assert!(matches!(
            completed.last().unwrap().as_ref().unwrap(),
            ProviderEvent::Done
        ));
    }

    #[test]
    fn completion_without_deltas_synthesizes_text() {
        let mut p = ResponsesSseParser::new();
        let completed = p.parse_data(
            r#"{"type":"response.completed","response":{"output":[{"type":"message","content":[{"type":"output_text","text":"All at once"}]}]}}"#,
        );
        assert!(completed.iter().any(|e| matches!(
            e.as_ref().unwrap(),
            ProviderEvent::TextDelta(t) if t == "All at once"
        )));
    }

    #[test]
    fn tool_calls_parse_from_completed_output() {
        let mut p = ResponsesSseParser::new();
        let completed = p.parse_data(
            r#"{"type":"response.completed","response":{"output":[{"type":"function_call","call_id":"call_1","name":"apply_patch","arguments":"{\"patch\":\"x\"}"},{"type":"custom_tool_call","call_id":"call_2","name":"fmt","input":"raw text"}]}}"#,
        );
        let calls: Vec<_> = completed
            .iter()
            .filter_map(|e| match e.as_ref().unwrap() {
                ProviderEvent::ToolCall {
                    index,
                    name,
                    custom,
                    ..
                } => Some((*index, name.clone(), *custom)),
                _ => None,
            })
            .collect();
        assert_eq!(
            calls,
            vec![
                (0, "apply_patch".to_string(), false),
                (1, "fmt".to_string(), true)
            ]
        );
    }

    #[test]
    fn refusal_emits_blocked_once() {
        let mut p = ResponsesSseParser::new();
        let first = p.parse_data(r#"{"type":"response.refusal.delta","delta":"I"}"#);
        let second = p.parse_data(r#"{"type":"response.refusal.delta","delta":" cannot"}"#);
        assert!(matches!(first[0].as_ref().unwrap(), ProviderEvent::Blocked));
        assert!(second.is_empty());
    }
}
