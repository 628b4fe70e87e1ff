// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Gemini driver — native Generative Language API.
//!
//! Uses `streamGenerateContent?alt=sse`.  Thinking deltas arrive as parts
//! marked `thought: true`; tool calls as `functionCall` parts; generated
//! images as `inlineData` parts.  Multi-turn tool use appends a `model`
//! content holding the function calls followed by a `user` content of
//! `functionResponse` parts.
//!
//! # Auth
//! API key via the `x-goog-api-key` header.

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::catalog;
use crate::error::LlmError;
use crate::schema;
use crate::content::{Content, ModelTool, Part, ReasoningEffort, Role, ToolDeclKind, Usage};

use super::{
    api_key, drain_sse_lines, http_client, ProviderEvent, ProviderRequest, ProviderStream,
    ResponseFormat, TurnInput,
};

const BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub(crate) async fn open(req: &ProviderRequest) -> Result<ProviderStream, LlmError> {
    let key = api_key("GEMINI_API_KEY", "gemini")?;
    let body = generate_content_body(req)?;
    let url = format!(
        "{BASE_URL}/v1beta/models/{}:streamGenerateContent?alt=sse",
        req.model
    );

    debug!(model = %req.model, tool_count = req.tools.len(), "sending Gemini request");

    let resp = http_client()
        .post(&url)
        .header("x-goog-api-key", &key)
        .json(&body)
        .send()
        .await
        .map_err(|e| LlmError::provider("gemini", None, format!("request failed: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::provider("gemini", Some(status), text));
    }

    let byte_stream = resp.bytes_stream();
    let stream = byte_stream
        .scan(
            (String::new(), GeminiSseParser::new()),
            move |(buf, parser), chunk| {
                let events: Vec<Result<ProviderEvent, LlmError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        drain_sse_lines(buf, |data| parser.parse_data(data))
                    }
                    Err(e) => vec![Err(LlmError::provider(
                        "gemini",
                        None,
                        format!("stream error: {e}"),
                    ))],
                };
                std::future::ready(Some(events))
            },
        )
        .flat_map(futures::stream::iter);
    Ok(Box::pin(stream))
}

pub(crate) fn generate_content_body(req: &ProviderRequest) -> Result<Value, LlmError> {
    let (contents, mut system_parts) = match &req.turn {
        TurnInput::Contents(canonical) => encode_contents(canonical),
        TurnInput::GeminiContents(contents) => (contents.clone(), Vec::new()),
        _ => {
            return Err(LlmError::invalid_argument(
                "continuation shape does not belong to the gemini provider",
            ));
        }
    };
    if let Some(instructions) = &req.instructions {
        system_parts.insert(0, json!({ "text": instructions }));
    }

    let max_output_tokens = catalog::lookup(&req.model)
        .map(|e| e.max_output_tokens)
        .unwrap_or(8192);

    let mut generation_config = json!({
        "maxOutputTokens": max_output_tokens,
        "thinkingConfig": {
            "includeThoughts": true,
            "thinkingBudget": thinking_budget(req.effort),
        },
    });
    match &req.response_format {
        Some(ResponseFormat::JsonSchema { schema: s, .. }) => {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseJsonSchema"] = schema::for_gemini(s);
        }
        Some(ResponseFormat::JsonObject) => {
            generation_config["responseMimeType"] = json!("application/json");
        }
        None => {}
    }
    if req.image_output {
        generation_config["responseModalities"] = json!(["TEXT", "IMAGE"]);
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({ "parts": system_parts });
    }

    let mut tools: Vec<Value> = Vec::new();
    for model_tool in &req.model_tools {
        tools.push(match model_tool {
            ModelTool::WebSearch { .. } => json!({ "googleSearch": {} }),
            ModelTool::CodeExecution => json!({ "codeExecution": {} }),
        });
    }
    let mut function_declarations: Vec<Value> = Vec::new();
    for tool in &req.tools {
        match &tool.kind {
            ToolDeclKind::Function { parameters } => function_declarations.push(json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": schema::for_gemini(parameters),
            })),
            ToolDeclKind::Custom { .. } => {
                return Err(LlmError::invalid_argument(format!(
                    "custom tool '{}' is not supported by the gemini provider",
                    tool.name
                )));
            }
        }
    }
    if !function_declarations.is_empty() {
        tools.push(json!({ "functionDeclarations": function_declarations }));
        body["toolConfig"] = json!({
            "functionCallingConfig": { "mode": "VALIDATED" }
        });
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools);
    }

    Ok(body)
}

/// Map the four-level effort enum onto a thinking-token budget.  `XHigh`
/// rides the `high` tier like everywhere else.
fn thinking_budget(effort: ReasoningEffort) -> u32 {
    match effort {
        ReasoningEffort::Low => 1024,
        ReasoningEffort::Medium => 8192,
        ReasoningEffort::High | ReasoningEffort::XHigh => 24576,
    }
}

/// Encode canonical contents.  System and developer roles are pulled out into
/// `systemInstruction` parts; everything else lands in the content array with
/// the `user` / `model` role vocabulary.
pub fn encode_contents(canonical: &[Content]) -> (Vec<Value>, Vec<Value>) {
    let mut contents = Vec::new();
    let mut system_parts = Vec::new();
    for content in canonical {
        match content.role {
            Role::System | Role::Developer => {
                let text = content.channel_text(false);
                if !text.is_empty() {
                    system_parts.push(json!({ "text": text }));
                }
            }
            Role::User | Role::Tool => {
                contents.push(json!({ "role": "user", "parts": encode_parts(&content.parts) }));
            }
            Role::Assistant => {
                contents.push(json!({ "role": "model", "parts": encode_parts(&content.parts) }));
            }
        }
    }
    (contents, system_parts)
}

fn encode_parts(parts: &[Part]) -> Vec<Value> {
    if parts.is_empty() {
        return vec![json!({ "text": "" })];
    }
    parts
        .iter()
        .map(|p| match p {
            Part::Text { text, thought } => {
                if *thought {
                    json!({ "text": text, "thought": true })
                } else {
                    json!({ "text": text })
                }
            }
            Part::InlineData { data, mime_type } => json!({
                "inlineData": {
                    "mimeType": mime_type.as_deref().unwrap_or("application/octet-stream"),
                    "data": data,
                }
            }),
        })
        .collect()
}

/// `model` content replaying the function calls of a turn.
pub fn function_call_content(calls: &[(String, Value, Option<String>)]) -> Value {
    let parts: Vec<Value> = calls
        .iter()
        .map(|(name, args, id)| {
            let mut fc = json!({ "name": name, "args": args });
            if let Some(id) = id {
                fc["id"] = json!(id);
            }
            json!({ "functionCall": fc })
        })
        .collect();
    json!({ "role": "model", "parts": parts })
}

/// `user` content carrying one `functionResponse` part per executed call.
/// Gemini requires the response payload to be an object; non-object values
/// are wrapped as `{"output": value}`.
pub fn function_response_content(responses: &[(String, Value)]) -> Value {
    let parts: Vec<Value> = responses
        .iter()
        .map(|(name, value)| {
            let response = if value.is_object() {
                value.clone()
            } else {
                json!({ "output": value })
            };
            json!({
                "functionResponse": { "name": name, "response": response }
            })
        })
        .collect();
    json!({ "role": "user", "parts": parts })
}

// ─── SSE parsing ──────────────────────────────────────────────────────────────

struct GeminiSseParser {
    emitted_model: bool,
    emitted_blocked: bool,
    tool_index: u32,
}

impl GeminiSseParser {
    fn new() -> Self {
        Self {
            emitted_model: false,
            emitted_blocked: false,
            tool_index: 0,
        }
    }

    fn parse_data(&mut self, data: &str) -> Vec<Result<ProviderEvent, LlmError>> {
        if data == "[DONE]" {
            return vec![Ok(ProviderEvent::Done)];
        }
        let Ok(v) = serde_json::from_str::<Value>(data) else {
            return vec![];
        };
        let mut events = Vec::new();

        if !self.emitted_model {
            if let Some(model) = v["modelVersion"].as_str() {
                self.emitted_model = true;
                events.push(Ok(ProviderEvent::ModelVersion(model.to_string())));
            }
        }

        if !self.emitted_blocked && !v["promptFeedback"]["blockReason"].is_null() {
            self.emitted_blocked = true;
            events.push(Ok(ProviderEvent::Blocked));
        }

        let candidate = &v["candidates"][0];
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(fc) = part.get("functionCall") {
                    let name = fc["name"].as_str().unwrap_or_default().to_string();
                    let id = fc["id"].as_str().unwrap_or(&name).to_string();
                    let args = serde_json::to_string(&fc["args"]).unwrap_or_default();
                    let index = self.tool_index;
                    self.tool_index += 1;
                    events.push(Ok(ProviderEvent::ToolCall {
                        index,
                        id,
                        name,
                        arguments: args,
                        custom: false,
                    }));
                    continue;
                }
                if let Some(inline) = part.get("inlineData") {
                    events.push(Ok(ProviderEvent::InlineData {
                        data: inline["data"].as_str().unwrap_or_default().to_string(),
                        mime_type: inline["mimeType"].as_str().map(str::to_string),
                    }));
                    continue;
                }
                if let Some(text) = part["text"].as_str() {
                    if text.is_empty() {
                        continue;
                    }
                    if part["thought"].as_bool() == Some(true) {
                        events.push(Ok(ProviderEvent::ThoughtDelta(text.to_string())));
                    } else {
                        events.push(Ok(ProviderEvent::TextDelta(text.to_string())));
                    }
                }
            }
        }

        if let Some(meta) = v.get("usageMetadata").filter(|m| !m.is_null()) {
            events.push(Ok(ProviderEvent::Usage(parse_usage_metadata(meta))));
        }

        match candidate["finishReason"].as_str() {
            Some("SAFETY") | Some("PROHIBITED_CONTENT") => {
                if !self.emitted_blocked {
                    self.emitted_blocked = true;
                    events.push(Ok(ProviderEvent::Blocked));
                }
                events.push(Ok(ProviderEvent::Done));
            }
            Some(_) => events.push(Ok(ProviderEvent::Done)),
            None => {}
        }

        events
    }
}

fn parse_usage_metadata(meta: &Value) -> Usage {
    let image_tokens = meta["candidatesTokensDetails"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|d| d["modality"].as_str() == Some("IMAGE"))
        .and_then(|d| d["tokenCount"].as_u64());
    Usage {
        prompt_tokens: meta["promptTokenCount"].as_u64(),
        cached_tokens: meta["cachedContentTokenCount"].as_u64(),
        response_tokens: meta["candidatesTokenCount"].as_u64(),
        thinking_tokens: meta["thoughtsTokenCount"].as_u64(),
        total_tokens: meta["totalTokenCount"].as_u64(),
        response_image_tokens: image_tokens,
        tool_use_prompt_tokens: meta["toolUsePromptTokenCount"].as_u64(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ToolDecl;

    fn base_request() -> ProviderRequest {
        ProviderRequest::new("gemini-2.5-pro", vec![Content::user("hello")])
    }

    #[test]
    fn body_carries_thinking_config() {
        let body = generate_content_body(&base_request()).unwrap();
        let cfg = &body["generationConfig"]["thinkingConfig"];
        assert_eq!(cfg["includeThoughts"], json!(true));
        assert_eq!(cfg["thinkingBudget"], json!(24576));
    }

    #[test]
    fn system_roles_land_in_system_instruction() {
        let mut req = ProviderRequest::new(
            "gemini-2.5-pro",
            vec![Content::system("rules"), Content::user("hi")],
        );
        req.instructions = Some("prefix".into());
        let body = generate_content_body(&req).unwrap();
        let parts = body["systemInstruction"]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["text"], json!("prefix"));
        assert_eq!(parts[1]["text"], json!("rules"));
        assert_eq!(body["contents"].as_array().unwrap().len(), 1);
        assert_eq!(body["contents"][0]["role"], json!("user"));
    }

    #[test]
    fn function_tools_get_validated_mode() {
        let mut req = base_request();
        req.tools.push(ToolDecl {
            name: "lookup".into(),
            description: "look things up".into(),
            kind: ToolDeclKind::Function {
                parameters: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
            },
        });
        let body = generate_content_body(&req).unwrap();
        assert_eq!(
            body["toolConfig"]["functionCallingConfig"]["mode"],
            json!("VALIDATED")
        );
        let decl = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], json!("lookup"));
        assert!(decl["parameters"]["propertyOrdering"].is_array());
    }

    #[test]
    fn json_schema_format_sets_mime_and_schema() {
        let mut req = base_request();
        req.response_format = Some(ResponseFormat::JsonSchema {
            name: "result".into(),
            schema: json!({"type": "object", "properties": {"a": {"type": "string"}}}),
            strict: true,
        });
        let body = generate_content_body(&req).unwrap();
        let cfg = &body["generationConfig"];
        assert_eq!(cfg["responseMimeType"], json!("application/json"));
        assert!(cfg["responseJsonSchema"]["propertyOrdering"].is_array());
    }

    #[test]
    fn image_output_requests_image_modality() {
        let mut req = ProviderRequest::new("gemini-2.5-flash-image", vec![Content::user("draw")]);
        req.image_output = true;
        let body = generate_content_body(&req).unwrap();
        assert_eq!(
            body["generationConfig"]["responseModalities"],
            json!(["TEXT", "IMAGE"])
        );
    }

    #[test]
    fn continuation_contents_round_trip() {
        let call_content = function_call_content(&[(
            "lookup".into(),
            json!({"q": "rust"}),
            Some("fc1".into()),
        )]);
        assert_eq!(call_content["role"], json!("model"));
        assert_eq!(
            call_content["parts"][0]["functionCall"]["name"],
            json!("lookup")
        );
        let resp_content =
            function_response_content(&[("lookup".into(), json!("plain result"))]);
        assert_eq!(resp_content["role"], json!("user"));
        assert_eq!(
            resp_content["parts"][0]["functionResponse"]["response"]["output"],
            json!("plain result")
        );
        // Object payloads pass through unwrapped.
        let obj =
            function_response_content(&[("lookup".into(), json!({"hits": 3}))]);
        assert_eq!(
            obj["parts"][0]["functionResponse"]["response"]["hits"],
            json!(3)
        );
    }

    #[test]
    fn sse_chunk_events_parse() {
        let mut p = GeminiSseParser::new();
        let events = p.parse_data(
            r#"{"modelVersion":"gemini-2.5-pro-0520","candidates":[{"content":{"parts":[{"text":"thinking...","thought":true},{"text":"Hello"}]}}]}"#,
        );
        assert!(matches!(
            events[0].as_ref().unwrap(),
            ProviderEvent::ModelVersion(m) if m == "gemini-2.5-pro-0520"
        ));
        assert!(matches!(
            events[1].as_ref().unwrap(),
            ProviderEvent::ThoughtDelta(t) if t == "thinking..."
        ));
        assert!(matches!(
            events[2].as_ref().unwrap(),
            ProviderEvent::TextDelta(t) if t == "Hello"
        ));
    }

    #[test]
    fn function_call_chunk_parses_with_id_fallback() {
        let mut p = GeminiSseParser::new();
        let events = p.parse_data(
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"lookup","args":{"q":"x"}}}]}}]}"#,
        );
        match events[0].as_ref().unwrap() {
            ProviderEvent::ToolCall { id, name, arguments, .. } => {
                assert_eq!(id, "lookup");
                assert_eq!(name, "lookup");
                assert_eq!(arguments, r#"{"q":"x"}"#);
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn usage_metadata_parses_image_and_tool_tokens() {
        let mut p = GeminiSseParser::new();
        let events = p.parse_data(
            r#"{"candidates":[{"finishReason":"STOP","content":{"parts":[]}}],"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":20,"thoughtsTokenCount":5,"cachedContentTokenCount":2,"totalTokenCount":35,"toolUsePromptTokenCount":3,"candidatesTokensDetails":[{"modality":"IMAGE","tokenCount":1290}]}}"#,
        );
        let usage = events
            .iter()
            .find_map(|e| match e.as_ref().unwrap() {
                ProviderEvent::Usage(u) => Some(u.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(usage.prompt_tokens, Some(10));
        assert_eq!(usage.thinking_tokens, Some(5));
        assert_eq!(usage.response_image_tokens, Some(1290));
        assert_eq!(usage.tool_use_prompt_tokens, Some(3));
        assert!(matches!(
            events.last().unwrap().as_ref().unwrap(),
            ProviderEvent::Done
        ));
    }

    #[test]
    fn safety_finish_emits_blocked_once() {
        let mut p = GeminiSseParser::new();
        let events =
            p.parse_data(r#"{"candidates":[{"finishReason":"SAFETY","content":{"parts":[]}}]}"#);
        let blocked = events
            .iter()
            .filter(|e| matches!(e.as_ref().unwrap(), ProviderEvent::Blocked))
            .count();
        assert_eq!(blocked, 1);
    }

    #[test]
    fn inline_data_parts_surface_as_events() {
        let mut p = GeminiSseParser::new();
        let events = p.parse_data(
            r#"{"candidates":[{"content":{"parts":[{"inlineData":{"mimeType":"image/png","data":"QUJD"}}]}}]}"#,
        );
        assert!(matches!(
            events[0].as_ref().unwrap(),
            ProviderEvent::InlineData { mime_type: Some(m), .. } if m == "image/png"
        ));
    }
}
