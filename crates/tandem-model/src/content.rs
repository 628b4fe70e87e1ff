// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

// ─── Content model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

/// A single content part.
///
/// `Text` parts carry a `thought` marker: reasoning summaries travel on a
/// separate channel end-to-end and are never merged with response text.
/// `InlineData` holds base64 payloads (images or other attachments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        thought: bool,
    },
    InlineData {
        /// Base64-encoded payload (no data-URL prefix).
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            thought: false,
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            thought: true,
        }
    }

    pub fn inline_data(data: impl Into<String>, mime_type: Option<String>) -> Self {
        Part::InlineData {
            data: data.into(),
            mime_type,
        }
    }

    /// True for inline data whose mime type marks it as an image.
    pub fn is_image(&self) -> bool {
        matches!(
            self,
            Part::InlineData { mime_type: Some(m), .. } if m.starts_with("image/")
        )
    }
}

/// Canonical in-memory message shape: a role and an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![Part::text(text)],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![Part::text(text)],
        }
    }

    /// Collapse consecutive text parts on the same channel.
    ///
    /// The merge is lossless (concatenation in order) and idempotent:
    /// `c.merged().merged() == c.merged()`.
    pub fn merged(&self) -> Content {
        let mut parts: Vec<Part> = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            match (parts.last_mut(), part) {
                (
                    Some(Part::Text {
                        text: prev,
                        thought: prev_thought,
                    }),
                    Part::Text { text, thought },
                ) if *prev_thought == *thought => {
                    prev.push_str(text);
                }
                (_, p) => parts.push(p.clone()),
            }
        }
        Content {
            role: self.role,
            parts,
        }
    }

    /// Concatenated text of the given channel.
    pub fn channel_text(&self, thought: bool) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text, thought: t } if *t == thought => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ─── Prompt ───────────────────────────────────────────────────────────────────

/// Caller input: a bare string or an explicit message list, plus optional
/// instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub input: PromptInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Text(String),
    Messages(Vec<Content>),
}

impl Prompt {
    pub fn text(input: impl Into<String>) -> Self {
        Self {
            input: PromptInput::Text(input.into()),
            instructions: None,
        }
    }

    pub fn messages(messages: Vec<Content>) -> Self {
        Self {
            input: PromptInput::Messages(messages),
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Resolve into the content list sent to a provider.
    ///
    /// A bare string is promoted to a single user message.  `instructions`
    /// becomes a leading system content except when the provider carries a
    /// dedicated instructions field; that decision is made later, so this
    /// resolves without instructions and exposes them separately.
    pub fn resolved_contents(&self) -> Vec<Content> {
        match &self.input {
            PromptInput::Text(t) => vec![Content::user(t.clone())],
            PromptInput::Messages(msgs) => msgs.clone(),
        }
    }
}

// ─── Usage and stream events ──────────────────────────────────────────────────

/// Token accounting for one call.  `None` means "not reported by the
/// provider"; normalization never substitutes zero for missing values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub response_tokens: Option<u64>,
    pub thinking_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_image_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_prompt_tokens: Option<u64>,
}

impl Usage {
    /// Merge a later usage report into this one, last-writer-wins per field.
    /// Usage values are monotonic within a single call, so the latest report
    /// is the most complete one.
    pub fn merge_from(&mut self, other: &Usage) {
        fn take(dst: &mut Option<u64>, src: Option<u64>) {
            if src.is_some() {
                *dst = src;
            }
        }
        take(&mut self.prompt_tokens, other.prompt_tokens);
        take(&mut self.cached_tokens, other.cached_tokens);
        take(&mut self.response_tokens, other.response_tokens);
        take(&mut self.thinking_tokens, other.thinking_tokens);
        take(&mut self.total_tokens, other.total_tokens);
        take(&mut self.response_image_tokens, other.response_image_tokens);
        take(&mut self.tool_use_prompt_tokens, other.tool_use_prompt_tokens);
    }

    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }
}

/// The two text channels of a streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Response,
    Thought,
}

/// Stage marker for JSON overlay events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonStage {
    Partial,
    Final,
}

/// Normalized event observed on the stream of a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text on one of the two channels.  Never empty.
    Delta { channel: Channel, text: String },
    /// Final usage accounting.  Emitted at most once per call, after all
    /// deltas.
    Usage {
        usage: Usage,
        cost_usd: f64,
        model_version: String,
    },
    /// First reveal of the concrete model version.
    Model { model_version: String },
    /// Safety / refusal signal.  At most once per call.
    Blocked,
    /// Structured-JSON overlay (JSON calls only).
    Json {
        stage: JsonStage,
        value: serde_json::Value,
    },
}

// ─── Reasoning effort ─────────────────────────────────────────────────────────

/// Per-call reasoning effort.  The public enum keeps four levels; providers
/// cap at three, so `XHigh` maps to `"high"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    XHigh,
}

impl ReasoningEffort {
    /// Default effort for a model: codex-family models default to `Medium`,
    /// everything else to `High`.
    pub fn default_for(model_id: &str) -> Self {
        if crate::catalog::is_codex_family(model_id) {
            ReasoningEffort::Medium
        } else {
            ReasoningEffort::High
        }
    }

    /// The value sent on the wire.  `XHigh` collapses to `"high"`: providers
    /// expose three levels, and the fourth is kept in the public API for
    /// forward compatibility.
    pub fn wire_value(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High | ReasoningEffort::XHigh => "high",
        }
    }
}

// ─── Provider-native model tools ──────────────────────────────────────────────

/// Opaque capability requests the provider fulfils internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ModelTool {
    WebSearch { mode: WebSearchMode },
    CodeExecution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebSearchMode {
    Cached,
    Live,
}

// ─── Tool declarations (wire-level) ───────────────────────────────────────────

/// Wire-level declaration of a caller-defined tool, derived from the
/// executable tool set.  Function tools carry a JSON Schema for their input;
/// custom tools take freeform text and only exist on providers that can
/// express them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDecl {
    pub name: String,
    pub description: String,
    pub kind: ToolDeclKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolDeclKind {
    Function { parameters: serde_json::Value },
    Custom { format: Option<String> },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_collapses_same_channel_runs() {
        let c = Content {
            role: Role::Assistant,
            parts: vec![
                Part::text("Hel"),
                Part::text("lo"),
                Part::thought("hm"),
                Part::thought("m"),
                Part::text("!"),
            ],
        };
        let merged = c.merged();
        assert_eq!(
            merged.parts,
            vec![Part::text("Hello"), Part::thought("hmm"), Part::text("!")]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let c = Content {
            role: Role::Assistant,
            parts: vec![Part::text("a"), Part::text("b"), Part::thought("t")],
        };
        let once = c.merged();
        let twice = once.merged();
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_never_crosses_channels() {
        let c = Content {
            role: Role::Assistant,
            parts: vec![Part::text("a"), Part::thought("b"), Part::text("c")],
        };
        assert_eq!(c.merged().parts.len(), 3);
    }

    #[test]
    fn channel_text_separates_thoughts() {
        let c = Content {
            role: Role::Assistant,
            parts: vec![Part::text("answer"), Part::thought("reasoning")],
        };
        assert_eq!(c.channel_text(false), "answer");
        assert_eq!(c.channel_text(true), "reasoning");
    }

    #[test]
    fn bare_string_promotes_to_user_message() {
        let p = Prompt::text("hello");
        let contents = p.resolved_contents();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].role, Role::User);
        assert_eq!(contents[0].channel_text(false), "hello");
    }

    #[test]
    fn usage_merge_is_last_writer_wins_per_field() {
        let mut u = Usage {
            prompt_tokens: Some(10),
            response_tokens: Some(1),
            ..Default::default()
        };
        u.merge_from(&Usage {
            response_tokens: Some(5),
            total_tokens: Some(15),
            ..Default::default()
        });
        assert_eq!(u.prompt_tokens, Some(10));
        assert_eq!(u.response_tokens, Some(5));
        assert_eq!(u.total_tokens, Some(15));
        assert_eq!(u.cached_tokens, None);
    }

    #[test]
    fn xhigh_maps_to_high_on_the_wire() {
        assert_eq!(ReasoningEffort::XHigh.wire_value(), "high");
        assert_eq!(ReasoningEffort::High.wire_value(), "high");
        assert_eq!(ReasoningEffort::Medium.wire_value(), "medium");
        assert_eq!(ReasoningEffort::Low.wire_value(), "low");
    }

    #[test]
    fn codex_models_default_to_medium_effort() {
        assert_eq!(
            ReasoningEffort::default_for("gpt-5-codex"),
            ReasoningEffort::Medium
        );
        assert_eq!(
            ReasoningEffort::default_for("gemini-2.5-pro"),
            ReasoningEffort::High
        );
    }

    #[test]
    fn image_part_detection_uses_mime_prefix() {
        let img = Part::inline_data("QUJD", Some("image/png".into()));
        let pdf = Part::inline_data("QUJD", Some("application/pdf".into()));
        let none = Part::inline_data("QUJD", None);
        assert!(img.is_image());
        assert!(!pdf.is_image());
        assert!(!none.is_image());
    }

    #[test]
    fn content_serialises_and_deserialises() {
        let c = Content {
            role: Role::User,
            parts: vec![
                Part::text("look"),
                Part::inline_data("QUJD", Some("image/png".into())),
            ],
        };
        let json = serde_json::to_string(&c).unwrap();
        let back: Content = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn thought_flag_omitted_when_false() {
        let json = serde_json::to_string(&Part::text("x")).unwrap();
        assert!(!json.contains("thought"));
        let json = serde_json::to_string(&Part::thought("x")).unwrap();
        assert!(json.contains("\"thought\":true"));
    }
}
