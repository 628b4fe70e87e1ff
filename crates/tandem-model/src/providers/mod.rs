// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider drivers.
//!
//! Each submodule speaks one wire protocol and normalizes it into
//! [`ProviderEvent`]s.  The four paths deliberately do **not** share a trait:
//! continuation semantics differ enough (response-id reuse vs. prompt-cache
//! key vs. message array vs. content array) that the branch in
//! [`open_stream`] stays an exhaustive match and each module keeps its wire
//! quirks local.  What they share are the SSE line plumbing and the
//! normalized event vocabulary.

use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;

use crate::abort::AbortHandle;
use crate::catalog::Provider;
use crate::error::LlmError;
use crate::scheduler::{scheduler_for, CallPermit};
use crate::content::{Content, ModelTool, ReasoningEffort, ToolDecl, ToolDeclKind, Usage};

pub mod chatgpt;
pub mod fireworks;
pub mod gemini;
pub mod mock;
pub mod openai;

/// Normalized event produced by a provider driver.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    TextDelta(String),
    ThoughtDelta(String),
    /// A tool call or a fragment of one.  `arguments` accumulates across
    /// events sharing the same `index`; drivers that deliver complete calls
    /// emit one event per call.  `custom` marks freeform-input tool calls.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
        custom: bool,
    },
    /// Inline binary payload produced by the model (image generation).
    InlineData {
        data: String,
        mime_type: Option<String>,
    },
    Usage(Usage),
    ModelVersion(String),
    /// Response id usable for `previous_response_id` continuation.
    ResponseId(String),
    Blocked,
    Done,
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent, LlmError>> + Send>>;

/// Per-turn input in the shape the target provider's continuation contract
/// requires.  The first turn is always `Contents`; the tool loop builds the
/// provider-specific variants for follow-up turns.
#[derive(Debug, Clone)]
pub enum TurnInput {
    Contents(Vec<Content>),
    /// OpenAI: reuse the response id, send only the new items.
    OpenAiFollowUp {
        previous_response_id: String,
        items: Vec<Value>,
    },
    /// ChatGPT: replay the accumulated conversation items.
    ChatGptItems(Vec<Value>),
    /// Fireworks: the accumulated chat messages.
    FireworksMessages(Vec<Value>),
    /// Gemini: the accumulated content array.
    GeminiContents(Vec<Value>),
}

/// Response-format request for structured output.
#[derive(Debug, Clone)]
pub enum ResponseFormat {
    JsonSchema {
        name: String,
        schema: Value,
        strict: bool,
    },
    /// Hint-only JSON mode for providers without structured output.
    JsonObject,
}

/// A fully-resolved outbound call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Public model id (classification input; the wire name may differ).
    pub model: String,
    pub turn: TurnInput,
    pub instructions: Option<String>,
    pub tools: Vec<ToolDecl>,
    pub model_tools: Vec<ModelTool>,
    pub effort: ReasoningEffort,
    pub response_format: Option<ResponseFormat>,
    /// Stable conversation id; the ChatGPT driver forwards it as
    /// `prompt_cache_key`.
    pub conversation_id: Option<String>,
    /// Ask the model for image output (Gemini image models).
    pub image_output: bool,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, contents: Vec<Content>) -> Self {
        Self {
            model: model.into(),
            turn: TurnInput::Contents(contents),
            instructions: None,
            tools: Vec::new(),
            model_tools: Vec::new(),
            effort: ReasoningEffort::High,
            response_format: None,
            conversation_id: None,
            image_output: false,
        }
    }
}

/// Open a streaming call: classify, validate tool capability, pass admission
/// control, then dispatch to the driver.  The returned stream holds the
/// scheduler permit for its lifetime.
pub async fn open_stream(
    req: ProviderRequest,
    abort: &AbortHandle,
) -> Result<ProviderStream, LlmError> {
    let provider = Provider::classify(&req.model)?;

    let has_custom = req
        .tools
        .iter()
        .any(|t| matches!(t.kind, ToolDeclKind::Custom { .. }));
    if has_custom && matches!(provider, Provider::Gemini | Provider::Fireworks) {
        return Err(LlmError::invalid_argument(format!(
            "custom tools are not supported by the {provider} provider"
        )));
    }

    let permit = tokio::select! {
        biased;
        _ = abort.aborted() => {
            return Err(LlmError::cancelled(abort.reason()));
        }
        permit = scheduler_for(provider).admit() => permit,
    };

    let inner = match provider {
        Provider::OpenAi => openai::open(&req).await?,
        Provider::ChatGpt => chatgpt::open(&req).await?,
        Provider::Fireworks => fireworks::open(&req).await?,
        Provider::Gemini => gemini::open(&req).await?,
        Provider::Mock => mock::open(&req)?,
    };

    Ok(Box::pin(PermittedStream {
        inner,
        _permit: permit,
    }))
}

/// A provider stream that keeps its scheduler permit until dropped.
struct PermittedStream {
    inner: ProviderStream,
    _permit: CallPermit,
}

impl Stream for PermittedStream {
    type Item = Result<ProviderEvent, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Shared HTTP client.  Connection pooling across providers is fine; anything
/// fancier (proxies, custom TLS) is the embedding application's concern.
pub(crate) fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(reqwest::Client::new)
}

/// Resolve an API key from the environment, with the driver's error message.
pub(crate) fn api_key(var: &str, provider: &'static str) -> Result<String, LlmError> {
    std::env::var(var)
        .map_err(|_| LlmError::provider(provider, None, format!("{var} not set")))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`, feeding each
/// `data:` payload to `parse`.
///
/// SSE events can be split across TCP packets, so a trailing incomplete line
/// stays in `buf` for the next chunk.
pub(crate) fn drain_sse_lines<F>(buf: &mut String, mut parse: F) -> Vec<Result<ProviderEvent, LlmError>>
where
    F: FnMut(&str) -> Vec<Result<ProviderEvent, LlmError>>,
{
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(data) = line.strip_prefix("data: ") {
            let data = data.trim();
            if !data.is_empty() {
                events.extend(parse(data));
            }
        }
    }
    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
