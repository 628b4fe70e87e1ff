// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted in-process backend for tests.
//!
//! Model ids under the reserved `mock` prefix never leave the process.  A
//! test registers an ordered list of calls — each call an exact
//! [`ProviderEvent`] sequence — under its own model id, then drives the
//! public API; every `open` pops the next script and records the request so
//! the test can inspect exactly what would have gone on the wire.
//!
//! Unscripted mock ids echo the last user message, which is enough for
//! smoke tests that only need a deterministic round trip.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, OnceLock};

use futures::{stream, StreamExt};

use crate::error::LlmError;
use crate::content::{Role, Usage};

use super::{ProviderEvent, ProviderRequest, ProviderStream, TurnInput};

#[derive(Default)]
struct ScriptState {
    calls: VecDeque<Vec<ProviderEvent>>,
    requests: Vec<ProviderRequest>,
}

fn registry() -> &'static Mutex<HashMap<String, ScriptState>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, ScriptState>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register the scripts for a mock model id.  The outer list is the ordered
/// list of calls; the inner list is the event sequence for that call.
/// Replaces any previous registration for the id.
pub fn register_script(model_id: &str, calls: Vec<Vec<ProviderEvent>>) {
    let mut reg = registry().lock().unwrap();
    reg.insert(
        model_id.to_string(),
        ScriptState {
            calls: calls.into(),
            requests: Vec::new(),
        },
    );
}

/// Drain the requests recorded for a mock model id.
pub fn take_requests(model_id: &str) -> Vec<ProviderRequest> {
    let mut reg = registry().lock().unwrap();
    reg.get_mut(model_id)
        .map(|s| std::mem::take(&mut s.requests))
        .unwrap_or_default()
}

pub(crate) fn open(req: &ProviderRequest) -> Result<ProviderStream, LlmError> {
    let events = {
        let mut reg = registry().lock().unwrap();
        match reg.get_mut(&req.model) {
            Some(state) => {
                state.requests.push(req.clone());
                state.calls.pop_front().unwrap_or_else(|| {
                    vec![
                        ProviderEvent::TextDelta("[no more scripts]".into()),
                        ProviderEvent::Done,
                    ]
                })
            }
            None => echo_script(req),
        }
    };
    // A script without a terminal `Done` models a stalled provider: the
    // connection stays open so abort paths can be exercised.
    let terminated = matches!(events.last(), Some(ProviderEvent::Done));
    let wrapped: Vec<Result<ProviderEvent, LlmError>> = events.into_iter().map(Ok).collect();
    if terminated {
        Ok(Box::pin(stream::iter(wrapped)))
    } else {
        Ok(Box::pin(stream::iter(wrapped).chain(stream::pending())))
    }
}

fn echo_script(req: &ProviderRequest) -> Vec<ProviderEvent> {
    let reply = match &req.turn {
        TurnInput::Contents(contents) => contents
            .iter()
            .rev()
            .find(|c| c.role == Role::User)
            .map(|c| c.channel_text(false))
            .unwrap_or_else(|| "[no input]".into()),
        _ => "[no input]".into(),
    };
    vec![
        ProviderEvent::ModelVersion(req.model.clone()),
        ProviderEvent::TextDelta(format!("MOCK: {reply}")),
        ProviderEvent::Usage(Usage {
            prompt_tokens: Some(10),
            response_tokens: Some(10),
            total_tokens: Some(20),
            ..Default::default()
        }),
        ProviderEvent::Done,
    ]
}

/// Convenience: one call that streams `text` as a single delta.
pub fn text_call(text: impl Into<String>) -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::ModelVersion("mock-model".into()),
        ProviderEvent::TextDelta(text.into()),
        ProviderEvent::Usage(Usage {
            prompt_tokens: Some(5),
            response_tokens: Some(5),
            total_tokens: Some(10),
            ..Default::default()
        }),
        ProviderEvent::Done,
    ]
}

/// Convenience: one call that emits a single function tool call.
pub fn tool_call(
    id: impl Into<String>,
    name: impl Into<String>,
    arguments: impl Into<String>,
) -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::ModelVersion("mock-model".into()),
        ProviderEvent::ToolCall {
            index: 0,
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            custom: false,
        },
        ProviderEvent::Done,
    ]
}

/// An `InlineData` event carrying image bytes, for image-generation scripts.
pub fn image_event(data: impl Into<String>, mime_type: impl Into<String>) -> ProviderEvent {
    ProviderEvent::InlineData {
        data: data.into(),
        mime_type: Some(mime_type.into()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Content;
    use futures::StreamExt;

    #[tokio::test]
    async fn unscripted_mock_echoes_last_user_message() {
        let req = ProviderRequest::new("mock-echo", vec![Content::user("hi there")]);
        let mut stream = open(&req).unwrap();
        let mut texts = Vec::new();
        while let Some(ev) = stream.next().await {
            if let ProviderEvent::TextDelta(t) = ev.unwrap() {
                texts.push(t);
            }
        }
        assert_eq!(texts, vec!["MOCK: hi there"]);
    }

    #[tokio::test]
    async fn scripts_pop_in_order_and_record_requests() {
        register_script(
            "mock-pop-order",
            vec![text_call("first"), text_call("second")],
        );
        for expected in ["first", "second", "[no more scripts]"] {
            let req = ProviderRequest::new("mock-pop-order", vec![Content::user("x")]);
            let mut stream = open(&req).unwrap();
            let mut got = String::new();
            while let Some(ev) = stream.next().await {
                if let ProviderEvent::TextDelta(t) = ev.unwrap() {
                    got.push_str(&t);
                }
            }
            assert_eq!(got, expected);
        }
        assert_eq!(take_requests("mock-pop-order").len(), 3);
        assert!(take_requests("mock-pop-order").is_empty(), "drained");
    }
}
