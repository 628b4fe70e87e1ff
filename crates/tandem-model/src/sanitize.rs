// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-call id sanitization for the ChatGPT backend.
//!
//! The ChatGPT Responses backend rejects conversation items whose ids fall
//! outside a restricted alphabet.  Because the tool loop re-attaches
//! synthesized `function_call` / `custom_tool_call` items (and their outputs)
//! on the next turn, every id that round-trips through the conversation is
//! normalized here first: restricted alphabet, stable prefix per item kind.

/// Prefix for sanitized function-call ids.
pub const FUNCTION_CALL_PREFIX: &str = "fc-";
/// Prefix for sanitized custom-tool-call ids.
pub const CUSTOM_TOOL_CALL_PREFIX: &str = "ctc_";

/// Reduce an id to the accepted alphabet `[a-zA-Z0-9_-]`.
///
/// Out-of-alphabet characters are replaced with `_` so that distinct inputs
/// stay distinguishable in logs even after sanitization.  An empty result
/// falls back to `"0"`.
fn restrict_alphabet(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "0".to_string()
    } else {
        cleaned
    }
}

/// Sanitized id for a function call item.  Idempotent: an already-prefixed
/// id is not prefixed again.
pub fn function_call_id(raw: &str) -> String {
    let cleaned = restrict_alphabet(raw);
    if let Some(rest) = cleaned.strip_prefix(FUNCTION_CALL_PREFIX) {
        if !rest.is_empty() {
            return cleaned;
        }
    }
    format!("{FUNCTION_CALL_PREFIX}{cleaned}")
}

/// Sanitized id for a custom tool call item.  Idempotent like
/// [`function_call_id`].
pub fn custom_tool_call_id(raw: &str) -> String {
    let cleaned = restrict_alphabet(raw);
    if let Some(rest) = cleaned.strip_prefix(CUSTOM_TOOL_CALL_PREFIX) {
        if !rest.is_empty() {
            return cleaned;
        }
    }
    format!("{CUSTOM_TOOL_CALL_PREFIX}{cleaned}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
