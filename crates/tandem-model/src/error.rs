// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Error taxonomy shared by every public operation in the runtime.
//!
//! Callers match on [`LlmError::kind`] rather than on variants, so the set of
//! distinguishable failure classes stays stable even as variants grow fields.

use thiserror::Error;

use crate::steps::LoopStep;

/// Maximum number of characters of raw model text included in error messages.
pub const PREVIEW_CHARS: usize = 200;

/// Truncate raw model output for inclusion in a human-readable error.
pub fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}…")
}

/// One failed attempt of a structured-JSON call.
#[derive(Debug, Clone)]
pub struct JsonAttemptFailure {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Full raw text the model produced on this attempt.
    pub raw_text: String,
    /// Why the attempt was rejected (parse or validation failure).
    pub error: String,
}

/// Stable failure classes callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    LimitExceeded,
    Provider,
    TransportRetryable,
    SchemaValidation,
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Malformed caller input: empty prompt, unknown model id, unknown tool
    /// or subagent id, non-positive timeout, conflicting prompt fields.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A configured bound was hit: subagent count/depth, or the tool loop
    /// exhausted `max_steps` with tool calls still pending.  `steps` carries
    /// the loop state accumulated before the bound was hit (empty when the
    /// limit is not a loop limit).
    #[error("limit exceeded: {message}")]
    LimitExceeded {
        message: String,
        steps: Vec<LoopStep>,
    },

    /// Non-retryable provider failure (HTTP error status, malformed stream,
    /// policy rejection that did not map to a `blocked` event).
    #[error("{provider} error{}: {message}", status.map(|s| format!(" {s}")).unwrap_or_default())]
    Provider {
        provider: &'static str,
        status: Option<u16>,
        message: String,
    },

    /// Transport failure that matched the retryable set.  Surfaces only
    /// after retries are exhausted, wrapped by the provider path.
    #[error("retryable transport error: {0}")]
    TransportRetryable(String),

    /// The final JSON value failed schema validation, or a tool input failed
    /// its schema.  For JSON calls the full per-attempt bundle is attached.
    #[error("schema validation failed: {message}")]
    SchemaValidation {
        message: String,
        attempts: Vec<JsonAttemptFailure>,
    },

    /// The caller aborted.  Never downgraded to a successful empty result.
    #[error("cancelled{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled { reason: Option<String> },
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            LlmError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            LlmError::Provider { .. } => ErrorKind::Provider,
            LlmError::TransportRetryable(_) => ErrorKind::TransportRetryable,
            LlmError::SchemaValidation { .. } => ErrorKind::SchemaValidation,
            LlmError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        LlmError::InvalidArgument(msg.into())
    }

    pub fn limit_exceeded(msg: impl Into<String>) -> Self {
        LlmError::LimitExceeded {
            message: msg.into(),
            steps: Vec::new(),
        }
    }

    pub fn provider(provider: &'static str, status: Option<u16>, msg: impl Into<String>) -> Self {
        LlmError::Provider {
            provider,
            status,
            message: msg.into(),
        }
    }

    pub fn cancelled(reason: Option<String>) -> Self {
        LlmError::Cancelled { reason }
    }

    /// True when this error represents a caller abort.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LlmError::Cancelled { .. })
    }
}

/// Substrings identifying transport failures that are worth retrying.
///
/// This mirrors the known failure strings of the upstream response
/// collection path.  Deliberately a closed table; new categories are not
/// added without evidence from production logs.
pub const RETRYABLE_TRANSPORT_PATTERNS: &[&str] = &[
    "terminated",
    "socket hang up",
    "fetch failed",
    "network",
    "responses websocket",
];

/// Return `true` when an error message matches the retryable transport set.
pub fn is_retryable_transport(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_TRANSPORT_PATTERNS
        .iter()
        .any(|p| lower.contains(p))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            LlmError::invalid_argument("x").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            LlmError::limit_exceeded("x").kind(),
            ErrorKind::LimitExceeded
        );
        assert_eq!(
            LlmError::provider("openai", Some(500), "x").kind(),
            ErrorKind::Provider
        );
        assert_eq!(LlmError::cancelled(None).kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn preview_truncates_long_text() {
        let long = "x".repeat(500);
        let p = preview(&long);
        assert!(p.chars().count() <= PREVIEW_CHARS + 1);
        assert!(p.ends_with('…'));
    }

    #[test]
    fn preview_keeps_short_text_verbatim() {
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn retryable_set_matches_known_failures() {
        assert!(is_retryable_transport("request terminated by peer"));
        assert!(is_retryable_transport("Socket hang up"));
        assert!(is_retryable_transport("fetch failed"));
        assert!(is_retryable_transport("responses websocket closed"));
        assert!(!is_retryable_transport("401 unauthorized"));
        assert!(!is_retryable_transport("schema mismatch"));
    }

    #[test]
    fn provider_error_formats_status() {
        let e = LlmError::provider("gemini", Some(429), "quota");
        assert_eq!(e.to_string(), "gemini error 429: quota");
        let e = LlmError::provider("gemini", None, "quota");
        assert_eq!(e.to_string(), "gemini error: quota");
    }

    #[test]
    fn cancelled_formats_reason() {
        let e = LlmError::cancelled(Some("close_agent".into()));
        assert_eq!(e.to_string(), "cancelled: close_agent");
        assert_eq!(LlmError::cancelled(None).to_string(), "cancelled");
    }
}
