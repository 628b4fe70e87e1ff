// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider-agnostic model calls.
//!
//! This crate normalizes four remote protocols — OpenAI Responses,
//! ChatGPT-backed Responses, Fireworks chat completions, and Gemini
//! generateContent — into one event vocabulary, and layers the streaming
//! text call and the structured-JSON call on top.  Admission control, cost
//! accounting, and the bundled model catalog live here too.

pub mod abort;
pub mod catalog;
pub mod cost;
pub mod error;
pub mod json;
pub mod partial_json;
pub mod providers;
pub mod queue;
pub mod sanitize;
pub mod scheduler;
pub mod schema;
pub mod steps;
pub mod stream;
mod content;

pub use abort::AbortHandle;
pub use catalog::{ModelEntry, Provider};
pub use cost::cost_usd;
pub use error::{ErrorKind, JsonAttemptFailure, LlmError};
pub use json::{generate_json, stream_json, JsonCall, JsonOutcome, JsonRequest};
pub use queue::{EventQueue, EventStream};
pub use steps::{LoopResult, LoopStep, ToolCallRecord};
pub use stream::{generate_text, stream_text, StreamingCall, TextRequest, TextResult};
pub use content::*;
