// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! tandem — a provider-agnostic LLM orchestration runtime.
//!
//! The runtime normalizes four provider protocols behind one streaming call
//! core, layers a structured-JSON call and a multi-step tool loop on top,
//! and manages asynchronous subagents that a parent loop drives through
//! tools.  See the member crates for the full APIs:
//!
//! - [`model`] — catalog, content model, providers, streaming and JSON calls
//! - [`core`] — tool set, tool loop engine, subagent controller
//! - [`image`] — image batch generation with grading
//!
//! ```rust,no_run
//! use tandem::model::{generate_text, Prompt, TextRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tandem::model::LlmError> {
//!     let result = generate_text(TextRequest::new(
//!         "gemini-2.5-flash",
//!         Prompt::text("Summarize RFC 2119 in one sentence."),
//!     ))
//!     .await?;
//!     println!("{}", result.text);
//!     Ok(())
//! }
//! ```

pub use tandem_core as core;
pub use tandem_image as image;
pub use tandem_model as model;

pub use tandem_core::{
    run_tool_loop, LoopRequest, LoopRunner, SubagentConfig, SubagentController,
    SubagentControllerParams, SubagentJob, SubagentRunner, Tool, ToolInput, ToolSchema, ToolSet,
};
pub use tandem_image::{generate_images, ImageBatchRequest, ImageBlob};
pub use tandem_model::{
    generate_json, generate_text, stream_json, stream_text, AbortHandle, JsonRequest, LlmError,
    LoopResult, Prompt, TextRequest,
};
