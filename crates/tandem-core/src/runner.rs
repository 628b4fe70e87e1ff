// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The production subagent runner: each child run is one tool-loop
//! invocation.
//!
//! The loop engine never references the subagent controller; the controller
//! only knows the [`SubagentRunner`] trait.  This module is the one place
//! that ties the two together, so child agents are structurally identical to
//! their parents — including the option of carrying their own controller in
//! the tool set the factory builds.

use std::sync::Arc;

use async_trait::async_trait;

use tandem_model::{Content, LlmError, LoopResult, Prompt};

use crate::engine::{run_tool_loop, LoopRequest, DEFAULT_MAX_STEPS};
use crate::subagent::{SubagentJob, SubagentRunner};
use crate::tool::ToolSet;

/// Builds the tool set for one child run.  Called per run so stateful tools
/// are never shared between children.
pub type ToolSetFactory = Arc<dyn Fn(&SubagentJob) -> ToolSet + Send + Sync>;

pub struct LoopRunner {
    tools: ToolSetFactory,
}

impl LoopRunner {
    pub fn new(tools: ToolSetFactory) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl SubagentRunner for LoopRunner {
    async fn run(&self, job: SubagentJob) -> Result<LoopResult, LlmError> {
        let mut messages: Vec<Content> = job.history.clone();
        messages.push(Content::user(job.input.clone()));
        let mut prompt = Prompt::messages(messages);
        if let Some(instructions) = &job.instructions {
            prompt = prompt.with_instructions(instructions.clone());
        }

        let mut req = LoopRequest::new(job.model.clone(), prompt, (self.tools)(&job));
        req.max_steps = job.max_steps.unwrap_or(DEFAULT_MAX_STEPS);
        req.abort = Some(job.abort.clone());
        run_tool_loop(req).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
