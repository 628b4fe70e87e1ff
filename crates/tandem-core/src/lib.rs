// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Agent facilities on top of the model layer: the executable tool set, the
//! ambient per-call tool context, the multi-step tool loop, and the subagent
//! controller that exposes child agents to a parent loop as tools.

pub mod context;
pub mod engine;
pub mod events;
pub mod runner;
pub mod subagent;
pub mod tool;

pub use context::ToolContext;
pub use engine::{run_tool_loop, LoopRequest, DEFAULT_MAX_STEPS};
pub use events::LoopEvent;
pub use runner::{LoopRunner, ToolSetFactory};
pub use subagent::{
    AgentRole, AgentSnapshot, AgentStatus, PromptPattern, SubagentConfig, SubagentController,
    SubagentControllerParams, SubagentJob, SubagentRunner,
};
pub use tool::{FnTool, Tool, ToolInput, ToolSchema, ToolSet, RESERVED_TOOL_NAMES};
