// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-loop step records.  These are data-model types (they appear in
//! results and in `limit_exceeded` errors), so they live next to the other
//! wire-facing shapes rather than in the loop engine.

use serde::{Deserialize, Serialize};

use crate::content::Usage;

/// One tool call observed in a step, in the model's call order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    /// Parsed input for function tools; a JSON string for custom tools.
    pub input: serde_json::Value,
    /// JSON-serializable output captured from the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Structured error payload when the tool failed; the loop never aborts
    /// because a tool failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    /// Provider-assigned call id, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// One turn of the tool loop.  A terminal step has no tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStep {
    /// 1-based step number; steps are totally ordered.
    pub step: u32,
    pub model_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub cost_usd: f64,
}

impl LoopStep {
    /// A step with no tool calls ends the loop.
    pub fn is_terminal(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// Final result of a tool loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopResult {
    pub text: String,
    pub thoughts: String,
    pub steps: Vec<LoopStep>,
    pub total_cost_usd: f64,
}
