// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tandem_model::LoopStep;

/// Events surfaced by the tool loop while it runs.  Delivered over an
/// optional mpsc channel; a closed receiver never stalls the loop.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    /// Response-channel text from the current model turn.
    TextDelta(String),
    /// Reasoning-summary text from the current model turn.
    ThoughtDelta(String),
    ToolCallStarted {
        call_id: String,
        tool_name: String,
        turn: u32,
    },
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        is_error: bool,
    },
    /// A step (model turn + tool executions) was appended.
    StepCompleted(LoopStep),
    /// The provider raised its safety / refusal signal.
    Blocked,
}
