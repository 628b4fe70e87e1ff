// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Ambient tool context.
//!
//! While a tool's `execute` runs, a task-local context identifies the call:
//! tool name, a stable `turn<n>/tool<k>` id, the turn number, and the call's
//! index within the turn, plus the loop's abort handle so long-running tools
//! can observe cancellation.  The value is scoped to the execution task —
//! never a process global — and is read-only to tools.

use tandem_model::AbortHandle;

#[derive(Debug, Clone)]
pub struct ToolContext {
    pub tool_name: String,
    /// Stable id of the call: `turn<n>/tool<k>`.
    pub tool_id: String,
    /// 1-based turn number of the loop.
    pub turn: u32,
    /// 0-based index of this call within its turn.
    pub tool_index: u32,
    /// The loop's abort handle; tools should finish promptly once it trips.
    pub abort: AbortHandle,
}

tokio::task_local! {
    static TOOL_CONTEXT: ToolContext;
}

/// The context of the currently executing tool, if any.
pub fn current() -> Option<ToolContext> {
    TOOL_CONTEXT.try_with(Clone::clone).ok()
}

/// Run `fut` with `ctx` as the ambient tool context.
pub async fn scope<F>(ctx: ToolContext, fut: F) -> F::Output
where
    F: std::future::Future,
{
    TOOL_CONTEXT.scope(ctx, fut).await
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(turn: u32, index: u32) -> ToolContext {
        ToolContext {
            tool_name: "probe".into(),
            tool_id: format!("turn{turn}/tool{index}"),
            turn,
            tool_index: index,
            abort: AbortHandle::new(),
        }
    }

    #[tokio::test]
    async fn context_is_visible_inside_scope_only() {
        assert!(current().is_none());
        scope(ctx(1, 0), async {
            let c = current().expect("context must be set inside scope");
            assert_eq!(c.tool_id, "turn1/tool0");
            assert_eq!(c.turn, 1);
        })
        .await;
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn parallel_scopes_do_not_leak_into_each_other() {
        let a = tokio::spawn(scope(ctx(1, 0), async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            current().unwrap().tool_id
        }));
        let b = tokio::spawn(scope(ctx(1, 1), async {
            current().unwrap().tool_id
        }));
        assert_eq!(a.await.unwrap(), "turn1/tool0");
        assert_eq!(b.await.unwrap(), "turn1/tool1");
    }
}
