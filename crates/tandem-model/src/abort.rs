// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cooperative cancellation.
//!
//! Every public operation accepts an optional external [`AbortHandle`]; on
//! entry the operation creates its own handle and fans the external one in,
//! so a single token governs the whole call.  Abort reasons are plain strings
//! (`"send_input_interrupt"`, `"close_agent"`) so in-flight runs can
//! distinguish interruption from shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct AbortInner {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

/// Clonable cancellation token.  All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token.  The first reason wins; repeated aborts are no-ops.
    pub fn abort(&self, reason: Option<&str>) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(r) = reason {
            if let Ok(mut slot) = self.inner.reason.lock() {
                *slot = Some(r.to_string());
            }
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// The reason passed to the first `abort` call, if any.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().ok().and_then(|r| r.clone())
    }

    /// Resolve once the token is aborted.  Safe to await from many tasks.
    pub async fn aborted(&self) {
        loop {
            if self.is_aborted() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// Create a child token that trips when either this call aborts it
    /// directly or the external token aborts.  The forwarding task ends as
    /// soon as either side trips.
    pub fn fan_in(external: Option<&AbortHandle>) -> AbortHandle {
        let child = AbortHandle::new();
        if let Some(ext) = external {
            if ext.is_aborted() {
                child.abort(ext.reason().as_deref());
                return child;
            }
            let ext = ext.clone();
            let fwd = child.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = ext.aborted() => fwd.abort(ext.reason().as_deref()),
                    _ = fwd.aborted() => {}
                }
            });
        }
        child
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_reason_wins() {
        let h = AbortHandle::new();
        h.abort(Some("first"));
        h.abort(Some("second"));
        assert!(h.is_aborted());
        assert_eq!(h.reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn aborted_future_resolves_after_abort() {
        let h = AbortHandle::new();
        let h2 = h.clone();
        let waiter = tokio::spawn(async move { h2.aborted().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        h.abort(None);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn fan_in_propagates_external_abort() {
        let external = AbortHandle::new();
        let child = AbortHandle::fan_in(Some(&external));
        assert!(!child.is_aborted());
        external.abort(Some("caller"));
        child.aborted().await;
        assert_eq!(child.reason().as_deref(), Some("caller"));
    }

    #[tokio::test]
    async fn fan_in_of_already_aborted_external_is_immediate() {
        let external = AbortHandle::new();
        external.abort(Some("late"));
        let child = AbortHandle::fan_in(Some(&external));
        assert!(child.is_aborted());
        assert_eq!(child.reason().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn fan_in_without_external_is_independent() {
        let child = AbortHandle::fan_in(None);
        assert!(!child.is_aborted());
        child.abort(None);
        assert!(child.is_aborted());
    }
}
