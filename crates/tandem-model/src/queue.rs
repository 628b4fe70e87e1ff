// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Single-producer / multi-consumer event transport.
//!
//! Events are appended to a shared log; each reader iterates from its own
//! cursor, so every reader that subscribed before `close` observes every
//! event pushed before `close`.  The queue is unbounded — producers pace
//! themselves through the call scheduler, not through back-pressure here.
//!
//! Three terminal outcomes: `close` (success), `fail` (every pending and
//! future read observes the same shared error), `abort` (external
//! cancellation, surfaced as a `cancelled` failure).

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures::Stream;

use crate::error::LlmError;

#[derive(Debug, Clone)]
enum Terminal {
    Open,
    Closed,
    Failed(Arc<LlmError>),
}

#[derive(Debug)]
struct QueueState<T> {
    log: Vec<T>,
    terminal: Terminal,
    /// Wakers of readers parked on an empty cursor.  Drained on every push
    /// and on the terminal transition.
    wakers: Vec<Waker>,
}

impl<T> QueueState<T> {
    fn wake_all(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }
}

/// The write half.
#[derive(Debug)]
pub struct EventQueue<T> {
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T: Clone> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                log: Vec::new(),
                terminal: Terminal::Open,
                wakers: Vec::new(),
            })),
        }
    }

    /// Append an event.  Pushes after a terminal outcome are dropped.
    pub fn push(&self, event: T) {
        let mut state = self.state.lock().unwrap();
        if !matches!(state.terminal, Terminal::Open) {
            return;
        }
        state.log.push(event);
        state.wake_all();
    }

    /// Mark successful completion.  Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if !matches!(state.terminal, Terminal::Open) {
            return;
        }
        state.terminal = Terminal::Closed;
        state.wake_all();
    }

    /// Fail the queue.  Idempotent: the first error wins and every reader —
    /// pending or future — observes the same `Arc` reference.
    pub fn fail(&self, err: Arc<LlmError>) {
        let mut state = self.state.lock().unwrap();
        if !matches!(state.terminal, Terminal::Open) {
            return;
        }
        state.terminal = Terminal::Failed(err);
        state.wake_all();
    }

    /// External cancellation; a `fail` with a `cancelled` error.
    pub fn abort(&self, reason: Option<String>) {
        self.fail(Arc::new(LlmError::cancelled(reason)));
    }

    /// A new reader starting at the beginning of the log.
    pub fn subscribe(&self) -> EventStream<T> {
        EventStream {
            state: Arc::clone(&self.state),
            cursor: 0,
            done: false,
        }
    }
}

impl<T: Clone> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An async iterator over queue events.
///
/// Yields `Ok(event)` per event, then ends on `close`, or yields one final
/// `Err` on `fail`/`abort`.
pub struct EventStream<T> {
    state: Arc<Mutex<QueueState<T>>>,
    cursor: usize,
    done: bool,
}

impl<T: Clone> Stream for EventStream<T> {
    type Item = Result<T, Arc<LlmError>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let mut state = this.state.lock().unwrap();
        if let Some(event) = state.log.get(this.cursor).cloned() {
            this.cursor += 1;
            return Poll::Ready(Some(Ok(event)));
        }
        match &state.terminal {
            Terminal::Closed => {
                this.done = true;
                Poll::Ready(None)
            }
            Terminal::Failed(err) => {
                this.done = true;
                Poll::Ready(Some(Err(Arc::clone(err))))
            }
            Terminal::Open => {
                state.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn every_reader_sees_every_event_before_close() {
        let q: EventQueue<u32> = EventQueue::new();
        let mut a = q.subscribe();
        q.push(1);
        q.push(2);
        let mut b = q.subscribe();
        q.push(3);
        q.close();

        let got_a: Vec<u32> = (&mut a).map(|r| r.unwrap()).collect().await;
        let got_b: Vec<u32> = (&mut b).map(|r| r.unwrap()).collect().await;
        assert_eq!(got_a, vec![1, 2, 3]);
        assert_eq!(got_b, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn pending_reader_wakes_on_push() {
        let q: EventQueue<u32> = EventQueue::new();
        let mut reader = q.subscribe();
        let handle = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        q.push(7);
        let got = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(got, 7);
    }

    #[tokio::test]
    async fn pending_reader_wakes_on_close() {
        let q: EventQueue<u32> = EventQueue::new();
        let mut reader = q.subscribe();
        let handle = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        q.close();
        assert!(handle.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_is_idempotent_and_shares_one_error() {
        let q: EventQueue<u32> = EventQueue::new();
        let mut a = q.subscribe();
        let mut b = q.subscribe();
        let first = Arc::new(LlmError::provider("openai", Some(500), "boom"));
        q.fail(Arc::clone(&first));
        q.fail(Arc::new(LlmError::provider("openai", Some(400), "later")));

        let err_a = a.next().await.unwrap().unwrap_err();
        let err_b = b.next().await.unwrap().unwrap_err();
        assert!(Arc::ptr_eq(&err_a, &first));
        assert!(Arc::ptr_eq(&err_b, &first));
        assert!(a.next().await.is_none());
    }

    #[tokio::test]
    async fn push_after_close_is_dropped() {
        let q: EventQueue<u32> = EventQueue::new();
        q.push(1);
        q.close();
        q.push(2);
        let got: Vec<u32> = q.subscribe().map(|r| r.unwrap()).collect().await;
        assert_eq!(got, vec![1]);
    }

    #[tokio::test]
    async fn abort_surfaces_cancelled() {
        let q: EventQueue<u32> = EventQueue::new();
        let mut reader = q.subscribe();
        q.abort(Some("caller".into()));
        let err = reader.next().await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn events_before_fail_are_still_delivered() {
        let q: EventQueue<u32> = EventQueue::new();
        q.push(1);
        q.push(2);
        q.fail(Arc::new(LlmError::provider("gemini", None, "late failure")));
        let mut reader = q.subscribe();
        assert_eq!(reader.next().await.unwrap().unwrap(), 1);
        assert_eq!(reader.next().await.unwrap().unwrap(), 2);
        assert!(reader.next().await.unwrap().is_err());
    }
}
