//! Sequential async queue.
//!
//! [`AsyncQueue`] serializes a stream of async operations onto a single
//! logical lane without an actor or a dedicated worker thread: each
//! `enqueue` spawns a task that first awaits whatever was previously
//! enqueued (discarding its result), then runs its own operation. Program
//! order is preserved because the predecessor await is what orders the
//! two tasks relative to each other, not any lock held across the work
//! itself — see `spec.md` §4.5.
//!
//! The only shared mutable state is the *last enqueued task* reference,
//! which is why a `std::sync::Mutex` swapped briefly on each call
//! suffices in place of the source host's single-writer actor isolation
//! (`spec.md` §4.1's redesign note).

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, QueueResult};

/// A handle to a task enqueued on an [`AsyncQueue`].
///
/// Dropping the handle does not cancel the task; use
/// [`AsyncQueue::perform`] if cancellation should propagate from the
/// calling task to the enqueued one.
pub struct TaskHandle<T> {
    join: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    /// Awaits the task's result.
    ///
    /// Panics if the task panicked, mirroring [`JoinHandle::await`].
    pub async fn join(self) -> T {
        self.join.await.expect("queued task panicked")
    }

    /// Aborts the underlying task.
    pub fn abort(&self) {
        self.join.abort();
    }
}

type BoxedUnit = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Serializes async operations onto one logical lane.
///
/// Cloning an `AsyncQueue` shares the same lane; all clones serialize
/// against each other (`spec.md` §4.5's "single-writer with mutual
/// exclusion" requirement on the last-task reference).
#[derive(Clone)]
pub struct AsyncQueue {
    last: Arc<Mutex<Option<BoxedUnit>>>,
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Enqueues `op`, returning a handle that resolves to its result once
    /// every previously enqueued operation has run.
    ///
    /// Does not propagate cancellation of the calling task to the spawned
    /// one: once enqueued, `op` runs to completion regardless of what
    /// happens to the caller. Reach for [`AsyncQueue::perform`] instead
    /// when the caller's cancellation should cancel the queued work too.
    pub fn enqueue<T, F>(&self, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let predecessor = self.take_predecessor();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            if let Some(predecessor) = predecessor {
                predecessor.await;
            }
            let result = op.await;
            let _ = tx.send(());
            result
        });

        // The predecessor slot for the *next* enqueue is a unit future
        // that resolves once this one has handed off — not `join` itself,
        // since awaiting a `JoinHandle` consumes it and callers must
        // still be able to `join()`/`abort()` their own handle.
        let next_predecessor: BoxedUnit = Box::pin(async move {
            let _ = rx.await;
        });
        *self.last.lock().unwrap() = Some(next_predecessor);

        TaskHandle { join }
    }

    /// Enqueues the fallible `op` and awaits it, cancelling the queued
    /// task if the calling task is cancelled first. This is the
    /// "throwing" flavor named in `spec.md` §4.5: unlike
    /// [`AsyncQueue::enqueue`], cancellation of the caller is forwarded
    /// to the queued task and surfaced as [`QueueError::Cancelled`]; a
    /// failure from `op` itself is forwarded as [`QueueError::Operation`].
    ///
    /// `cancel_token` is the caller's own cancellation signal (the same
    /// token a caller would pass to [`crate::bridge::await_cancellable`]);
    /// this races that signal against the queued task's completion and
    /// aborts the loser.
    pub async fn perform<T, E, F>(&self, cancel_token: &CancellationToken, op: F) -> QueueResult<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let handle = self.enqueue(op);
        let abort_handle = handle.join.abort_handle();
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                abort_handle.abort();
                Err(QueueError::Cancelled)
            }
            result = handle.join => {
                match result {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(QueueError::Operation(err)),
                    Err(_) => Err(QueueError::Cancelled),
                }
            }
        }
    }

    fn take_predecessor(&self) -> Option<BoxedUnit> {
        self.last.lock().unwrap().take()
    }
}
