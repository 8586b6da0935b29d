//! Cancellable continuation bridge.
//!
//! Adapts a callback-plus-cancel-handle API into a single suspending call
//! with cooperative cancellation, per `spec.md` §4.2. This is the
//! smallest of the three cores but the one whose correctness the other
//! two build on: the channel and the iterator both reduce to repeated
//! uses of this same win/cancel arbitration, one rendezvous at a time.
//!
//! # Example
//!
//! ```
//! use tokio_util::sync::CancellationToken;
//! use trestle::bridge::await_cancellable;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let token = CancellationToken::new();
//! let result: Result<&str, std::convert::Infallible> =
//!     await_cancellable(&token, |complete| {
//!         complete(Ok("done"));
//!         None
//!     })
//!     .await;
//! assert_eq!(result.unwrap(), "done");
//! # }
//! ```

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::handle::CancelHandle;
use crate::registry::CancellableRegistry;

/// The completion callback a `body` closure is given. Calling it resumes
/// the awaiting caller with `result`, unless cancellation has already won
/// the race, in which case the call is silently discarded.
///
/// Boxed and `Send` because the body that receives it is free to hand it
/// to another thread and invoke it from there (the defining trait of the
/// callback APIs this bridge wraps).
pub type Complete<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

enum Outcome<T, E> {
    Completed(Result<T, E>),
    Cancelled,
}

/// Suspends the caller, runs `body` once, and resumes with whatever
/// `body` passes to its completion callback — or with
/// [`BridgeError::Cancelled`] if `cancel_token` is cancelled first.
///
/// `body` is called synchronously and must return quickly: it is expected
/// to kick off the real (possibly long-running) work on another thread or
/// task and invoke the completion callback from there, optionally
/// returning a [`CancelHandle`] that aborts that work.
///
/// See `spec.md` §4.2 for the full tie-break algorithm this implements.
pub async fn await_cancellable<T, E, F>(
    cancel_token: &CancellationToken,
    body: F,
) -> Result<T, BridgeError<E>>
where
    T: Send + 'static,
    E: Send + 'static,
    F: FnOnce(Complete<T, E>) -> Option<CancelHandle>,
{
    let registry = Arc::new(CancellableRegistry::new());

    // Step 3: if the task is already cancelled, fail immediately without
    // ever running `body`.
    if cancel_token.is_cancelled() {
        registry.cancel();
        tracing::trace!("bridge: task already cancelled before body ran");
        return Err(BridgeError::Cancelled);
    }

    let (tx, rx) = oneshot::channel::<Outcome<T, E>>();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let registry_for_complete = registry.clone();
    let tx_for_complete = tx.clone();
    let complete: Complete<T, E> = Box::new(move |result| {
        // The callback "wins" iff it is the first to deactivate the
        // registry — a concurrent cancel may have already claimed it.
        if registry_for_complete.deactivate() {
            if let Some(sender) = tx_for_complete.lock().unwrap().take() {
                let _ = sender.send(Outcome::Completed(result));
            }
        } else {
            tracing::trace!("bridge: completion lost the race to cancellation, discarding result");
        }
    });

    let user_cancel = body(complete);

    // Composite handle: cancel the caller's handle (if any), then resume
    // the continuation with a cancellation outcome.
    let tx_for_cancel = tx.clone();
    let composite = CancelHandle::new(move || {
        if let Some(h) = &user_cancel {
            h.cancel();
        }
        if let Some(sender) = tx_for_cancel.lock().unwrap().take() {
            let _ = sender.send(Outcome::Cancelled);
        }
    });

    // Step 6: register the composite. If the registry is already
    // `Cancelled` (cancel fired before `add`), `add` invokes the
    // composite synchronously, which sends `Outcome::Cancelled` right
    // here before we ever reach the suspension below.
    registry.add(composite);

    // Drive the race: either the continuation resolves on its own
    // (because `complete` or the composite already sent to it above), or
    // the ambient cancellation token fires and we cancel the registry,
    // which synchronously triggers the composite (if it hasn't run yet)
    // and unblocks `rx`.
    let mut rx = rx;
    tokio::select! {
        biased;
        received = &mut rx => {
            finish(received)
        }
        _ = cancel_token.cancelled() => {
            registry.cancel();
            // `cancel()` synchronously invoked the composite handle (if
            // it hadn't already lost the race), which sent to `tx` before
            // `cancel()` returned, so `rx` is ready now.
            let received = rx.await;
            finish(received)
        }
    }
}

fn finish<T, E>(received: Result<Outcome<T, E>, oneshot::error::RecvError>) -> Result<T, BridgeError<E>> {
    match received {
        Ok(Outcome::Completed(Ok(value))) => Ok(value),
        Ok(Outcome::Completed(Err(err))) => Err(BridgeError::User(err)),
        Ok(Outcome::Cancelled) => Err(BridgeError::Cancelled),
        // The sender was dropped without sending, which only happens if
        // neither `complete` nor the composite ran — impossible given the
        // registry's exclusivity invariant, but treated as cancellation
        // rather than panicking.
        Err(_) => Err(BridgeError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn success_resumes_with_value_and_never_cancels_spy() {
        let spy_count = Arc::new(AtomicU32::new(0));
        let c = spy_count.clone();

        let result: Result<&str, std::convert::Infallible> =
            await_cancellable(&CancellationToken::new(), |complete| {
                complete(Ok("X"));
                Some(CancelHandle::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .await;

        assert_eq!(result.unwrap(), "X");
        assert_eq!(spy_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_before_add_cancels_spy_and_throws() {
        let token = CancellationToken::new();
        let spy_count = Arc::new(AtomicU32::new(0));
        let c = spy_count.clone();

        token.cancel();

        let result: Result<&str, std::convert::Infallible> = await_cancellable(&token, |complete| {
            // Cancellation has already fired by the time body runs.
            complete(Ok("X"));
            Some(CancelHandle::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
        })
        .await;

        assert!(matches!(result, Err(BridgeError::Cancelled)));
        // The body never ran in this scenario (short-circuited at step 3),
        // so the spy was never even constructed — nothing to assert on
        // it here. See `cancel_during_callback` for the race that does
        // invoke the spy.
        assert_eq!(spy_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_during_callback_cancels_spy_exactly_once() {
        let token = CancellationToken::new();
        let spy_count = Arc::new(AtomicU32::new(0));
        let c = spy_count.clone();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let token_for_body = token.clone();
        let barrier_for_body = barrier.clone();
        let result: Result<&str, std::convert::Infallible> =
            await_cancellable(&token, move |complete| {
                let barrier_for_task = barrier_for_body.clone();
                tokio::spawn(async move {
                    barrier_for_task.wait().await;
                    // Give the cancellation a head start before racing to
                    // complete.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    complete(Ok("X"));
                });
                Some(CancelHandle::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .await;

        tokio::spawn(async move {
            barrier.wait().await;
            token_for_body.cancel();
        });

        assert!(matches!(result, Err(BridgeError::Cancelled)));
        assert_eq!(spy_count.load(Ordering::SeqCst), 1);
    }
}
