//! Opaque, idempotent cancel handles.
//!
//! A [`CancelHandle`] names a single cancel action. The action runs at
//! most once no matter how many times `cancel()` is called or how many
//! [`crate::registry::CancellableRegistry`] instances hold a clone of it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Inner {
    cancelled: AtomicBool,
    action: Box<dyn Fn() + Send + Sync>,
}

/// An opaque handle exposing an idempotent `cancel()` action and an
/// `is_cancelled` flag.
///
/// Cloning a handle shares the same latch and action — cancelling any
/// clone cancels all of them, and the underlying action still runs only
/// once. This mirrors the single "side effect runs at most once" data
/// model invariant in `spec.md` §3.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

impl CancelHandle {
    /// Wraps a closure as a cancel handle. The closure is invoked at most
    /// once, the first time [`cancel`](Self::cancel) is called on any
    /// clone of the returned handle.
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                action: Box::new(action),
            }),
        }
    }

    /// A handle whose cancel action does nothing. Useful when a callback
    /// API has no native cancel operation to wrap.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Invokes the cancel action if it has not already run.
    ///
    /// Returns `true` the first time it runs the action, `false` on every
    /// subsequent call (including from other clones).
    pub fn cancel(&self) -> bool {
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            (self.inner.action)();
            true
        } else {
            false
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) has run the action
    /// (on this handle or any clone of it).
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Combines several handles into one: cancelling it cancels each
/// constituent handle, in the order supplied.
pub fn compose(handles: Vec<CancelHandle>) -> CancelHandle {
    CancelHandle::new(move || {
        for h in &handles {
            h.cancel();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn cancel_runs_action_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = CancelHandle::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!handle.is_cancelled());
        assert!(handle.cancel());
        assert!(handle.cancel());
        assert!(handle.cancel());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handle.is_cancelled());
    }

    #[test]
    fn clones_share_latch() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = CancelHandle::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let clone = handle.clone();

        assert!(clone.cancel());
        assert!(handle.is_cancelled());
        assert!(!handle.cancel());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_is_cancellable_without_effect() {
        let handle = CancelHandle::noop();
        assert!(handle.cancel());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn compose_cancels_all_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let a = CancelHandle::new(move || o1.lock().unwrap().push(1));
        let b = CancelHandle::new(move || o2.lock().unwrap().push(2));

        let composite = compose(vec![a, b]);
        composite.cancel();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
