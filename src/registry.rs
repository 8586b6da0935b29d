//! Three-state cancellable handle registry.
//!
//! A [`CancellableRegistry`] gates an ordered list of [`CancelHandle`]s
//! behind a monotonic `{active, cancelled, deactivated}` state. It is the
//! primitive the continuation bridge (`crate::bridge`) uses to arbitrate
//! whether a callback or a cancellation "wins" a race — see `spec.md`
//! §3–§4.1.
//!
//! # Architecture
//!
//! The registry holds its state and handle list behind a single
//! `std::sync::Mutex`. `cancel()` snapshots the handle list and clears it
//! under the lock, then invokes every handle *after* the guard is
//! dropped — a re-entrant `cancel()` called from inside one of those
//! handles must not deadlock, and running callbacks with the lock held
//! would make that possible. This mirrors the "process events
//! synchronously, dispatch actions after unlock" discipline `spec.md` §5
//! requires of every state machine in this crate.

use std::sync::Mutex;

use crate::handle::CancelHandle;

/// Lifecycle state of a [`CancellableRegistry`].
///
/// Transitions are monotonic: `Active -> Cancelled` and
/// `Active -> Deactivated` are the only moves; both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    /// Handles may still be added; neither terminal transition has run.
    Active,
    /// `cancel()` has committed; every handle has been (or is being)
    /// invoked.
    Cancelled,
    /// `deactivate()` has committed; handles were discarded without
    /// being cancelled.
    Deactivated,
}

struct Inner {
    state: RegistryState,
    handles: Vec<CancelHandle>,
}

/// Ordered, state-gated list of cancel handles.
///
/// See the module docs for the arbitration role this plays in
/// [`crate::bridge::await_cancellable`].
pub struct CancellableRegistry {
    inner: Mutex<Inner>,
}

impl CancellableRegistry {
    /// Creates a new registry in the `Active` state.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RegistryState::Active,
                handles: Vec::new(),
            }),
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> RegistryState {
        self.inner.lock().unwrap().state
    }

    /// Adds a handle to the registry.
    ///
    /// - In `Active`: appends the handle and returns `true`.
    /// - In `Cancelled`: invokes `handle.cancel()` synchronously (outside
    ///   the lock) and returns `false` — a handle arriving after
    ///   cancellation has already committed must still be cancelled so
    ///   its side effect runs.
    /// - In `Deactivated`: drops the handle and returns `false` — the
    ///   callback already won, so the handle's cancel action must never
    ///   run.
    pub fn add(&self, handle: CancelHandle) -> bool {
        enum Outcome {
            Added,
            CancelNow(CancelHandle),
            Discarded,
        }

        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                RegistryState::Active => {
                    inner.handles.push(handle);
                    Outcome::Added
                }
                RegistryState::Cancelled => Outcome::CancelNow(handle),
                RegistryState::Deactivated => Outcome::Discarded,
            }
        };

        match outcome {
            Outcome::Added => {
                tracing::trace!("registry: handle added");
                true
            }
            Outcome::CancelNow(handle) => {
                tracing::trace!("registry: late add while cancelled, cancelling immediately");
                handle.cancel();
                false
            }
            Outcome::Discarded => {
                tracing::trace!("registry: late add while deactivated, discarding");
                false
            }
        }
    }

    /// Transitions `Active -> Cancelled` and invokes every held handle
    /// exactly once, in insertion order, after the transition commits and
    /// the internal lock is released.
    ///
    /// A no-op if the registry is already `Cancelled` or `Deactivated`.
    pub fn cancel(&self) {
        let handles = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.state, RegistryState::Active) {
                return;
            }
            inner.state = RegistryState::Cancelled;
            std::mem::take(&mut inner.handles)
        };

        tracing::trace!(count = handles.len(), "registry: cancelling held handles");
        for handle in &handles {
            handle.cancel();
        }
    }

    /// Transitions `Active -> Deactivated`, returning `true` if this call
    /// performed the transition (i.e. it "won"). Returns `false` if the
    /// registry was already `Cancelled` or `Deactivated`.
    ///
    /// Handles held at the time of deactivation are discarded without
    /// being cancelled — the callback that deactivated the registry has
    /// already completed successfully, so any cancel side effects must
    /// not run.
    pub fn deactivate(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.state, RegistryState::Active) {
            return false;
        }
        inner.state = RegistryState::Deactivated;
        inner.handles.clear();
        tracing::trace!("registry: deactivated");
        true
    }
}

impl Default for CancellableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn add_in_active_appends() {
        let registry = CancellableRegistry::new();
        assert!(registry.add(CancelHandle::noop()));
        assert_eq!(registry.state(), RegistryState::Active);
    }

    #[test]
    fn add_in_cancelled_cancels_immediately() {
        let registry = CancellableRegistry::new();
        registry.cancel();

        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = CancelHandle::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!registry.add(handle));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn add_in_deactivated_discards_without_cancel() {
        let registry = CancellableRegistry::new();
        assert!(registry.deactivate());

        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = CancelHandle::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!registry.add(handle));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_invokes_all_handles_in_order() {
        let registry = CancellableRegistry::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let o = order.clone();
            registry.add(CancelHandle::new(move || o.lock().unwrap().push(i)));
        }

        registry.cancel();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(registry.state(), RegistryState::Cancelled);
    }

    #[test]
    fn cancel_is_idempotent_and_terminal() {
        let registry = CancellableRegistry::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        registry.add(CancelHandle::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        registry.cancel();
        registry.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // deactivate after cancel must not win
        assert!(!registry.deactivate());
        assert_eq!(registry.state(), RegistryState::Cancelled);
    }

    #[test]
    fn deactivate_wins_exactly_once() {
        let registry = CancellableRegistry::new();
        assert!(registry.deactivate());
        assert!(!registry.deactivate());
        assert_eq!(registry.state(), RegistryState::Deactivated);
    }

    #[test]
    fn reentrant_cancel_from_handle_does_not_deadlock() {
        let registry = Arc::new(CancellableRegistry::new());
        let inner = registry.clone();
        registry.add(CancelHandle::new(move || {
            // Re-entrant cancel from within a handle callback.
            inner.cancel();
        }));

        registry.cancel();
        assert_eq!(registry.state(), RegistryState::Cancelled);
    }
}
