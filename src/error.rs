//! Error taxonomy shared by the bridge, channel, and queue state machines.
//!
//! Each component owns its own error enum and `Result` alias rather than
//! funneling everything through one crate-wide error type — the bridge can
//! only ever fail with cancellation, the channel has two programmer-error
//! kinds on top of that, and both can carry an opaque user error forwarded
//! verbatim from a callback or publisher.

use std::fmt;

/// The surrounding task was cooperatively cancelled.
///
/// Carries no payload — cancellation is a signal, not a value. Produced at
/// every suspension point named in the crate (`await_cancellable`,
/// iterator `next`, channel `send`, queue `perform`) and never swallowed
/// silently except by the explicit [`crate::iterator::NeverFailsIterator`]
/// adapter, which maps it (and any user error) to end-of-sequence by
/// design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation was cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Error produced by [`crate::bridge::await_cancellable`].
#[derive(thiserror::Error, Debug)]
pub enum BridgeError<E> {
    /// The awaiting task was cancelled before or during the callback.
    #[error("operation was cancelled")]
    Cancelled,

    /// The callback completed with a caller-supplied error.
    #[error(transparent)]
    User(E),
}

impl<E> From<Cancelled> for BridgeError<E> {
    fn from(_: Cancelled) -> Self {
        BridgeError::Cancelled
    }
}

/// Result alias scoped to [`BridgeError`].
pub type BridgeResult<T, E> = Result<T, BridgeError<E>>;

/// Error produced by [`crate::channel::AsyncChannel::send`] and
/// [`crate::channel::AsyncChannel::send_completion`].
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    /// A `send` or `send_completion` overlapped with another outstanding
    /// `send` on the same channel. This is a programmer error: the
    /// channel forbids multi-producer concurrent `send` by contract
    /// (see `spec.md` §4.4); it does not transition the channel into a
    /// failure state.
    #[error("concurrent access: a send is already outstanding on this channel")]
    ConcurrentAccess,

    /// `send` or `send_completion` was attempted after the channel
    /// already reached a terminal state (`finished` or `cancelled`).
    #[error("output to finished: the channel has already terminated")]
    OutputToFinished,

    /// The producer's task was cancelled while a `send` was outstanding.
    #[error("operation was cancelled")]
    Cancelled,
}

/// Result alias scoped to [`ChannelError`].
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Error produced by [`crate::queue::AsyncQueue::perform`] and the
/// throwing flavor of [`crate::queue::AsyncQueue::enqueue`].
#[derive(thiserror::Error, Debug)]
pub enum QueueError<E> {
    /// The calling task was cancelled while awaiting the queued
    /// operation (only surfaced from `perform`, see `spec.md` §9).
    #[error("operation was cancelled")]
    Cancelled,

    /// The queued operation itself failed.
    #[error(transparent)]
    Operation(E),
}

impl<E> From<Cancelled> for QueueError<E> {
    fn from(_: Cancelled) -> Self {
        QueueError::Cancelled
    }
}

/// Result alias scoped to [`QueueError`].
pub type QueueResult<T, E> = Result<T, QueueError<E>>;

/// Error produced by [`crate::iterator::AsyncPublisherIterator::next`].
#[derive(thiserror::Error, Debug)]
pub enum IteratorError<E> {
    /// The awaiting task was cancelled before a value, a terminal
    /// completion, or a failure arrived from upstream. A cancelled
    /// iterator stays cancelled: every subsequent `next()` also returns
    /// this, rather than being indistinguishable from end-of-sequence.
    #[error("operation was cancelled")]
    Cancelled,

    /// The upstream publisher completed with a caller-supplied error.
    #[error(transparent)]
    User(E),
}

impl<E> From<Cancelled> for IteratorError<E> {
    fn from(_: Cancelled) -> Self {
        IteratorError::Cancelled
    }
}

/// Result alias scoped to [`IteratorError`].
pub type IteratorResult<T, E> = Result<T, IteratorError<E>>;
