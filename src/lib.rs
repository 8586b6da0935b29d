//! Bridges callback and reactive-publisher APIs into structured-concurrency
//! async primitives.
//!
//! This crate provides three cores, each solving one flavor of "adapt a
//! push-style API into something an `async fn` can simply `.await`":
//!
//! - [`bridge`]: [`bridge::await_cancellable`] turns a
//!   callback-plus-cancel-handle API into a single suspending call with
//!   cooperative cancellation.
//! - [`iterator`]: [`iterator::AsyncPublisherIterator`] turns a
//!   demand-driven reactive [`reactive::Publisher`] into a pull-based
//!   async iterator, one `next().await` at a time.
//! - [`channel`]: [`channel::AsyncChannel`] is a rendezvous,
//!   multi-subscriber broadcast sink with backpressure — `send` suspends
//!   until every subscriber has both consumed a value and asked for the
//!   next one.
//!
//! [`handle::CancelHandle`] and [`registry::CancellableRegistry`] are the
//! shared cancellation primitives the bridge builds on; [`queue::AsyncQueue`]
//! and [`task_factory`] round out the crate with a sequential task queue and
//! a spawn abstraction with a test double.
//!
//! # Status
//!
//! All modules listed above are implemented.

pub mod bridge;
pub mod channel;
pub mod error;
pub mod handle;
pub mod iterator;
pub mod queue;
pub mod reactive;
pub mod registry;
pub mod task_factory;

/// Re-exports of the crate's most commonly used types.
///
/// ```
/// use trestle::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bridge::{await_cancellable, Complete};
    pub use crate::channel::AsyncChannel;
    pub use crate::error::{BridgeError, Cancelled, ChannelError, IteratorError, QueueError};
    pub use crate::handle::CancelHandle;
    pub use crate::iterator::{async_values, AsyncPublisherIterator};
    pub use crate::queue::{AsyncQueue, TaskHandle};
    pub use crate::reactive::{Completion, Publisher, Subscriber, Subscription};
    pub use crate::registry::{CancellableRegistry, RegistryState};
    pub use crate::task_factory::{TaskFactory, TestTaskFactory};
}
