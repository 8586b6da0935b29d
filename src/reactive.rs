//! Upstream reactive contract.
//!
//! [`crate::iterator::AsyncPublisherIterator`] consumes any type that
//! implements [`Publisher`]: a demand-driven, push-model source that
//! hands a [`Subscription`] to a [`Subscriber`] on subscribe, then pushes
//! values and a terminal [`Completion`] as demand allows. This mirrors a
//! Reactive Streams-style contract; it is assumed, not provided, by this
//! crate (`spec.md` §4.3 calls it out as an upstream contract).

use async_trait::async_trait;

/// Terminal signal sent to a [`Subscriber`] at most once.
#[derive(Debug, Clone)]
pub enum Completion<E> {
    /// The publisher has no more values to deliver.
    Finished,
    /// The publisher failed; forwarded opaquely to the subscriber.
    Failure(E),
}

/// A live request for more values, held by a publisher on behalf of a
/// subscriber.
///
/// `cancel()` stops further deliveries and is idempotent; see
/// `spec.md` §3's async-subscription state.
pub trait Subscription: Send + Sync {
    /// Grants `n` (`n >= 1`) further value deliveries.
    fn request(&self, n: u64);

    /// Stops further deliveries. Idempotent.
    fn cancel(&self);
}

/// Receives values and a terminal completion from a publisher.
///
/// A publisher calls [`Subscriber::on_subscribe`] exactly once, followed
/// by any number of [`Subscriber::on_next`] calls (never exceeding
/// outstanding demand), followed by exactly one
/// [`Subscriber::on_complete`].
#[async_trait]
pub trait Subscriber: Send {
    /// The element type delivered by [`Subscriber::on_next`].
    type Item: Send;
    /// The failure type carried by a [`Completion::Failure`].
    type Error: Send;

    /// Called once, before any other method, with the subscription this
    /// subscriber should use to request values and cancel.
    async fn on_subscribe(&mut self, subscription: Box<dyn Subscription + Send + Sync>);

    /// Delivers one value. Never called more times than outstanding
    /// demand authorizes.
    async fn on_next(&mut self, value: Self::Item);

    /// Delivers the terminal completion. Called at most once, and no
    /// further `on_next` calls follow it.
    async fn on_complete(&mut self, completion: Completion<Self::Error>);
}

/// A source of values that publishes only in response to demand.
///
/// Implementations drive an internal producer (a socket, a timer, a
/// hand-rolled generator) and must themselves respect the demand the
/// subscription reports — this crate's downstream types never request
/// more than one value at a time.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// The element type this publisher produces.
    type Item: Send;
    /// The failure type this publisher may terminate with.
    type Error: Send;

    /// Subscribes `subscriber`, which will receive exactly one
    /// `on_subscribe` call synchronously followed by a stream of
    /// `on_next`/`on_complete` calls driven by the demand it requests.
    async fn subscribe(&self, subscriber: Box<dyn Subscriber<Item = Self::Item, Error = Self::Error> + Send>);
}
