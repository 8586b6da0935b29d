//! Reactive-to-async iterator.
//!
//! [`AsyncPublisherIterator`] consumes a demand-driven [`Publisher`]
//! element-by-element through a pull-based `next()`, per `spec.md` §4.3.
//! Each call to `next()` emits a single `request(1)` upstream and
//! suspends until either a value, a terminal completion, or cancellation
//! resolves it — the state machine below is the seven-state table in
//! `spec.md` §3/§4.3, transcribed directly.
//!
//! A consumer cancelling mid-`next()` (by dropping the returned future)
//! and dropping the iterator outright both drive the same terminal
//! `cancel` event: there is no Rust analogue of an ambient per-task
//! cancellation signal distinct from future-drop, and the spec's own
//! state table treats both the same way (`§4.3`: "the state machine
//! receives a cancel event"). Once cancelled, the iterator stays
//! cancelled: the throwing variant's `next()` surfaces
//! [`IteratorError::Cancelled`] from that point on, rather than the
//! end-of-sequence mapping a genuine upstream completion gets — the
//! non-throwing [`NeverFailsIterator`] still folds both into `None`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::IteratorError;
use crate::reactive::{Completion, Publisher, Subscriber, Subscription};

type NextResult<T, E> = Result<Option<T>, IteratorError<E>>;
type SubscriptionHandle = Arc<dyn Subscription + Send + Sync>;

enum State<T, E> {
    Idle,
    AwaitingSubscription(oneshot::Sender<NextResult<T, E>>),
    AwaitingConsume(SubscriptionHandle),
    AwaitingInput(SubscriptionHandle, oneshot::Sender<NextResult<T, E>>),
    Finishing(Completion<E>),
    Cancelled,
    Completed,
}

enum ConsumeAction<T, E> {
    Subscribe,
    Request(SubscriptionHandle),
    Finish(oneshot::Sender<NextResult<T, E>>, NextResult<T, E>),
}

fn completion_to_result<T, E>(completion: Completion<E>) -> NextResult<T, E> {
    match completion {
        Completion::Finished => Ok(None),
        Completion::Failure(e) => Err(IteratorError::User(e)),
    }
}

struct Inner<T, E> {
    state: Mutex<State<T, E>>,
}

impl<T, E> Inner<T, E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(State::Idle),
        }
    }

    fn on_consume(&self, tx: oneshot::Sender<NextResult<T, E>>) -> ConsumeAction<T, E> {
        let mut guard = self.state.lock().unwrap();
        match std::mem::replace(&mut *guard, State::Cancelled) {
            State::Idle => {
                *guard = State::AwaitingSubscription(tx);
                ConsumeAction::Subscribe
            }
            State::AwaitingConsume(sub) => {
                *guard = State::AwaitingInput(sub.clone(), tx);
                ConsumeAction::Request(sub)
            }
            State::Finishing(c) => {
                *guard = State::Completed;
                ConsumeAction::Finish(tx, completion_to_result(c))
            }
            State::Cancelled => {
                *guard = State::Cancelled;
                ConsumeAction::Finish(tx, Err(IteratorError::Cancelled))
            }
            State::Completed => {
                *guard = State::Completed;
                ConsumeAction::Finish(tx, Ok(None))
            }
            State::AwaitingSubscription(_) | State::AwaitingInput(_, _) => {
                panic!("AsyncPublisherIterator::next() called while a previous call is still outstanding")
            }
        }
    }

    fn on_receive(&self, sub: SubscriptionHandle) {
        enum Action {
            Request(SubscriptionHandle),
            CancelExtra(SubscriptionHandle),
            None,
        }

        let mut guard = self.state.lock().unwrap();
        let action = match std::mem::replace(&mut *guard, State::Cancelled) {
            State::Idle => {
                *guard = State::AwaitingConsume(sub);
                Action::None
            }
            State::AwaitingSubscription(k) => {
                *guard = State::AwaitingInput(sub.clone(), k);
                Action::Request(sub)
            }
            State::Cancelled => {
                *guard = State::Cancelled;
                Action::CancelExtra(sub)
            }
            other @ (State::AwaitingConsume(_)
            | State::AwaitingInput(_, _)
            | State::Finishing(_)
            | State::Completed) => {
                tracing::warn!(
                    "iterator: on_subscribe fired more than once, cancelling the duplicate subscription"
                );
                *guard = other;
                Action::CancelExtra(sub)
            }
        };
        drop(guard);
        match action {
            Action::Request(sub) => sub.request(1),
            Action::CancelExtra(sub) => sub.cancel(),
            Action::None => {}
        }
    }

    fn on_input(&self, value: T) {
        let mut guard = self.state.lock().unwrap();
        let action = match std::mem::replace(&mut *guard, State::Cancelled) {
            State::AwaitingInput(sub, k) => {
                *guard = State::AwaitingConsume(sub);
                Some((k, Ok(Some(value))))
            }
            other => {
                // A value arrived with no outstanding demand, e.g. a
                // cancellation raced the upstream delivery. Drop it.
                *guard = other;
                None
            }
        };
        drop(guard);
        if let Some((k, result)) = action {
            let _ = k.send(result);
        }
    }

    fn on_completion(&self, completion: Completion<E>) {
        let mut guard = self.state.lock().unwrap();
        let action = match std::mem::replace(&mut *guard, State::Cancelled) {
            State::Idle => {
                *guard = State::Finishing(completion);
                None
            }
            State::AwaitingSubscription(k) => {
                *guard = State::Completed;
                Some((k, completion_to_result(completion)))
            }
            State::AwaitingConsume(_sub) => {
                *guard = State::Finishing(completion);
                None
            }
            State::AwaitingInput(_sub, k) => {
                *guard = State::Completed;
                Some((k, completion_to_result(completion)))
            }
            other @ (State::Finishing(_) | State::Cancelled | State::Completed) => {
                *guard = other;
                None
            }
        };
        drop(guard);
        if let Some((k, result)) = action {
            let _ = k.send(result);
        }
    }

    fn on_cancel(&self) {
        let mut guard = self.state.lock().unwrap();
        let sub_to_cancel = match std::mem::replace(&mut *guard, State::Cancelled) {
            State::Idle | State::AwaitingSubscription(_) | State::Finishing(_) => None,
            State::AwaitingConsume(sub) | State::AwaitingInput(sub, _) => Some(sub),
            State::Cancelled => {
                *guard = State::Cancelled;
                None
            }
            State::Completed => {
                *guard = State::Completed;
                None
            }
        };
        drop(guard);
        if let Some(sub) = sub_to_cancel {
            sub.cancel();
        }
    }
}

struct Adapter<T, E> {
    inner: Arc<Inner<T, E>>,
}

#[async_trait]
impl<T: Send, E: Send> Subscriber for Adapter<T, E> {
    type Item = T;
    type Error = E;

    async fn on_subscribe(&mut self, subscription: Box<dyn Subscription + Send + Sync>) {
        self.inner.on_receive(Arc::from(subscription));
    }

    async fn on_next(&mut self, value: T) {
        self.inner.on_input(value);
    }

    async fn on_complete(&mut self, completion: Completion<E>) {
        self.inner.on_completion(completion);
    }
}

/// A resumption guard that fires a cancel event into the shared state
/// machine if the future awaiting `next()`'s result is dropped before it
/// resolves — the Rust stand-in for "the awaiting task was cancelled".
struct CancelOnDrop<T, E> {
    inner: Arc<Inner<T, E>>,
    completed: bool,
}

impl<T, E> Drop for CancelOnDrop<T, E> {
    fn drop(&mut self) {
        if !self.completed {
            self.inner.on_cancel();
        }
    }
}

/// Pull-based asynchronous iterator over a [`Publisher`].
///
/// One instance subscribes at most once, lazily, on the first call to
/// [`next`](Self::next). Dropping the iterator before the sequence is
/// exhausted cancels the upstream subscription.
pub struct AsyncPublisherIterator<P: Publisher> {
    inner: Arc<Inner<P::Item, P::Error>>,
    publisher: Arc<P>,
}

impl<P> AsyncPublisherIterator<P>
where
    P: Publisher + 'static,
    P::Item: 'static,
    P::Error: 'static,
{
    /// Wraps `publisher`. Subscription is deferred until the first
    /// [`next`](Self::next) call.
    pub fn new(publisher: P) -> Self {
        Self {
            inner: Arc::new(Inner::new()),
            publisher: Arc::new(publisher),
        }
    }

    /// Requests and returns the next element, `None` at end of sequence,
    /// [`IteratorError::User`] on the upstream's failure, or
    /// [`IteratorError::Cancelled`] if the awaiting task is cancelled —
    /// cancellation is sticky, so every later call on this iterator also
    /// returns `Cancelled` rather than end-of-sequence.
    ///
    /// # Panics
    ///
    /// Panics if called again while a previous call's future is still
    /// outstanding — at most one call may be in flight per iterator.
    pub async fn next(&self) -> Result<Option<P::Item>, IteratorError<P::Error>> {
        let (tx, rx) = oneshot::channel();
        let action = self.inner.on_consume(tx);

        match action {
            ConsumeAction::Subscribe => {
                let adapter = Adapter {
                    inner: self.inner.clone(),
                };
                let publisher = self.publisher.clone();
                tokio::spawn(async move {
                    publisher.subscribe(Box::new(adapter)).await;
                });
            }
            ConsumeAction::Request(sub) => sub.request(1),
            ConsumeAction::Finish(tx, result) => {
                let _ = tx.send(result);
            }
        }

        let mut guard = CancelOnDrop {
            inner: self.inner.clone(),
            completed: false,
        };
        let received = rx.await;
        guard.completed = true;

        match received {
            Ok(result) => result,
            // Sender dropped without sending: structurally unreachable
            // given the state machine's exclusivity, but cancellation is
            // the safe fallback rather than panicking a consumer loop.
            Err(_) => Err(IteratorError::Cancelled),
        }
    }

    /// Opts into the non-throwing variant that silently maps upstream
    /// failures to end-of-sequence, for publishers declared never-failing.
    /// See `spec.md` §9's first Open Question — resolved by requiring this
    /// explicit call rather than making it the default.
    pub fn never_fails(self) -> NeverFailsIterator<P> {
        NeverFailsIterator { inner: self }
    }
}

impl<P: Publisher> Drop for AsyncPublisherIterator<P> {
    fn drop(&mut self) {
        self.inner.on_cancel();
    }
}

/// Adapts a publisher into a pull-based asynchronous iterator.
///
/// Equivalent to [`AsyncPublisherIterator::new`]; named to match the
/// upstream contract's vocabulary for readers coming from the publisher
/// side.
pub fn async_values<P>(publisher: P) -> AsyncPublisherIterator<P>
where
    P: Publisher + 'static,
    P::Item: 'static,
    P::Error: 'static,
{
    AsyncPublisherIterator::new(publisher)
}

/// A non-throwing wrapper over [`AsyncPublisherIterator`] that maps any
/// upstream failure to end-of-sequence. Only reachable via
/// [`AsyncPublisherIterator::never_fails`] — never the implicit default.
pub struct NeverFailsIterator<P: Publisher> {
    inner: AsyncPublisherIterator<P>,
}

impl<P> NeverFailsIterator<P>
where
    P: Publisher + 'static,
    P::Item: 'static,
    P::Error: 'static,
{
    /// Requests and returns the next element, or `None` at end of
    /// sequence or on upstream failure.
    pub async fn next(&self) -> Option<P::Item> {
        self.inner.next().await.unwrap_or(None)
    }
}
