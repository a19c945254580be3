//! Ordered fan-out of change notifications.
//!
//! Every subscriber has its own unbounded channel. Values are pushed into
//! all channels while the subscriber list is locked, so concurrent senders
//! are observed in the same order by every subscriber.
//!
//! ```rust,ignore
//! let publisher = EventPublisher::new();
//! let mut subscription = publisher.subscribe();
//! publisher.send(event);
//! while let Some(event) = subscription.recv().await { /* ... */ }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// How a publisher finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Finished normally.
    Finished,
    /// Finished with an error.
    Failed(String),
}

/// Identifies one subscription for [`EventPublisher::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Subscriber<T> {
    token: SubscriptionToken,
    sender: mpsc::UnboundedSender<T>,
    completion: Arc<Mutex<Option<Completion>>>,
}

struct Inner<T> {
    subscribers: Vec<Subscriber<T>>,
    next_token: u64,
    completion: Option<Completion>,
}

/// Multi-subscriber publisher with explicit unsubscribe tokens.
pub struct EventPublisher<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for EventPublisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> EventPublisher<T> {
    /// Creates a publisher with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                subscribers: Vec::new(),
                next_token: 0,
                completion: None,
            })),
        }
    }

    /// Subscribes to values sent from now on.
    ///
    /// Subscribing to a completed publisher yields a subscription that ends
    /// immediately with the recorded completion.
    pub fn subscribe(&self) -> Subscription<T> {
        self.subscribe_with(|_| {})
    }

    /// Subscribes, running `prime` with the sender before any other value
    /// can be published.
    pub(crate) fn subscribe_with(&self, prime: impl FnOnce(&mpsc::UnboundedSender<T>)) -> Subscription<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let token = SubscriptionToken(inner.next_token);
        inner.next_token += 1;
        let completion = Arc::new(Mutex::new(inner.completion.clone()));
        if inner.completion.is_none() {
            prime(&sender);
            inner.subscribers.push(Subscriber {
                token,
                sender,
                completion: completion.clone(),
            });
        }
        Subscription {
            token,
            receiver,
            completion,
        }
    }

    /// Removes a subscription. Its receiver drains what was already sent.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.inner.lock().subscribers.retain(|s| s.token != token);
    }

    /// Sends `value` to every live subscriber.
    ///
    /// Returns the number of subscribers that received it. Values sent after
    /// completion are dropped.
    pub fn send(&self, value: T) -> usize {
        let mut inner = self.inner.lock();
        if inner.completion.is_some() {
            return 0;
        }
        inner
            .subscribers
            .retain(|s| s.sender.send(value.clone()).is_ok());
        inner.subscribers.len()
    }

    /// Completes every subscription.
    pub fn complete(&self, completion: Completion) {
        let mut inner = self.inner.lock();
        if inner.completion.is_some() {
            return;
        }
        for subscriber in inner.subscribers.drain(..) {
            *subscriber.completion.lock() = Some(completion.clone());
        }
        inner.completion = Some(completion);
    }

    /// Accepts subscribers again after a completion.
    pub fn reopen(&self) {
        self.inner.lock().completion = None;
    }

    /// The completion, if the publisher has finished.
    pub fn completion(&self) -> Option<Completion> {
        self.inner.lock().completion.clone()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

impl<T: Clone + Send + 'static> Default for EventPublisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The receiving end of a subscription.
pub struct Subscription<T> {
    token: SubscriptionToken,
    receiver: mpsc::UnboundedReceiver<T>,
    completion: Arc<Mutex<Option<Completion>>>,
}

impl<T> Subscription<T> {
    /// Waits for the next value.
    ///
    /// Returns `None` once the subscription is completed or unsubscribed and
    /// every value sent before that has been received.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Returns the next value if one is ready.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// The token to pass to [`EventPublisher::unsubscribe`].
    pub fn token(&self) -> SubscriptionToken {
        self.token
    }

    /// How the publisher finished, once it has.
    pub fn completion(&self) -> Option<Completion> {
        self.completion.lock().clone()
    }
}
