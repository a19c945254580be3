//! Generic reducer-driven state machine.
//!
//! Actions are queued on a channel and applied by one consumer task, so the
//! reducer never runs concurrently with itself and never on the caller's
//! thread. Each produced state is published in order; a new subscriber
//! first receives the current state.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::publisher::{EventPublisher, Subscription, SubscriptionToken};

/// A pure transition function.
pub type Reducer<S, A> = fn(&S, A) -> S;

struct Shared<S> {
    current: Mutex<S>,
    publisher: EventPublisher<S>,
}

/// A state machine over `S` driven by actions `A`.
///
/// Must be created inside a Tokio runtime.
pub struct StateMachine<S, A> {
    actions: mpsc::UnboundedSender<A>,
    shared: Arc<Shared<S>>,
}

impl<S, A> StateMachine<S, A>
where
    S: Clone + Debug + Send + 'static,
    A: Debug + Send + 'static,
{
    /// Starts a machine in `initial` state.
    pub fn new(initial: S, reducer: Reducer<S, A>) -> Self {
        let shared = Arc::new(Shared {
            current: Mutex::new(initial),
            publisher: EventPublisher::new(),
        });
        let (actions, mut queue) = mpsc::unbounded_channel::<A>();
        let consumer = shared.clone();
        tokio::spawn(async move {
            while let Some(action) = queue.recv().await {
                let mut current = consumer.current.lock();
                trace!(state = ?*current, action = ?action, "reducing");
                let next = reducer(&current, action);
                *current = next.clone();
                consumer.publisher.send(next);
            }
        });
        Self { actions, shared }
    }

    /// Queues `action`. Never blocks.
    pub fn notify(&self, action: A) {
        // The consumer only stops when the machine is dropped.
        let _ = self.actions.send(action);
    }

    /// The latest produced state.
    pub fn current(&self) -> S {
        self.shared.current.lock().clone()
    }

    /// Subscribes to states, starting with the current one.
    pub fn subscribe(&self) -> Subscription<S> {
        let current = self.shared.current.lock();
        self.shared.publisher.subscribe_with(|sender| {
            let _ = sender.send(current.clone());
        })
    }

    /// Ends a subscription.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.shared.publisher.unsubscribe(token);
    }

    /// Waits until a state matching `predicate` is produced (or is current).
    pub async fn wait_for(&self, predicate: impl Fn(&S) -> bool) -> S {
        let mut states = self.subscribe();
        let token = states.token();
        let mut last = self.current();
        while let Some(state) = states.recv().await {
            if predicate(&state) {
                self.unsubscribe(token);
                return state;
            }
            last = state;
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn add(state: &i64, action: i64) -> i64 {
        state + action
    }

    #[tokio::test]
    async fn subscribers_see_every_state_in_order() {
        let machine = StateMachine::new(0i64, add);
        let mut states = machine.subscribe();
        for i in 1..=20 {
            machine.notify(i);
        }
        assert_eq!(states.recv().await, Some(0));
        let mut expected = 0;
        for i in 1..=20 {
            expected += i;
            assert_eq!(states.recv().await, Some(expected));
        }
        assert_eq!(machine.current(), 210);
    }

    #[tokio::test]
    async fn late_subscriber_starts_from_current() {
        let machine = StateMachine::new(0i64, add);
        machine.notify(5);
        machine.wait_for(|s| *s == 5).await;
        let mut states = machine.subscribe();
        assert_eq!(states.recv().await, Some(5));
        machine.notify(1);
        assert_eq!(states.recv().await, Some(6));
    }

    static ACTIVE: AtomicUsize = AtomicUsize::new(0);

    fn guarded(state: &u64, _action: ()) -> u64 {
        let active = ACTIVE.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(active, 1, "reducer re-entered");
        std::thread::sleep(Duration::from_micros(50));
        ACTIVE.fetch_sub(1, Ordering::SeqCst);
        state + 1
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reducer_is_never_reentered() {
        let machine = Arc::new(StateMachine::new(0u64, guarded));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let machine = machine.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    machine.notify(());
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let last = machine.wait_for(|s| *s == 200).await;
        assert_eq!(last, 200);
    }
}
