//! # Typed Publish/Subscribe Channels
//!
//! A channel fans each published value out to its subscribers, each
//! wrapped in a delivery policy that decides how the value reaches the
//! target fiber: one post per message, accumulated batches, keyed
//! batches, a conflated last value, or inline on the producer thread.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::fiber::{Disposable, Fiber, Registry};

mod subscribers;

use subscribers::{
    BatchSubscriber, DirectSubscriber, KeyedBatchSubscriber, LastSubscriber,
    ProducerThreadSubscriber,
};

/// Delivery policy endpoint. A publish hands the message to each
/// subscriber's `receive` outside any channel lock.
pub trait Subscriber<T>: Send + Sync {
    fn receive(&self, message: T);
}

struct ChannelInner<T> {
    subscribers: Mutex<HashMap<u64, Arc<dyn Subscriber<T>>>>,
    next_id: AtomicU64,
}

/// Typed publish/subscribe hub.
///
/// Publishing dispatches to a snapshot of the subscriber set, so
/// subscribing and unsubscribing are safe at any time, including from a
/// handler that is currently being delivered to.
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T: Clone + Send + 'static> Channel<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Fan `message` out to every current subscriber. Returns how many
    /// subscribers observed it.
    pub fn publish(&self, message: T) -> usize {
        let snapshot: Vec<Arc<dyn Subscriber<T>>> = {
            self.inner.subscribers.lock().values().cloned().collect()
        };
        let count = snapshot.len();
        for subscriber in snapshot {
            subscriber.receive(message.clone());
        }
        count
    }

    /// Post each message individually to the fiber in arrival order.
    pub fn subscribe<F>(&self, fiber: Arc<dyn Fiber>, handler: F) -> SubscriptionHandle
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let subscriber = Arc::new(DirectSubscriber::new(Arc::clone(&fiber), handler));
        self.add_subscriber(Some(&fiber), subscriber)
    }

    /// Accumulate messages for `interval` after the first one arrives,
    /// then deliver the whole ordered batch at once. An empty window
    /// produces no delivery.
    pub fn subscribe_batch<F>(
        &self,
        fiber: Arc<dyn Fiber>,
        interval: Duration,
        handler: F,
    ) -> SubscriptionHandle
    where
        F: Fn(Vec<T>) + Send + Sync + 'static,
    {
        let subscriber = Arc::new(BatchSubscriber::new(Arc::clone(&fiber), interval, handler));
        self.add_subscriber(Some(&fiber), subscriber)
    }

    /// Like [`subscribe_batch`](Self::subscribe_batch), but messages are
    /// keyed and a later message with the same key replaces the earlier
    /// one before the flush.
    pub fn subscribe_keyed_batch<K, KF, F>(
        &self,
        fiber: Arc<dyn Fiber>,
        interval: Duration,
        key_of: KF,
        handler: F,
    ) -> SubscriptionHandle
    where
        K: Eq + Hash + Send + 'static,
        KF: Fn(&T) -> K + Send + Sync + 'static,
        F: Fn(HashMap<K, T>) + Send + Sync + 'static,
    {
        let subscriber = Arc::new(KeyedBatchSubscriber::new(
            Arc::clone(&fiber),
            interval,
            key_of,
            handler,
        ));
        self.add_subscriber(Some(&fiber), subscriber)
    }

    /// Retain at most one pending message: a newer value overwrites the
    /// pending one, so a slow consumer only ever observes the latest.
    pub fn subscribe_last<F>(
        &self,
        fiber: Arc<dyn Fiber>,
        interval: Duration,
        handler: F,
    ) -> SubscriptionHandle
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let subscriber = Arc::new(LastSubscriber::new(Arc::clone(&fiber), interval, handler));
        self.add_subscriber(Some(&fiber), subscriber)
    }

    /// Run the handler synchronously on whichever thread publishes. The
    /// handler must be reentrant and thread-safe; no fiber is involved.
    pub fn subscribe_on_producer_thread<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let subscriber = Arc::new(ProducerThreadSubscriber::new(handler));
        self.add_subscriber(None, subscriber)
    }

    /// Remove every subscription.
    pub fn clear_subscribers(&self) {
        self.inner.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    fn add_subscriber(
        &self,
        fiber: Option<&Arc<dyn Fiber>>,
        subscriber: Arc<dyn Subscriber<T>>,
    ) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(id, subscriber);

        let channel = Arc::downgrade(&self.inner);
        let handle = SubscriptionHandle::new(Box::new(move || {
            if let Some(inner) = channel.upgrade() {
                inner.subscribers.lock().remove(&id);
            }
        }));
        if let Some(fiber) = fiber {
            let registry = fiber.registry();
            let registry_id = registry.add(Box::new(handle.clone()));
            handle.attach_registry(Arc::downgrade(registry), registry_id);
        }
        handle
    }
}

impl<T: Clone + Send + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SubscriptionState {
    disposed: AtomicBool,
    unsubscribe: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    registry: Mutex<Option<(Weak<Registry>, u64)>>,
}

/// Handle to one channel subscription.
///
/// Disposing removes the subscription from the channel and forgets it in
/// the owning fiber's registry; either side alone is enough to stop
/// delivery. Disposal is idempotent and safe concurrently with an
/// in-flight publish, which either observes the subscription or does
/// not, never partially.
#[derive(Clone)]
pub struct SubscriptionHandle {
    state: Arc<SubscriptionState>,
}

impl SubscriptionHandle {
    fn new(unsubscribe: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            state: Arc::new(SubscriptionState {
                disposed: AtomicBool::new(false),
                unsubscribe: Mutex::new(Some(unsubscribe)),
                registry: Mutex::new(None),
            }),
        }
    }

    fn attach_registry(&self, registry: Weak<Registry>, id: u64) {
        *self.state.registry.lock() = Some((registry, id));
    }

    pub fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(unsubscribe) = self.state.unsubscribe.lock().take() {
            unsubscribe();
        }
        if let Some((registry, id)) = self.state.registry.lock().take() {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::Acquire)
    }
}

impl Disposable for SubscriptionHandle {
    fn dispose(&self) {
        SubscriptionHandle::dispose(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::ThreadFiber;

    fn started_fiber() -> Arc<ThreadFiber> {
        let fiber = Arc::new(ThreadFiber::new());
        fiber.start();
        fiber
    }

    #[test]
    fn test_publish_counts_subscribers() {
        let channel = Channel::new();
        let fiber = started_fiber();
        assert_eq!(channel.publish(1u32), 0);

        let _keep = channel.subscribe(fiber.clone(), |_msg| {});
        assert_eq!(channel.publish(2u32), 1);
        fiber.stop();
        fiber.join();
    }

    #[test]
    fn test_dispose_removes_from_channel_and_registry() {
        let channel = Channel::<u32>::new();
        let fiber = started_fiber();

        let handle = channel.subscribe(fiber.clone(), |_msg| {});
        assert_eq!(channel.subscriber_count(), 1);
        assert_eq!(fiber.registry().len(), 1);

        handle.dispose();
        assert_eq!(channel.subscriber_count(), 0);
        assert!(fiber.registry().is_empty());

        handle.dispose();
        assert!(handle.is_disposed());
        fiber.stop();
        fiber.join();
    }

    #[test]
    fn test_fiber_stop_severs_delivery() {
        let channel = Channel::<u32>::new();
        let fiber = started_fiber();

        let _keep = channel.subscribe(fiber.clone(), |_msg| {});
        assert_eq!(channel.subscriber_count(), 1);

        fiber.stop();
        fiber.join();
        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(channel.publish(1), 0);
    }

    #[test]
    fn test_clear_subscribers() {
        let channel = Channel::<u32>::new();
        let fiber = started_fiber();
        let _a = channel.subscribe(fiber.clone(), |_msg| {});
        let _b = channel.subscribe_on_producer_thread(|_msg| {});
        assert_eq!(channel.subscriber_count(), 2);

        channel.clear_subscribers();
        assert_eq!(channel.subscriber_count(), 0);
        fiber.stop();
        fiber.join();
    }

    #[test]
    fn test_producer_thread_subscription_runs_inline() {
        let channel = Channel::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            let _keep = channel.subscribe_on_producer_thread(move |msg| {
                seen.lock().push(msg);
            });
            channel.publish(7);
            // Inline delivery is visible before publish returns.
            assert_eq!(*seen.lock(), vec![7]);
        }
    }
}
