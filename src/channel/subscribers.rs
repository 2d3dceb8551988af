//! Delivery policies wrapping channel subscriptions.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::Subscriber;
use crate::fiber::Fiber;

/// Each message is posted to the fiber as its own command.
pub(super) struct DirectSubscriber<T> {
    fiber: Arc<dyn Fiber>,
    handler: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T> DirectSubscriber<T> {
    pub(super) fn new<F>(fiber: Arc<dyn Fiber>, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            fiber,
            handler: Arc::new(handler),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for DirectSubscriber<T> {
    fn receive(&self, message: T) {
        let handler = Arc::clone(&self.handler);
        // A stopped fiber drops the post.
        let _ = self.fiber.enqueue(Box::new(move || handler(message)));
    }
}

/// The first message in a window schedules a flush after `interval`;
/// everything arriving before the flush joins the batch in order.
pub(super) struct BatchSubscriber<T> {
    fiber: Arc<dyn Fiber>,
    interval: Duration,
    handler: Arc<dyn Fn(Vec<T>) + Send + Sync>,
    pending: Arc<Mutex<Vec<T>>>,
}

impl<T> BatchSubscriber<T> {
    pub(super) fn new<F>(fiber: Arc<dyn Fiber>, interval: Duration, handler: F) -> Self
    where
        F: Fn(Vec<T>) + Send + Sync + 'static,
    {
        Self {
            fiber,
            interval,
            handler: Arc::new(handler),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for BatchSubscriber<T> {
    fn receive(&self, message: T) {
        let opens_window = {
            let mut pending = self.pending.lock();
            let first = pending.is_empty();
            pending.push(message);
            first
        };
        if opens_window {
            let pending = Arc::clone(&self.pending);
            let handler = Arc::clone(&self.handler);
            self.fiber.schedule(
                self.interval,
                Box::new(move || {
                    let batch = std::mem::take(&mut *pending.lock());
                    if !batch.is_empty() {
                        handler(batch);
                    }
                }),
            );
        }
    }
}

/// Batch variant keyed by a caller-supplied function; a later message
/// overwrites the pending value under the same key before the flush.
pub(super) struct KeyedBatchSubscriber<K, T> {
    fiber: Arc<dyn Fiber>,
    interval: Duration,
    key_of: Arc<dyn Fn(&T) -> K + Send + Sync>,
    handler: Arc<dyn Fn(HashMap<K, T>) + Send + Sync>,
    pending: Arc<Mutex<HashMap<K, T>>>,
}

impl<K, T> KeyedBatchSubscriber<K, T> {
    pub(super) fn new<KF, F>(
        fiber: Arc<dyn Fiber>,
        interval: Duration,
        key_of: KF,
        handler: F,
    ) -> Self
    where
        KF: Fn(&T) -> K + Send + Sync + 'static,
        F: Fn(HashMap<K, T>) + Send + Sync + 'static,
    {
        Self {
            fiber,
            interval,
            key_of: Arc::new(key_of),
            handler: Arc::new(handler),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T> Subscriber<T> for KeyedBatchSubscriber<K, T>
where
    K: Eq + Hash + Send + 'static,
    T: Send + 'static,
{
    fn receive(&self, message: T) {
        let key = (self.key_of)(&message);
        let opens_window = {
            let mut pending = self.pending.lock();
            let first = pending.is_empty();
            pending.insert(key, message);
            first
        };
        if opens_window {
            let pending = Arc::clone(&self.pending);
            let handler = Arc::clone(&self.handler);
            self.fiber.schedule(
                self.interval,
                Box::new(move || {
                    let batch = std::mem::take(&mut *pending.lock());
                    if !batch.is_empty() {
                        handler(batch);
                    }
                }),
            );
        }
    }
}

/// Conflating subscription: only the newest pending value survives until
/// the flush runs.
pub(super) struct LastSubscriber<T> {
    fiber: Arc<dyn Fiber>,
    interval: Duration,
    handler: Arc<dyn Fn(T) + Send + Sync>,
    pending: Arc<Mutex<Option<T>>>,
}

impl<T> LastSubscriber<T> {
    pub(super) fn new<F>(fiber: Arc<dyn Fiber>, interval: Duration, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            fiber,
            interval,
            handler: Arc::new(handler),
            pending: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for LastSubscriber<T> {
    fn receive(&self, message: T) {
        let opens_window = {
            let mut pending = self.pending.lock();
            let first = pending.is_none();
            *pending = Some(message);
            first
        };
        if opens_window {
            let pending = Arc::clone(&self.pending);
            let handler = Arc::clone(&self.handler);
            self.fiber.schedule(
                self.interval,
                Box::new(move || {
                    if let Some(latest) = pending.lock().take() {
                        handler(latest);
                    }
                }),
            );
        }
    }
}

/// Runs the handler inline on the publishing thread.
pub(super) struct ProducerThreadSubscriber<T> {
    handler: Box<dyn Fn(T) + Send + Sync>,
}

impl<T> ProducerThreadSubscriber<T> {
    pub(super) fn new<F>(handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for ProducerThreadSubscriber<T> {
    fn receive(&self, message: T) {
        (self.handler)(message);
    }
}
