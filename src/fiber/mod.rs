//! # Execution Contexts
//!
//! A fiber binds a serialized command queue to a worker, either a
//! dedicated thread or transient borrows from a shared pool. Work
//! delivered to one fiber never interleaves with other work on that same
//! fiber, no matter how many producer threads feed it concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::queue::Command;
use crate::scheduler::{ExecutionContext, TimerHandle};

mod pool_fiber;
mod thread_fiber;

pub use pool_fiber::PoolFiber;
pub use thread_fiber::ThreadFiber;

// Process-wide counter used to name every thread the crate spawns.
static THREAD_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn next_thread_index() -> usize {
    THREAD_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A resource released when its owning fiber stops.
pub trait Disposable: Send + Sync {
    /// Idempotent release.
    fn dispose(&self);
}

impl Disposable for TimerHandle {
    fn dispose(&self) {
        self.cancel();
    }
}

/// Set of live resources bound to a fiber's lifetime.
///
/// Channel subscriptions created through a fiber land here so stopping
/// the fiber severs delivery to a worker that no longer runs.
pub struct Registry {
    entries: Mutex<HashMap<u64, Box<dyn Disposable>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add(&self, resource: Box<dyn Disposable>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, resource);
        id
    }

    /// Forget an entry without disposing it. Used when a handle is
    /// disposed directly and removes itself from its owner.
    pub fn remove(&self, id: u64) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Dispose and drop every entry. Runs outside the registry lock so a
    /// disposal that calls back into the registry cannot deadlock.
    pub fn dispose_all(&self) {
        let drained: Vec<Box<dyn Disposable>> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, resource)| resource).collect()
        };
        for resource in drained {
            resource.dispose();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// The execution context contract shared by all fiber flavors.
///
/// `enqueue` admits work, `schedule`/`schedule_on_interval` defer it, and
/// the registry ties channel subscriptions to the fiber's lifetime.
/// `stop` stops the queue, cancels pending timers, and releases every
/// registered subscription.
pub trait Fiber: ExecutionContext {
    fn start(&self);

    fn stop(&self);

    fn schedule(&self, delay: Duration, command: Command) -> TimerHandle;

    fn schedule_on_interval(
        &self,
        first_delay: Duration,
        interval: Duration,
        command: Arc<dyn Fn() + Send + Sync>,
    ) -> TimerHandle;

    fn registry(&self) -> &Arc<Registry>;
}
