//! Fiber backed by a dedicated worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::{next_thread_index, Fiber, Registry};
use crate::error::QueueError;
use crate::queue::{BatchExecutor, Command, ExecutionQueue, QueueConfig};
use crate::scheduler::{ExecutionContext, Scheduler, TimerHandle};

/// An execution context that owns one command queue and one named OS
/// thread draining it.
///
/// Commands may be enqueued before `start`; they run once the worker
/// begins draining. `stop` stops the queue, cancels pending timers, and
/// releases registered subscriptions; `join` then waits for the worker
/// to exit.
pub struct ThreadFiber {
    queue: Arc<ExecutionQueue>,
    scheduler: Scheduler,
    registry: Arc<Registry>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    name: String,
}

impl ThreadFiber {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self::build(Arc::new(ExecutionQueue::with_config(config)))
    }

    pub fn with_executor(config: QueueConfig, executor: Box<dyn BatchExecutor>) -> Self {
        Self::build(Arc::new(ExecutionQueue::with_executor(config, executor)))
    }

    fn build(queue: Arc<ExecutionQueue>) -> Self {
        let scheduler = Scheduler::new(Arc::clone(&queue) as Arc<dyn ExecutionContext>);
        Self {
            queue,
            scheduler,
            registry: Arc::new(Registry::new()),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
            name: format!("filament-fiber-{}", next_thread_index()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the worker thread has exited. A worker killed by a
    /// panicking command only takes this fiber down, so the join error
    /// is swallowed here.
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for ThreadFiber {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext for ThreadFiber {
    fn enqueue(&self, command: Command) -> Result<(), QueueError> {
        self.queue.enqueue(command)
    }
}

impl Fiber for ThreadFiber {
    fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = Arc::clone(&self.queue);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                queue.run();
            })
            .expect("failed to spawn fiber thread");
        *self.worker.lock() = Some(handle);
    }

    fn stop(&self) {
        self.queue.stop();
        self.scheduler.cancel_all();
        self.registry.dispose_all();
    }

    fn schedule(&self, delay: Duration, command: Command) -> TimerHandle {
        self.scheduler.schedule(delay, command)
    }

    fn schedule_on_interval(
        &self,
        first_delay: Duration,
        interval: Duration,
        command: Arc<dyn Fn() + Send + Sync>,
    ) -> TimerHandle {
        self.scheduler
            .schedule_on_interval(first_delay, interval, command)
    }

    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}
