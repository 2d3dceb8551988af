//! Fiber that borrows threads from a shared pool per flush.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::{Fiber, Registry};
use crate::error::QueueError;
use crate::pool::WorkerPool;
use crate::queue::{BatchExecutor, Command, DirectExecutor};
use crate::scheduler::{ExecutionContext, Scheduler, TimerHandle};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

struct PoolQueueState {
    pending: Vec<Command>,
    flushing: bool,
    lifecycle: Lifecycle,
}

/// Queue flushed through transient pool submissions.
///
/// At most one flush task exists at a time; it alone may re-submit
/// itself, which preserves serialization without a dedicated thread.
struct PoolQueue {
    self_ref: Weak<PoolQueue>,
    pool: Arc<dyn WorkerPool>,
    executor: Box<dyn BatchExecutor>,
    state: Mutex<PoolQueueState>,
}

impl PoolQueue {
    fn new(pool: Arc<dyn WorkerPool>, executor: Box<dyn BatchExecutor>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            pool,
            executor,
            state: Mutex::new(PoolQueueState {
                pending: Vec::new(),
                flushing: false,
                lifecycle: Lifecycle::Created,
            }),
        })
    }

    fn start(&self) {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Created {
            return;
        }
        state.lifecycle = Lifecycle::Running;
        if !state.pending.is_empty() && !state.flushing {
            state.flushing = true;
            drop(state);
            self.submit_flush();
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Stopped {
            return;
        }
        state.lifecycle = Lifecycle::Stopped;
        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            log::debug!("pool queue stopped with {} pending commands dropped", dropped);
        }
    }

    fn submit_flush(&self) {
        if let Some(this) = self.self_ref.upgrade() {
            self.pool.submit(Box::new(move || this.flush()));
        }
    }

    /// One fairness quantum: drain everything queued right now, execute
    /// it, then hand the pool thread back, re-submitting only if new
    /// work arrived while executing.
    fn flush(&self) {
        let batch = {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Running {
                state.flushing = false;
                return;
            }
            std::mem::take(&mut state.pending)
        };
        self.executor.execute_batch(batch);
        let resubmit = {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Running && !state.pending.is_empty() {
                true
            } else {
                state.flushing = false;
                false
            }
        };
        if resubmit {
            self.submit_flush();
        }
    }
}

impl ExecutionContext for PoolQueue {
    fn enqueue(&self, command: Command) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Stopped => Err(QueueError::Stopped),
            Lifecycle::Created => {
                // Accepted but held until start.
                state.pending.push(command);
                Ok(())
            }
            Lifecycle::Running => {
                state.pending.push(command);
                if !state.flushing {
                    state.flushing = true;
                    drop(state);
                    self.submit_flush();
                }
                Ok(())
            }
        }
    }
}

/// An execution context sharing threads with other fibers through a
/// [`WorkerPool`], with the same serialization guarantee as a dedicated
/// thread fiber.
pub struct PoolFiber {
    queue: Arc<PoolQueue>,
    scheduler: Scheduler,
    registry: Arc<Registry>,
}

impl PoolFiber {
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        Self::with_executor(pool, Box::new(DirectExecutor))
    }

    pub fn with_executor(pool: Arc<dyn WorkerPool>, executor: Box<dyn BatchExecutor>) -> Self {
        let queue = PoolQueue::new(pool, executor);
        let scheduler = Scheduler::new(Arc::clone(&queue) as Arc<dyn ExecutionContext>);
        Self {
            queue,
            scheduler,
            registry: Arc::new(Registry::new()),
        }
    }
}

impl ExecutionContext for PoolFiber {
    fn enqueue(&self, command: Command) -> Result<(), QueueError> {
        self.queue.enqueue(command)
    }
}

impl Fiber for PoolFiber {
    fn start(&self) {
        self.queue.start();
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
