//! # Serialized Command Queue
//!
//! The bounded FIFO at the heart of every fiber. Producers enqueue
//! zero-argument commands from any thread; a single worker drains the
//! queue in batches and executes them in order.

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::QueueError;

/// A zero-argument unit of work with no return value.
pub type Command = Box<dyn FnOnce() + Send>;

/// Hook wrapping batch execution inside the drain loop.
///
/// The queue never holds its internal lock while this runs, so an
/// executor is free to re-enter the queue it was called from.
pub trait BatchExecutor: Send + Sync {
    fn execute_batch(&self, batch: Vec<Command>);
}

/// Default executor: runs each command directly. A panicking command
/// unwinds out of the drain loop and takes the worker with it.
pub struct DirectExecutor;

impl BatchExecutor for DirectExecutor {
    fn execute_batch(&self, batch: Vec<Command>) {
        for command in batch {
            command();
        }
    }
}

/// Executor that traps per-command panics, reports them through `log`,
/// and keeps the worker alive for the rest of the batch.
pub struct TrappingExecutor;

impl BatchExecutor for TrappingExecutor {
    fn execute_batch(&self, batch: Vec<Command>) {
        for command in batch {
            if panic::catch_unwind(AssertUnwindSafe(command)).is_err() {
                log::error!("command panicked; continuing with next command");
            }
        }
    }
}

/// Per-queue admission parameters.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of pending commands. `None` means unbounded.
    pub max_depth: Option<usize>,
    /// How long a producer may block waiting for space when the queue is
    /// full. Zero means fail fast.
    pub max_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: None,
            max_wait: Duration::ZERO,
        }
    }
}

struct QueueState {
    pending: Vec<Command>,
    running: bool,
}

/// Bounded, thread-safe FIFO of commands drained by a single worker.
///
/// Commands enqueued by one producer thread execute in the exact order
/// enqueued. Once stopped, pending commands are discarded and blocked
/// producers and the drainer are released; a batch already handed to the
/// executor is allowed to finish.
pub struct ExecutionQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    config: QueueConfig,
    executor: Box<dyn BatchExecutor>,
}

impl ExecutionQueue {
    /// Unbounded queue with the default direct executor.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self::with_executor(config, Box::new(DirectExecutor))
    }

    pub fn with_executor(config: QueueConfig, executor: Box<dyn BatchExecutor>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                running: true,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            config,
            executor,
        }
    }

    /// Admit a command.
    ///
    /// When the queue is at max depth this blocks up to the configured
    /// max wait for space, then rechecks capacity exactly once and fails
    /// with [`QueueError::Overflow`] if still full. It never re-blocks.
    pub fn enqueue(&self, command: Command) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(QueueError::Stopped);
        }
        if let Some(max_depth) = self.config.max_depth {
            if state.pending.len() >= max_depth {
                if self.config.max_wait > Duration::ZERO {
                    self.not_full.wait_for(&mut state, self.config.max_wait);
                }
                if !state.running {
                    return Err(QueueError::Stopped);
                }
                if state.pending.len() >= max_depth {
                    return Err(QueueError::Overflow {
                        depth: state.pending.len(),
                    });
                }
            }
        }
        state.pending.push(command);
        self.not_empty.notify_one();
        Ok(())
    }

    /// The worker loop body. Blocks until work arrives, swaps the whole
    /// pending list out, and executes it through the executor hook with
    /// no lock held. Returns when the queue is stopped.
    pub fn run(&self) {
        while let Some(batch) = self.next_batch() {
            self.executor.execute_batch(batch);
        }
    }

    fn next_batch(&self) -> Option<Vec<Command>> {
        let mut state = self.state.lock();
        while state.pending.is_empty() && state.running {
            self.not_empty.wait(&mut state);
        }
        if !state.running {
            return None;
        }
        let batch = std::mem::take(&mut state.pending);
        self.not_full.notify_all();
        Some(batch)
    }

    /// Mark the queue stopped and wake every blocked producer and the
    /// drainer. Pending commands are dropped.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }
        state.running = false;
        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            log::debug!("queue stopped with {} pending commands dropped", dropped);
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Number of commands currently pending.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::new()
    }
}
