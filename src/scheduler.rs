//! # Timer-Driven Scheduling
//!
//! Turns delayed and periodic work into queue posts. A single shared
//! timekeeping thread services a time-ordered heap of pending timers and
//! never executes user code itself: an expiry only ever posts the command
//! onto its target queue, so per-fiber serialization is preserved.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::error::QueueError;
use crate::fiber::next_thread_index;
use crate::queue::Command;

/// The narrow posting capability a timer holds on its target.
pub trait ExecutionContext: Send + Sync {
    fn enqueue(&self, command: Command) -> Result<(), QueueError>;
}

impl ExecutionContext for crate::queue::ExecutionQueue {
    fn enqueue(&self, command: Command) -> Result<(), QueueError> {
        crate::queue::ExecutionQueue::enqueue(self, command)
    }
}

/// Cancellable handle to a pending timer.
///
/// Cancellation is idempotent: cancelling twice, or after a one-shot has
/// already fired, has no further effect and never errors.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self { cancelled }
    }

    /// Handle for work that was posted immediately; cancel is a no-op.
    fn already_fired() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

enum TimerTask {
    OneShot(Option<Command>),
    Periodic {
        every: Duration,
        command: Arc<dyn Fn() + Send + Sync>,
    },
}

struct TimerEntry {
    due: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    target: Arc<dyn ExecutionContext>,
    task: TimerTask,
}

impl TimerEntry {
    /// Post the command onto the target queue. Periodic entries re-arm
    /// relative to fire time and return themselves for re-insertion.
    fn fire(mut self) -> Option<TimerEntry> {
        match self.task {
            TimerTask::OneShot(ref mut slot) => {
                if let Some(command) = slot.take() {
                    if let Err(err) = self.target.enqueue(command) {
                        log::debug!("one-shot timer post dropped: {}", err);
                    }
                }
                None
            }
            TimerTask::Periodic { every, ref command } => {
                let tick = Arc::clone(command);
                if let Err(err) = self.target.enqueue(Box::new(move || tick())) {
                    log::debug!("periodic timer post dropped: {}", err);
                }
                self.due = Instant::now() + every;
                Some(self)
            }
        }
    }
}

// Earliest due time wins; sequence number breaks ties so same-instant
// timers fire in schedule order.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerQueue {
    entries: BinaryHeap<TimerEntry>,
    running: bool,
    next_seq: u64,
}

struct TimerShared {
    state: Mutex<TimerQueue>,
    wakeup: Condvar,
}

enum TimerAction {
    Fire(TimerEntry),
    Exit,
}

static DEFAULT_TIMER: Lazy<Arc<TimerThread>> = Lazy::new(TimerThread::new);

/// Background timekeeping loop shared by any number of schedulers.
///
/// Holds expirations in a binary heap and sleeps until the earliest one
/// is due. Cancelled entries are skipped lazily when popped.
pub struct TimerThread {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerQueue {
                entries: BinaryHeap::new(),
                running: true,
                next_seq: 0,
            }),
            wakeup: Condvar::new(),
        });
        let loop_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("filament-timer-{}", next_thread_index()))
            .spawn(move || Self::run(loop_shared))
            .expect("failed to spawn timer thread");
        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// The process-wide default instance, started on first use.
    pub fn shared() -> Arc<TimerThread> {
        Arc::clone(&DEFAULT_TIMER)
    }

    fn run(shared: Arc<TimerShared>) {
        loop {
            let action = {
                let mut state = shared.state.lock();
                loop {
                    if !state.running {
                        break TimerAction::Exit;
                    }
                    let next_due = state.entries.peek().map(|entry| entry.due);
                    match next_due {
                        None => {
                            shared.wakeup.wait(&mut state);
                        }
                        Some(due) => {
                            let now = Instant::now();
                            if due <= now {
                                if let Some(entry) = state.entries.pop() {
                                    if entry.cancelled.load(Ordering::Acquire) {
                                        continue;
                                    }
                                    break TimerAction::Fire(entry);
                                }
                            } else {
                                shared.wakeup.wait_for(&mut state, due - now);
                            }
                        }
                    }
                }
            };
            match action {
                TimerAction::Exit => break,
                TimerAction::Fire(entry) => {
                    if let Some(rearmed) = entry.fire() {
                        let mut state = shared.state.lock();
                        state.entries.push(rearmed);
                        shared.wakeup.notify_one();
                    }
                }
            }
        }
        log::debug!("timer thread exited");
    }

    fn schedule_entry(
        &self,
        due: Instant,
        cancelled: Arc<AtomicBool>,
        target: Arc<dyn ExecutionContext>,
        task: TimerTask,
    ) {
        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(TimerEntry {
            due,
            seq,
            cancelled,
            target,
            task,
        });
        self.shared.wakeup.notify_one();
    }

    /// Stop the loop and join the worker. Pending entries never fire.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Converts one-shot and periodic requests into posts onto one target
/// queue, tracking every pending handle so an owning fiber can cancel
/// them all at stop.
pub struct Scheduler {
    target: Arc<dyn ExecutionContext>,
    timer: Arc<TimerThread>,
    pending: Mutex<Vec<Weak<AtomicBool>>>,
}

impl Scheduler {
    /// Scheduler backed by the process-wide shared timer thread.
    pub fn new(target: Arc<dyn ExecutionContext>) -> Self {
        Self::with_timer(target, TimerThread::shared())
    }

    pub fn with_timer(target: Arc<dyn ExecutionContext>, timer: Arc<TimerThread>) -> Self {
        Self {
            target,
            timer,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Run `command` once after `delay`. A zero delay posts immediately
    /// without a timer entry.
    pub fn schedule(&self, delay: Duration, command: Command) -> TimerHandle {
        if delay.is_zero() {
            if let Err(err) = self.target.enqueue(command) {
                log::debug!("immediate schedule dropped: {}", err);
            }
            return TimerHandle::already_fired();
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        self.track(&cancelled);
        self.timer.schedule_entry(
            Instant::now() + delay,
            Arc::clone(&cancelled),
            Arc::clone(&self.target),
            TimerTask::OneShot(Some(command)),
        );
        TimerHandle::new(cancelled)
    }

    /// Run `command` after `first_delay` and then every `interval` until
    /// the returned handle is cancelled.
    pub fn schedule_on_interval(
        &self,
        first_delay: Duration,
        interval: Duration,
        command: Arc<dyn Fn() + Send + Sync>,
    ) -> TimerHandle {
        // A zero interval would spin the timer thread.
        let every = interval.max(Duration::from_millis(1));
        let cancelled = Arc::new(AtomicBool::new(false));
        self.track(&cancelled);
        self.timer.schedule_entry(
            Instant::now() + first_delay,
            Arc::clone(&cancelled),
            Arc::clone(&self.target),
            TimerTask::Periodic {
                every,
                command,
            },
        );
        TimerHandle::new(cancelled)
    }

    /// Cancel every timer scheduled through this scheduler that has not
    /// already fired.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.pending.lock().drain(..).collect();
        for weak in drained {
            if let Some(flag) = weak.upgrade() {
                flag.store(true, Ordering::Release);
            }
        }
    }

    fn track(&self, flag: &Arc<AtomicBool>) {
        let mut pending = self.pending.lock();
        pending.retain(|weak| weak.strong_count() > 0);
        pending.push(Arc::downgrade(flag));
    }
}
