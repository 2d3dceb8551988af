//! # Shared Worker Pool
//!
//! Pool-backed fibers borrow threads instead of owning one. The core
//! only requires the single capability of submitting a unit of work;
//! `DefaultThreadPool` is the batteries-included implementation.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};

use crate::fiber::next_thread_index;
use crate::queue::Command;

/// Submit a zero-argument unit of work for asynchronous execution.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, job: Command);
}

/// Fixed-size pool of named worker threads fed by a crossbeam channel.
///
/// Dropping the pool disconnects the feed and joins the workers; jobs
/// already submitted are still executed first.
pub struct DefaultThreadPool {
    jobs: Option<Sender<Command>>,
    workers: Vec<JoinHandle<()>>,
}

impl DefaultThreadPool {
    pub fn new(worker_count: usize) -> Self {
        let (jobs, feed) = unbounded::<Command>();
        let workers = (0..worker_count)
            .map(|_| {
                let feed = feed.clone();
                thread::Builder::new()
                    .name(format!("filament-pool-{}", next_thread_index()))
                    .spawn(move || {
                        while let Ok(job) = feed.recv() {
                            job();
                        }
                        log::debug!("pool worker exited");
                    })
                    .expect("failed to spawn pool worker")
            })
            .collect();
        Self {
            jobs: Some(jobs),
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Default for DefaultThreadPool {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl WorkerPool for DefaultThreadPool {
    fn submit(&self, job: Command) {
        if let Some(jobs) = &self.jobs {
            let _ = jobs.send(job);
        }
    }
}

impl Drop for DefaultThreadPool {
    fn drop(&mut self) {
        // Disconnect the feed so idle workers observe the close.
        drop(self.jobs.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_submitted_jobs_run() {
        let pool = DefaultThreadPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let ran = Arc::clone(&ran);
            pool.submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ran.load(Ordering::SeqCst) < 8 && std::time::Instant::now() < deadline {
            thread::yield_now();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_drop_drains_queued_jobs() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let pool = DefaultThreadPool::new(1);
            for _ in 0..4 {
                let ran = Arc::clone(&ran);
                pool.submit(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        // Drop joined the worker, which drains the feed before exiting.
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_default_sizes_to_cpu_count() {
        let pool = DefaultThreadPool::default();
        assert_eq!(pool.worker_count(), num_cpus::get());
    }
}
