//! Thread pool draining type-erased tasks from the MPMC unicast queue.
//!
//! A worked example of the queue cores rather than a scheduling framework:
//! `WORKERS` threads pop boxed closures from an in-process
//! [`crate::sync::mpmc`] channel of capacity `QUEUE` and run them.
//!
//! [`ThreadPool::submit`] returns a [`JoinHandle`] backed by a heap
//! allocated promise; the caller can block on the result or drop the handle
//! and let the task run detached. Task panics are caught, logged and
//! surfaced through the handle.
//!
//! Shutdown is cooperative: [`ThreadPool::stop`] flips an atomic flag once,
//! workers notice it, drain whatever is still queued, and exit; `Drop` stops
//! and joins.
//!
//! # Example
//!
//! ```
//! use sluice::pool::ThreadPool;
//!
//! let pool: ThreadPool<4, 256> = ThreadPool::new();
//!
//! let handle = pool.submit(|| 2 + 2);
//! assert_eq!(handle.join().unwrap(), 4);
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::sync::mpmc;
use crate::trace;

/// A type-erased, heap-allocated unit of work.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Outcome slot shared between a task and its [`JoinHandle`].
struct Promise<R> {
    result: Mutex<Option<thread::Result<R>>>,
    done: Condvar,
}

/// Handle to a submitted task's eventual result.
///
/// Dropping the handle detaches the task; it still runs.
pub struct JoinHandle<R> {
    promise: Arc<Promise<R>>,
}

impl<R> JoinHandle<R> {
    /// Blocks until the task finishes and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the panic payload if the task panicked, mirroring
    /// [`std::thread::JoinHandle::join`].
    pub fn join(self) -> thread::Result<R> {
        let mut slot = self
            .promise
            .result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self
                .promise
                .done
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Returns the result if the task already finished, without blocking.
    pub fn try_join(self) -> Result<thread::Result<R>, Self> {
        {
            let mut slot = self
                .promise
                .result
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(result) = slot.take() {
                return Ok(result);
            }
        }
        Err(self)
    }
}

/// Pool of `WORKERS` threads over an MPMC unicast task queue of capacity
/// `QUEUE`.
///
/// Submission is safe from any thread (the underlying producer handle is
/// `Sync`); each worker holds its own consumer handle.
pub struct ThreadPool<const WORKERS: usize, const QUEUE: usize> {
    tasks: mpmc::Producer<Task, QUEUE>,
    stopping: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl<const WORKERS: usize, const QUEUE: usize> ThreadPool<WORKERS, QUEUE> {
    /// Compile-time validation of the pool shape.
    const SHAPE_OK: () = assert!(WORKERS > 0, "thread pool must have at least one worker");

    /// Starts `WORKERS` worker threads.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a thread.
    #[must_use]
    pub fn new() -> Self {
        let () = Self::SHAPE_OK;

        let (producer, consumer) = mpmc::channel::<Task, QUEUE>();
        let stopping = Arc::new(AtomicBool::new(false));

        let workers = (0..WORKERS)
            .map(|index| {
                let tasks = consumer.clone();
                let stopping = Arc::clone(&stopping);
                thread::Builder::new()
                    .name(format!("sluice-worker-{index}"))
                    .spawn(move || Self::worker(index, &tasks, &stopping))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self {
            tasks: producer,
            stopping,
            workers,
        }
    }

    /// Submits a closure and returns a handle to its result.
    ///
    /// Spins with a cooperative yield while the task queue is full, so
    /// submission always eventually succeeds while workers are draining.
    pub fn submit<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let promise = Arc::new(Promise {
            result: Mutex::new(None),
            done: Condvar::new(),
        });

        let completion = Arc::clone(&promise);
        let mut task: Task = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            if result.is_err() {
                trace::error!("pool task panicked");
            }
            let mut slot = completion
                .result
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *slot = Some(result);
            completion.done.notify_all();
        });

        loop {
            match self.tasks.push(task) {
                Ok(()) => break,
                Err(returned) => {
                    task = returned;
                    thread::yield_now();
                }
            }
        }

        JoinHandle { promise }
    }

    /// Signals the workers to stop and joins them.
    ///
    /// Only the first call flips the flag; workers drain the remaining
    /// queued tasks before exiting, so nothing submitted before `stop` is
    /// lost. Idempotent.
    pub fn stop(&mut self) {
        if self
            .stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            trace::debug!("stopping pool workers");
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn worker(index: usize, tasks: &mpmc::Consumer<Task, QUEUE>, stopping: &AtomicBool) {
        trace::trace!(worker = index, "pool worker started");

        while !stopping.load(Ordering::Acquire) {
            match tasks.pop() {
                Some(task) => task(),
                None => thread::yield_now(),
            }
        }

        // Drain remaining tasks before exiting.
        while let Some(task) = tasks.pop() {
            task();
        }

        trace::trace!(worker = index, "pool worker exited");
    }
}

impl<const WORKERS: usize, const QUEUE: usize> Default for ThreadPool<WORKERS, QUEUE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORKERS: usize, const QUEUE: usize> Drop for ThreadPool<WORKERS, QUEUE> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn submit_returns_the_result() {
        let pool: ThreadPool<2, 16> = ThreadPool::new();

        let handle = pool.submit(|| 21 * 2);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn many_tasks_all_run() {
        let pool: ThreadPool<4, 64> = ThreadPool::new();
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..1_000)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 1_000);
    }

    #[test]
    fn panicking_task_surfaces_through_the_handle() {
        let pool: ThreadPool<1, 16> = ThreadPool::new();

        let bad = pool.submit(|| panic!("boom"));
        assert!(bad.join().is_err());

        // The worker survives the panic.
        let good = pool.submit(|| 7);
        assert_eq!(good.join().unwrap(), 7);
    }

    #[test]
    fn stop_drains_pending_tasks() {
        let mut pool: ThreadPool<1, 256> = ThreadPool::new();
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        pool.stop();

        assert_eq!(counter.load(Ordering::Relaxed), 100);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn detached_tasks_still_run() {
        let mut pool: ThreadPool<2, 16> = ThreadPool::new();
        let counter = Arc::new(AtomicU64::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            drop(pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }

        pool.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }
}
