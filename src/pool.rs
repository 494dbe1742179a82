//! Fixed-size worker pool shared by every pipeline stage.
//!
//! Tasks are pushed onto a single FIFO channel drained by `n` named OS
//! threads. Each push returns a [`TaskHandle`] backed by its own one-shot
//! channel, so callers wait for exactly the work they submitted.
//!
//! Shutdown comes in two flavours:
//!
//! - [`WorkerPool::stop`] asks workers to exit after their current task.
//!   Anything still queued is discarded and its handle reports
//!   [`PoolError::Cancelled`].
//! - [`WorkerPool::shutdown`] first waits until the queue is empty and no
//!   task is running, then stops.
//!
//! Dropping a pool calls [`WorkerPool::stop`]; it never waits for the queue.
//!
//! ```
//! use jkbuild::pool::WorkerPool;
//!
//! let pool = WorkerPool::new(2);
//! pool.start().expect("spawn workers");
//! let handle = pool.push(|| 6 * 7);
//! assert_eq!(handle.wait().expect("task ran"), 42);
//! pool.shutdown();
//! ```

use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Failures observed while waiting on a pooled task.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The pool stopped before the task ran.
    #[error("task was cancelled before it ran")]
    Cancelled,
}

/// Number of workers used when none is configured.
#[must_use]
pub fn default_concurrency() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Bookkeeping shared by the pool, its handles, and its workers.
#[derive(Debug, Default)]
struct Shared {
    stopping: AtomicBool,
    /// Tasks queued or running.
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl Shared {
    fn begin_one(&self) {
        *self.outstanding.lock() += 1;
    }

    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.idle.wait(&mut outstanding);
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

/// Cloneable submission side of a [`WorkerPool`].
///
/// Tasks that fan out further work capture a `PoolHandle` rather than the
/// pool itself, so the pool (and its thread handles) is never dropped from
/// inside one of its own workers.
#[derive(Clone)]
pub struct PoolHandle {
    jobs: Sender<Job>,
    shared: Arc<Shared>,
}

impl PoolHandle {
    /// Queue `task` and return a handle that resolves when it finishes.
    pub fn push<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (done, receiver) = crossbeam_channel::bounded(1);
        if self.shared.is_stopping() {
            // Dropping `done` resolves the handle as cancelled.
            return TaskHandle { receiver };
        }
        self.shared.begin_one();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task));
            let _receiver_gone = done.send(outcome);
        });
        if self.jobs.send(job).is_err() {
            self.shared.finish_one();
        }
        TaskHandle { receiver }
    }
}

/// Completion signal for one pushed task.
#[must_use = "a task handle does nothing unless waited on"]
pub struct TaskHandle<T> {
    receiver: Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Panicked`] if the task panicked and
    /// [`PoolError::Cancelled`] if the pool stopped before running it.
    pub fn wait(self) -> Result<T, PoolError> {
        match self.receiver.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(PoolError::Panicked(panic_message(payload.as_ref()))),
            Err(_) => Err(PoolError::Cancelled),
        }
    }
}

/// Wait on every handle, even after a failure, and return the results in
/// submission order.
///
/// # Errors
///
/// Returns the first [`PoolError`] encountered, in submission order.
pub fn join_all<T>(handles: Vec<TaskHandle<T>>) -> Result<Vec<T>, PoolError> {
    let mut results = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        match handle.wait() {
            Ok(value) => results.push(value),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    first_error.map_or(Ok(results), Err)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

/// Bounded pool of OS threads pulling from one FIFO queue.
pub struct WorkerPool {
    size: usize,
    handle: PoolHandle,
    jobs: Receiver<Job>,
    stop_signal: Mutex<Option<Sender<()>>>,
    stop_observed: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool of `n_threads` workers. No thread runs until
    /// [`Self::start`]; tasks pushed earlier wait in the queue.
    #[must_use]
    pub fn new(n_threads: usize) -> Self {
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        Self {
            size: n_threads.max(1),
            handle: PoolHandle {
                jobs: jobs_tx,
                shared: Arc::new(Shared::default()),
            },
            jobs: jobs_rx,
            stop_signal: Mutex::new(Some(stop_tx)),
            stop_observed: stop_rx,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Spawn the worker threads. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] if a thread cannot be created.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() || self.handle.shared.is_stopping() {
            return Ok(());
        }
        for index in 0..self.size {
            let jobs = self.jobs.clone();
            let stop = self.stop_observed.clone();
            let shared = Arc::clone(&self.handle.shared);
            let worker = thread::Builder::new()
                .name(format!("jk-worker-{index}"))
                .spawn(move || worker_loop(&jobs, &stop, &shared))
                .map_err(PoolError::Spawn)?;
            workers.push(worker);
        }
        debug!(threads = self.size, "worker pool started");
        Ok(())
    }

    /// Submission handle that can be moved into tasks.
    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Queue `task`; see [`PoolHandle::push`].
    pub fn push<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.handle.push(task)
    }

    /// Ask workers to exit after their current task and join them.
    ///
    /// Queued tasks that have not started are discarded.
    pub fn stop(&self) {
        self.handle.shared.stopping.store(true, Ordering::Release);
        // Closing the stop channel wakes every worker blocked in `select!`.
        drop(self.stop_signal.lock().take());
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("worker thread exited abnormally");
            }
        }
        let mut discarded = 0_usize;
        while let Ok(job) = self.jobs.try_recv() {
            drop(job);
            self.handle.shared.finish_one();
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "dropped queued tasks on stop");
        }
    }

    /// Run everything already queued, then stop.
    ///
    /// Workers are started first if necessary so the queue can drain.
    pub fn shutdown(&self) {
        if self.start().is_ok() {
            self.handle.shared.wait_idle();
        }
        self.stop();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(jobs: &Receiver<Job>, stop: &Receiver<()>, shared: &Shared) {
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(jobs) -> job => {
                let Ok(job) = job else { break };
                if shared.is_stopping() {
                    drop(job);
                    shared.finish_one();
                    break;
                }
                job();
                shared.finish_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[rstest]
    fn runs_every_task_exactly_once() {
        let pool = WorkerPool::new(4);
        pool.start().expect("start");
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let handles: Vec<_> = (0..500)
            .map(|i| {
                let counter = Arc::clone(&counter);
                let seen = Arc::clone(&seen);
                pool.push(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert!(seen.lock().insert(i), "task {i} ran twice");
                })
            })
            .collect();
        join_all(handles).expect("all tasks succeed");
        assert_eq!(counter.load(Ordering::SeqCst), 500);
        assert_eq!(seen.lock().len(), 500);
        pool.shutdown();
    }

    #[rstest]
    fn returns_task_values_in_submission_order() {
        let pool = WorkerPool::new(3);
        pool.start().expect("start");
        let handles: Vec<_> = (0..20).map(|i| pool.push(move || i * 2)).collect();
        let values = join_all(handles).expect("values");
        assert_eq!(values, (0..20).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[rstest]
    fn tasks_queued_before_start_run_after_start() {
        let pool = WorkerPool::new(2);
        let handle = pool.push(|| "late");
        pool.start().expect("start");
        assert_eq!(handle.wait().expect("ran"), "late");
    }

    #[rstest]
    fn panics_are_reported_and_worker_survives() {
        let pool = WorkerPool::new(1);
        pool.start().expect("start");
        let failing = pool.push(|| -> u32 { panic!("boom") });
        let err = failing.wait().expect_err("panicked");
        assert!(matches!(err, PoolError::Panicked(ref msg) if msg == "boom"));
        assert_eq!(pool.push(|| 1).wait().expect("worker still alive"), 1);
    }

    #[rstest]
    fn tasks_can_push_more_tasks() {
        let pool = WorkerPool::new(2);
        pool.start().expect("start");
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = pool.handle();
        let outer_counter = Arc::clone(&counter);
        pool.push(move || {
            for _ in 0..10 {
                let counter = Arc::clone(&outer_counter);
                let _detached = handle.push(move || counter.fetch_add(1, Ordering::SeqCst));
            }
        })
        .wait()
        .expect("outer task");
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[rstest]
    fn stop_cancels_queued_work() {
        let pool = WorkerPool::new(1);
        let handle = pool.push(|| ());
        pool.stop();
        assert!(matches!(handle.wait(), Err(PoolError::Cancelled)));
        assert!(matches!(pool.push(|| ()).wait(), Err(PoolError::Cancelled)));
    }

    #[rstest]
    fn shutdown_drains_queue() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.push(move || {
                    thread::sleep(Duration::from_millis(1));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        join_all(handles).expect("all ran");
    }

    #[rstest]
    fn drop_without_stop_does_not_hang() {
        let pool = WorkerPool::new(2);
        pool.start().expect("start");
        let _pending = pool.push(|| thread::sleep(Duration::from_millis(5)));
        drop(pool);
    }
}
