//! Fixed-size worker pool over a mutex+condvar FIFO queue.
//!
//! The server dispatcher hands every decoded command to the pool so user
//! callbacks never run on (or block) the dispatch thread. Tasks are
//! nullary closures; [`WorkerPool::execute`] returns a [`TaskHandle`] that
//! can be waited on for the task's result.
//!
//! Shutdown policy is drain-on-shutdown: once the stop flag is set,
//! workers keep taking tasks until the queue is empty and then exit.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, bounded};
use thiserror::Error;

use crate::trace::{info, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Error submitting a task to the pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool has been shut down.
    #[error("task submitted after shutdown")]
    Stopped,
}

/// The result of a pool task, delivered through a rendezvous channel.
///
/// Dropping the handle detaches the task; it still runs.
#[derive(Debug)]
pub struct TaskHandle<T> {
    result: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task completes and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`TaskFailed`] if the task panicked before producing a
    /// result.
    pub fn wait(self) -> Result<T, TaskFailed> {
        self.result.recv().map_err(|_| TaskFailed)
    }
}

/// The task panicked before completing.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("task panicked before completing")]
pub struct TaskFailed;

struct Queue {
    tasks: VecDeque<Task>,
    stop: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    active: AtomicUsize,
}

/// A fixed-size pool of worker threads consuming a FIFO task queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns a pool with `size` worker threads (at least one).
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                stop: false,
            }),
            available: Condvar::new(),
            active: AtomicUsize::new(0),
        });

        let workers = (0..size.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("tether-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a task and returns a handle to its result.
    ///
    /// Thread-safe; may be called from any thread.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Stopped`] if the pool has been shut down.
    pub fn execute<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, result) = bounded(1);
        let task: Task = Box::new(move || {
            let _ = sender.send(task());
        });

        {
            let mut queue = self.shared.queue.lock().expect("pool queue poisoned");
            if queue.stop {
                return Err(PoolError::Stopped);
            }
            queue.tasks.push_back(task);
        }
        self.shared.available.notify_one();

        Ok(TaskHandle { result })
    }

    /// Number of tasks currently executing.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Number of tasks queued but not yet picked up.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("pool queue poisoned")
            .tasks
            .len()
    }

    /// Stops the pool: refuses new tasks, drains the queue, joins all
    /// workers. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock().expect("pool queue poisoned");
            queue.stop = true;
        }
        self.shared.available.notify_all();

        let handles = std::mem::take(&mut *self.workers.lock().expect("pool workers poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().expect("pool queue poisoned");
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if queue.stop {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .expect("pool queue poisoned");
            }
        };

        shared.active.fetch_add(1, Ordering::Relaxed);
        // A panicking user callback must not take the worker down with it.
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!("pool task panicked");
        }
        shared.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn executes_tasks_and_returns_results() {
        let pool = WorkerPool::new(2);
        let handle = pool.execute(|| 2 + 2).unwrap();
        assert_eq!(handle.wait(), Ok(4));
    }

    #[test]
    fn runs_tasks_from_many_submitters() {
        let pool = Arc::new(WorkerPool::new(4));
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let counter = Arc::clone(&counter);
                        pool.execute(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap()
                        .wait()
                        .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn execute_after_shutdown_fails() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        assert_eq!(pool.execute(|| ()).unwrap_err(), PoolError::Stopped);
    }

    #[test]
    fn shutdown_drains_queued_tasks() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(Mutex::new(()));

        // Hold the single worker on the first task so the rest stay queued.
        let held = gate.lock().unwrap();
        let blocker = Arc::clone(&gate);
        pool.execute(move || {
            let _unblocked = blocker.lock().unwrap();
        })
        .unwrap();

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }

        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        pool.shutdown();

        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        let boom = pool.execute(|| panic!("boom")).unwrap();
        assert_eq!(boom.wait(), Err(TaskFailed));

        let handle = pool.execute(|| 7).unwrap();
        assert_eq!(handle.wait(), Ok(7));
    }

    #[test]
    fn pending_count_tracks_queue() {
        let pool = WorkerPool::new(1);
        let gate = Arc::new(Mutex::new(()));

        let held = gate.lock().unwrap();
        let blocker = Arc::clone(&gate);
        pool.execute(move || {
            let _unblocked = blocker.lock().unwrap();
        })
        .unwrap();

        // Give the worker time to take the blocking task off the queue.
        std::thread::sleep(Duration::from_millis(50));
        for _ in 0..3 {
            pool.execute(|| ()).unwrap();
        }
        assert_eq!(pool.pending_tasks(), 3);
        assert_eq!(pool.active_tasks(), 1);

        drop(held);
        pool.shutdown();
        assert_eq!(pool.pending_tasks(), 0);
    }
}
