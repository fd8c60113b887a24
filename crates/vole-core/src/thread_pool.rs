use std::any::Any;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::probe::available_cpu_cores;

// ThreadPool — fixed workers, one private FIFO queue each
//
// This is deliberately not a work-stealing pool. The caller decides which
// worker runs which task:
//
//   pool.add_task(0, move |_| ref_a.run_once());
//   pool.add_task(1, move |_| ref_b.run_once());
//   pool.wait_all_tasks();
//
// Static assignment gives deterministic placement. Reference network i always
// runs on worker i, so its buffers stay hot in that worker's cache and no
// two workers ever drive the same network.
//
// QUEUE PROTOCOL:
//
//   Each worker owns a Mutex<QueueState> and a Condvar. A task stays
//   "in flight" from the moment it is popped until it returns; only then is
//   the worker idle again. `wait_all_tasks` blocks until every queue is empty
//   and nothing is in flight. Because every state change goes through the
//   worker's mutex, everything a task wrote happens-before the return of
//   `wait_all_tasks`.
//
// FAILURE:
//
//   A task that panics leaves its network in an unknown state and breaks the
//   barrier contract for every caller waiting on the pool. The worker catches
//   the panic, logs it, and aborts the process.
//
// SINGLE-THREADED POOL:
//
//   A pool resolved to one thread has no workers at all; callers are expected
//   to run work inline. `size()` reports 1, and `add_task` / `wait_all_tasks`
//   panic.

/// A unit of work. Receives the index of the worker running it.
pub type Task = Box<dyn FnOnce(usize) + Send + 'static>;

struct QueueState {
    tasks: VecDeque<Task>,
    stopped: bool,
    in_flight: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && !self.in_flight
    }
}

struct WorkerQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl WorkerQueue {
    fn new() -> Self {
        WorkerQueue {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                stopped: false,
                in_flight: false,
            }),
            cond: Condvar::new(),
        }
    }
}

/// A fixed-size pool of OS threads with per-worker task queues.
pub struct ThreadPool {
    size: usize,
    queues: Vec<Arc<WorkerQueue>>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Create a pool.
    ///
    /// `threads <= 0` sizes the pool to [`available_cpu_cores`]. A resolved
    /// count of 1 creates the single-threaded pool, which spawns nothing.
    pub fn new(threads: isize) -> Self {
        let size = if threads <= 0 {
            available_cpu_cores()
        } else {
            threads as usize
        };

        if size == 1 {
            log::debug!("thread pool: single-threaded");
            return ThreadPool {
                size: 1,
                queues: Vec::new(),
                handles: Vec::new(),
            };
        }

        let mut queues = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let queue = Arc::new(WorkerQueue::new());
            let worker_queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("vole-worker-{index}"))
                .spawn(move || worker_loop(index, &worker_queue))
                .unwrap_or_else(|e| panic!("failed to spawn worker thread {index}: {e}"));
            queues.push(queue);
            handles.push(handle);
        }
        log::debug!("thread pool: started {size} workers");

        ThreadPool {
            size,
            queues,
            handles,
        }
    }

    /// Number of workers (1 for the single-threaded pool).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this pool has no worker threads.
    pub fn is_single_threaded(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queue `task` on `worker`. Returns `false` if the pool was stopped.
    ///
    /// Tasks queued on the same worker run in submission order. There is no
    /// ordering between workers.
    ///
    /// # Panics
    ///
    /// On the single-threaded pool, and if `worker >= self.size()`.
    pub fn add_task<F>(&self, worker: usize, task: F) -> bool
    where
        F: FnOnce(usize) + Send + 'static,
    {
        self.push(worker, Box::new(task))
    }

    fn push(&self, worker: usize, task: Task) -> bool {
        assert!(
            !self.is_single_threaded(),
            "add_task on a single-threaded pool, run the task inline"
        );
        assert!(
            worker < self.size,
            "worker index {worker} out of range for a pool of {}",
            self.size
        );

        let queue = &self.queues[worker];
        let mut state = queue.state.lock();
        if state.stopped {
            return false;
        }
        state.tasks.push_back(task);
        drop(state);
        queue.cond.notify_all();
        true
    }

    /// Block until every queue is empty and no task is running.
    ///
    /// Must not be called from inside a task of the same pool.
    ///
    /// # Panics
    ///
    /// On the single-threaded pool.
    pub fn wait_all_tasks(&self) {
        assert!(
            !self.is_single_threaded(),
            "wait_all_tasks on a single-threaded pool"
        );
        self.wait_idle();
    }

    fn wait_idle(&self) {
        for queue in &self.queues {
            let mut state = queue.state.lock();
            while !state.is_idle() {
                queue.cond.wait(&mut state);
            }
        }
    }

    /// Stop accepting tasks and discard everything still queued.
    ///
    /// A task that is already running finishes. Workers exit afterwards; they
    /// are joined when the pool is dropped.
    pub fn stop(&self) {
        for queue in &self.queues {
            let discarded = {
                let mut state = queue.state.lock();
                state.stopped = true;
                std::mem::take(&mut state.tasks)
            };
            queue.cond.notify_all();
            if !discarded.is_empty() {
                log::debug!("thread pool: discarded {} pending tasks", discarded.len());
            }
        }
    }

    /// Run `f` with a [`Scope`] whose tasks may borrow from the caller.
    ///
    /// All tasks are finished when `scope` returns, even if `f` panics.
    /// On the single-threaded pool scoped tasks run inline.
    ///
    /// ```
    /// use vole_core::ThreadPool;
    ///
    /// let pool = ThreadPool::new(2);
    /// let mut results = vec![0u64; 2];
    /// pool.scope(|s| {
    ///     for (i, slot) in results.iter_mut().enumerate() {
    ///         s.add_task(i, move |_| *slot = (i as u64 + 1) * 10);
    ///     }
    /// });
    /// assert_eq!(results, vec![10, 20]);
    /// ```
    pub fn scope<'env, F, R>(&self, f: F) -> R
    where
        F: for<'pool> FnOnce(&Scope<'pool, 'env>) -> R,
    {
        struct WaitOnDrop<'a>(&'a ThreadPool);

        impl Drop for WaitOnDrop<'_> {
            fn drop(&mut self) {
                self.0.wait_idle();
            }
        }

        let scope = Scope {
            pool: self,
            _env: PhantomData,
        };
        let _guard = WaitOnDrop(self);
        f(&scope)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.stop();
        for handle in self.handles.drain(..) {
            // A worker can only fail by aborting the process, so join errors
            // are unreachable here.
            let _ = handle.join();
        }
        log::debug!("thread pool: joined {} workers", self.size);
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("size", &self.size)
            .field("single_threaded", &self.is_single_threaded())
            .finish()
    }
}

/// Submission handle passed to [`ThreadPool::scope`].
pub struct Scope<'pool, 'env> {
    pool: &'pool ThreadPool,
    // Invariant in 'env, as in std::thread::Scope.
    _env: PhantomData<&'env mut &'env ()>,
}

impl<'pool, 'env> Scope<'pool, 'env> {
    /// Queue a task that may borrow data living for `'env`.
    ///
    /// Same contract as [`ThreadPool::add_task`], except that on a
    /// single-threaded pool the task runs immediately as worker 0.
    pub fn add_task<F>(&self, worker: usize, task: F) -> bool
    where
        F: FnOnce(usize) + Send + 'env,
    {
        if self.pool.is_single_threaded() {
            assert!(worker == 0, "worker index {worker} out of range for a pool of 1");
            task(0);
            return true;
        }
        let task: Box<dyn FnOnce(usize) + Send + 'env> = Box::new(task);
        // SAFETY: `ThreadPool::scope` waits for every queue to drain before
        // returning, including on unwind, and a task either runs or is
        // dropped by `stop` before that wait completes. The borrow therefore
        // never outlives 'env.
        let task: Task = unsafe {
            std::mem::transmute::<Box<dyn FnOnce(usize) + Send + 'env>, Task>(task)
        };
        self.pool.push(worker, task)
    }

    /// Size of the underlying pool.
    pub fn size(&self) -> usize {
        self.pool.size()
    }
}

fn worker_loop(index: usize, queue: &WorkerQueue) {
    loop {
        let task = {
            let mut state = queue.state.lock();
            while state.tasks.is_empty() && !state.stopped {
                queue.cond.wait(&mut state);
            }
            if state.stopped {
                return;
            }
            match state.tasks.pop_front() {
                Some(task) => {
                    state.in_flight = true;
                    task
                }
                None => continue,
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(index))) {
            log::error!(
                "task on worker {index} panicked: {}",
                panic_message(payload.as_ref())
            );
            std::process::abort();
        }

        queue.state.lock().in_flight = false;
        queue.cond.notify_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_barrier_sees_every_task() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..100 {
            let c = Arc::clone(&counter);
            assert!(pool.add_task(i % pool.size(), move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            }));
        }
        pool.wait_all_tasks();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_task_receives_its_worker_index() {
        let pool = ThreadPool::new(3);
        let seen = Arc::new(Mutex::new(vec![usize::MAX; 3]));
        for w in 0..3 {
            let seen = Arc::clone(&seen);
            pool.add_task(w, move |index| seen.lock()[w] = index);
        }
        pool.wait_all_tasks();
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_fifo_per_worker() {
        let pool = ThreadPool::new(2);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let order = Arc::clone(&order);
            pool.add_task(1, move |_| order.lock().push(i));
        }
        pool.wait_all_tasks();
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_sizing() {
        assert_eq!(ThreadPool::new(3).size(), 3);
        assert!(ThreadPool::new(0).size() >= 1);
        assert!(ThreadPool::new(-1).size() >= 1);
        let single = ThreadPool::new(1);
        assert_eq!(single.size(), 1);
        assert!(single.is_single_threaded());
    }

    #[test]
    #[should_panic(expected = "single-threaded")]
    fn test_single_threaded_add_task_panics() {
        ThreadPool::new(1).add_task(0, |_| {});
    }

    #[test]
    #[should_panic(expected = "single-threaded")]
    fn test_single_threaded_wait_panics() {
        ThreadPool::new(1).wait_all_tasks();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_worker_out_of_range_panics() {
        let pool = ThreadPool::new(2);
        pool.add_task(2, |_| {});
    }

    #[test]
    fn test_stopped_pool_rejects_tasks() {
        let pool = ThreadPool::new(2);
        pool.stop();
        assert!(!pool.add_task(0, |_| {}));
        // Nothing queued, so the barrier returns immediately.
        pool.wait_all_tasks();
    }

    #[test]
    fn test_wait_without_tasks_returns() {
        let pool = ThreadPool::new(2);
        pool.wait_all_tasks();
        pool.wait_all_tasks();
    }

    #[test]
    fn test_scope_borrows_stack_data() {
        let pool = ThreadPool::new(4);
        let input: Vec<u32> = (1..=8).collect();
        let mut partial = vec![0u32; 4];
        pool.scope(|s| {
            for (w, (slot, chunk)) in partial.iter_mut().zip(input.chunks(2)).enumerate() {
                s.add_task(w, move |_| *slot = chunk.iter().sum());
            }
        });
        assert_eq!(partial, vec![3, 7, 11, 15]);
    }

    #[test]
    fn test_scope_on_single_threaded_pool_runs_inline() {
        let pool = ThreadPool::new(1);
        let mut hit = false;
        pool.scope(|s| {
            s.add_task(0, |w| {
                assert_eq!(w, 0);
                hit = true;
            });
        });
        assert!(hit);
    }
}
