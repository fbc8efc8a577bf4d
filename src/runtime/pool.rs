//! Worker pool for interpreting fibers and asynchronous producers.
//!
//! This is the executor collaborator the interpreter consumes: something
//! that takes a task and runs it exactly once, on some thread that is never
//! the submitting one. Fibers, `shift`, and timer implementations all go
//! through it.
//!
//! # Thread Lifecycle
//!
//! Threads are spawned lazily up to `max_threads`. When idle beyond a
//! threshold, threads above `min_threads` are retired. Submission after
//! shutdown is rejected rather than silently dropped.

use crossbeam_queue::SegQueue;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default idle timeout before retiring excess threads.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// A unit of work accepted by an executor.
pub type Task = Box<dyn FnOnce() + Send>;

/// Something that schedules tasks onto other threads.
///
/// Implementations must run each accepted task exactly once and must not
/// execute it inline on the submitting thread; the interpreter relies on
/// that to break recursive callback chains.
pub trait Executor: Send + Sync {
    /// Schedules a task.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError`] if the executor no longer accepts work.
    fn submit(&self, task: Task) -> Result<(), SubmitError>;
}

/// Error returned when task submission fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The pool has been shut down.
    #[error("worker pool is shut down")]
    Shutdown,
}

/// A fixed-policy worker pool.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("min_threads", &self.inner.min_threads)
            .field("max_threads", &self.inner.max_threads)
            .field(
                "active_threads",
                &self.inner.active_threads.load(Ordering::Relaxed),
            )
            .field(
                "pending_tasks",
                &self.inner.pending_count.load(Ordering::Relaxed),
            )
            .finish()
    }
}

struct PoolInner {
    /// Minimum number of threads to keep alive.
    min_threads: usize,
    /// Maximum number of threads allowed.
    max_threads: usize,
    /// Current number of live threads.
    active_threads: AtomicUsize,
    /// Number of threads currently executing work.
    busy_threads: AtomicUsize,
    /// Number of queued tasks.
    pending_count: AtomicUsize,
    /// Work queue.
    queue: SegQueue<Task>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Condition variable for thread parking.
    condvar: Condvar,
    /// Mutex for the condition variable.
    mutex: Mutex<()>,
    /// Idle timeout for excess threads.
    idle_timeout: Duration,
    /// Thread name prefix.
    thread_name_prefix: String,
    /// Join handles for cleanup.
    thread_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Configuration options for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    /// Idle timeout before retiring excess threads.
    pub idle_timeout: Duration,
    /// Thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            thread_name_prefix: "pureio".to_string(),
        }
    }
}

impl WorkerPool {
    /// Creates a new pool with the given thread limits.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` is 0.
    #[must_use]
    pub fn new(min_threads: usize, max_threads: usize) -> Self {
        Self::with_options(min_threads, max_threads, WorkerPoolOptions::default())
    }

    /// Creates a new pool with custom options.
    #[must_use]
    pub fn with_options(
        min_threads: usize,
        max_threads: usize,
        options: WorkerPoolOptions,
    ) -> Self {
        assert!(max_threads > 0, "max_threads must be at least 1");
        let max_threads = max_threads.max(min_threads);

        let inner = Arc::new(PoolInner {
            min_threads,
            max_threads,
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            idle_timeout: options.idle_timeout,
            thread_name_prefix: options.thread_name_prefix,
            thread_handles: Mutex::new(Vec::with_capacity(max_threads)),
        });

        let pool = Self { inner };
        for _ in 0..min_threads {
            spawn_thread(&pool.inner);
        }
        pool
    }

    /// Returns the number of queued tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns `true` if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Initiates shutdown. No new tasks are accepted; queued tasks still run.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock().expect("pool mutex poisoned");
        self.inner.condvar.notify_all();
    }

    /// Shuts down and waits for all threads to exit.
    ///
    /// Returns `true` if every thread exited before the timeout elapsed.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        let deadline = std::time::Instant::now() + timeout;
        while self.inner.active_threads.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            {
                let _guard = self.inner.mutex.lock().expect("pool mutex poisoned");
                self.inner.condvar.notify_all();
            }
            thread::sleep(Duration::from_millis(10).min(remaining));
        }

        let mut handles = self
            .inner
            .thread_handles
            .lock()
            .expect("pool handles poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        true
    }
}

impl Executor for WorkerPool {
    fn submit(&self, task: Task) -> Result<(), SubmitError> {
        if self.is_shutdown() {
            return Err(SubmitError::Shutdown);
        }
        self.inner.queue.push(task);
        self.inner.pending_count.fetch_add(1, Ordering::Relaxed);
        maybe_spawn_thread(&self.inner);
        let _guard = self.inner.mutex.lock().expect("pool mutex poisoned");
        self.inner.condvar.notify_one();
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        let _ = self.shutdown_and_wait(Duration::from_secs(5));
    }
}

fn spawn_thread(inner: &Arc<PoolInner>) {
    let inner_clone = Arc::clone(inner);
    let thread_id = inner.active_threads.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-worker-{}", inner.thread_name_prefix, thread_id);

    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            worker_loop(&inner_clone);
            inner_clone.active_threads.fetch_sub(1, Ordering::Relaxed);
        })
        .expect("failed to spawn pool thread");

    inner
        .thread_handles
        .lock()
        .expect("pool handles poisoned")
        .push(handle);
}

fn maybe_spawn_thread(inner: &Arc<PoolInner>) {
    let active = inner.active_threads.load(Ordering::Relaxed);
    let busy = inner.busy_threads.load(Ordering::Relaxed);
    let pending = inner.pending_count.load(Ordering::Relaxed);

    if active < inner.max_threads && busy >= active && pending > 0 {
        spawn_thread(inner);
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        if let Some(task) = inner.queue.pop() {
            inner.pending_count.fetch_sub(1, Ordering::Relaxed);
            inner.busy_threads.fetch_add(1, Ordering::Relaxed);
            task();
            inner.busy_threads.fetch_sub(1, Ordering::Relaxed);
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let active = inner.active_threads.load(Ordering::Relaxed);
        if active > inner.min_threads {
            let result = inner
                .condvar
                .wait_timeout(
                    inner.mutex.lock().expect("pool mutex poisoned"),
                    inner.idle_timeout,
                )
                .expect("pool mutex poisoned");
            if result.1.timed_out()
                && inner.queue.is_empty()
                && inner.active_threads.load(Ordering::Relaxed) > inner.min_threads
            {
                break;
            }
        } else {
            let guard = inner.mutex.lock().expect("pool mutex poisoned");
            let _guard = inner.condvar.wait(guard).expect("pool mutex poisoned");
        }
    }
}

static DEFAULT_POOL: OnceLock<WorkerPool> = OnceLock::new();

/// The process-wide default pool. Never shut down; sized to the machine's
/// available parallelism (at least four workers, so interpretations that
/// park a worker do not starve their siblings).
pub fn default_pool() -> &'static WorkerPool {
    DEFAULT_POOL.get_or_init(|| {
        let parallelism = thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        WorkerPool::new(2, parallelism.max(4))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn submit_runs_task() {
        let pool = WorkerPool::new(1, 2);
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        pool.submit(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("submit");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "task never ran");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn many_tasks_all_run() {
        let pool = WorkerPool::new(2, 4);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let c = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("submit");
        }
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(1, 1);
        pool.shutdown();
        let err = pool.submit(Box::new(|| {})).expect_err("must reject");
        assert_eq!(err, SubmitError::Shutdown);
    }

    #[test]
    fn min_threads_spawn_eagerly() {
        let pool = WorkerPool::new(2, 4);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.active_threads(), 2);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = WorkerPool::new(1, 2);
        pool.submit(Box::new(|| {})).expect("submit");
        pool.shutdown();
        assert!(pool.is_shutdown());
        pool.shutdown();
        assert!(pool.shutdown_and_wait(Duration::from_secs(2)));
    }
}
