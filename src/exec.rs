//! Execution strategies: how to run a unit of work and later wait for it.
//!
//! Three backends behind one [`Async`] front:
//! - [`Threads`]: every submission gets a dedicated named OS thread.
//! - [`Pool`]: a bounded set of workers fed by an unbounded channel; each
//!   job reports through a one-shot result channel acting as its future.
//! - [`ForkJoin`]: a rayon work-stealing pool. A worker joining inside the
//!   pool helps execute other queued work, which the lazy graph exploits.
//!   The same property makes it unusable for shared-feed producers, so
//!   those entry points reject it up front.
//!
//! The backend is chosen by explicit construction, never inferred from a
//! handle's concrete type. A panic inside a submitted task is captured and
//! surfaces on join of that task's handle, not swallowed.

use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use once_cell::sync::Lazy as LazyCell;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// A unit of background work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Counters shared with every backend of a strategy.
#[derive(Debug, Default)]
pub struct ExecStats {
    /// Tasks handed to the backend.
    pub submitted: AtomicUsize,
    /// Tasks that ran to completion.
    pub completed: AtomicUsize,
    /// Tasks that panicked.
    pub panicked: AtomicUsize,
}

impl ExecStats {
    /// Fraction of finished tasks that completed without panicking, as a
    /// percentage. Zero when nothing has finished yet.
    pub fn success_rate(&self) -> f64 {
        let completed = self.completed.load(Ordering::Relaxed) as f64;
        let panicked = self.panicked.load(Ordering::Relaxed) as f64;
        let finished = completed + panicked;
        if finished > 0.0 {
            (completed / finished) * 100.0
        } else {
            0.0
        }
    }

    pub fn in_flight(&self) -> usize {
        let submitted = self.submitted.load(Ordering::Relaxed);
        let finished = self.completed.load(Ordering::Relaxed) + self.panicked.load(Ordering::Relaxed);
        submitted.saturating_sub(finished)
    }
}

/// Configuration for the bounded-pool backend.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Thread-name prefix for the workers.
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            name: "hotseq-worker".to_string(),
        }
    }
}

/// Handle returned by `submit`; consumers only join on it.
pub struct TaskHandle(Repr);

enum Repr {
    Thread(thread::JoinHandle<()>),
    Oneshot(Receiver<std::result::Result<(), String>>),
}

impl TaskHandle {
    /// Block until the task has finished, surfacing a captured panic.
    pub fn join(self) -> Result<()> {
        match self.0 {
            Repr::Thread(handle) => handle
                .join()
                .map_err(|payload| Error::TaskPanicked(panic_message(payload.as_ref()))),
            Repr::Oneshot(rx) => match rx.recv() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(message)) => Err(Error::TaskPanicked(message)),
                Err(_) => Err(Error::Shutdown),
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Thread-per-task backend.
pub struct Threads {
    name: String,
    seq: AtomicUsize,
    stats: Arc<ExecStats>,
}

impl Threads {
    fn new(name: String) -> Self {
        Self {
            name,
            seq: AtomicUsize::new(0),
            stats: Arc::new(ExecStats::default()),
        }
    }

    fn submit(&self, work: Job) -> Result<TaskHandle> {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::clone(&self.stats);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, n))
            .spawn(move || match catch_unwind(AssertUnwindSafe(work)) {
                Ok(()) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(payload) => {
                    stats.panicked.fetch_add(1, Ordering::Relaxed);
                    resume_unwind(payload);
                }
            })
            .map_err(|e| Error::Spawn(e.to_string()))?;
        Ok(TaskHandle(Repr::Thread(handle)))
    }
}

/// Bounded worker pool backend.
pub struct Pool {
    injector: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
    stats: Arc<ExecStats>,
}

impl Pool {
    fn new(config: PoolConfig) -> Result<Self> {
        let workers = config.workers.max(1);
        let (tx, rx) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.name, i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|e| Error::Spawn(e.to_string()))?;
            handles.push(handle);
        }
        debug!(workers, "bounded pool started");
        Ok(Self {
            injector: Some(tx),
            workers: handles,
            stats: Arc::new(ExecStats::default()),
        })
    }

    fn submit(&self, work: Job) -> Result<TaskHandle> {
        let injector = self.injector.as_ref().ok_or(Error::Shutdown)?;
        let (tx, rx) = bounded(1);
        let stats = Arc::clone(&self.stats);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let job: Job = Box::new(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(()) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(payload) => {
                    stats.panicked.fetch_add(1, Ordering::Relaxed);
                    Err(panic_message(payload.as_ref()))
                }
            };
            let _ = tx.send(outcome);
        });
        injector.send(job).map_err(|_| Error::Shutdown)?;
        Ok(TaskHandle(Repr::Oneshot(rx)))
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain outstanding jobs and exit.
        self.injector.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        trace!("bounded pool shut down");
    }
}

/// Work-stealing backend over a rayon pool.
#[derive(Clone)]
pub struct ForkJoin {
    pool: Arc<rayon::ThreadPool>,
    stats: Arc<ExecStats>,
}

static COMMON: LazyCell<ForkJoin> = LazyCell::new(|| {
    let pool = rayon::ThreadPoolBuilder::new()
        .thread_name(|i| format!("hotseq-forkjoin-{i}"))
        .build()
        .expect("failed to build common fork/join pool");
    ForkJoin {
        pool: Arc::new(pool),
        stats: Arc::new(ExecStats::default()),
    }
});

impl ForkJoin {
    /// Build a dedicated work-stealing pool. `threads == 0` uses the rayon
    /// default (one per logical CPU).
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("hotseq-forkjoin-{i}"))
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(Self {
            pool: Arc::new(pool),
            stats: Arc::new(ExecStats::default()),
        })
    }

    /// The process-wide default pool, built once on first use.
    pub fn common() -> Self {
        COMMON.clone()
    }

    pub fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    fn submit(&self, work: Job) -> Result<TaskHandle> {
        let (tx, rx) = bounded(1);
        let stats = Arc::clone(&self.stats);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.pool.spawn(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(()) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(payload) => {
                    stats.panicked.fetch_add(1, Ordering::Relaxed);
                    Err(panic_message(payload.as_ref()))
                }
            };
            let _ = tx.send(outcome);
        });
        Ok(TaskHandle(Repr::Oneshot(rx)))
    }
}

/// An execution strategy: submit a unit of work, join on it later.
pub enum Async {
    Threads(Threads),
    Pool(Pool),
    ForkJoin(ForkJoin),
}

impl Async {
    /// Thread-per-task strategy with the default name prefix.
    pub fn threads() -> Arc<Self> {
        Self::threads_named("hotseq-task")
    }

    pub fn threads_named(prefix: &str) -> Arc<Self> {
        Arc::new(Async::Threads(Threads::new(prefix.to_string())))
    }

    /// Bounded-pool strategy with `workers` worker threads.
    pub fn pool(workers: usize) -> Result<Arc<Self>> {
        Self::with_config(PoolConfig {
            workers,
            ..PoolConfig::default()
        })
    }

    pub fn with_config(config: PoolConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Async::Pool(Pool::new(config)?)))
    }

    /// Work-stealing strategy over a dedicated rayon pool.
    pub fn fork_join(threads: usize) -> Result<Arc<Self>> {
        Ok(Arc::new(Async::ForkJoin(ForkJoin::new(threads)?)))
    }

    /// Work-stealing strategy over the process-wide default pool.
    pub fn fork_join_common() -> Arc<Self> {
        Arc::new(Async::ForkJoin(ForkJoin::common()))
    }

    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Result<TaskHandle> {
        self.submit_boxed(Box::new(work))
    }

    pub(crate) fn submit_boxed(&self, work: Job) -> Result<TaskHandle> {
        match self {
            Async::Threads(t) => t.submit(work),
            Async::Pool(p) => p.submit(work),
            Async::ForkJoin(fj) => fj.submit(work),
        }
    }

    pub fn join(&self, handle: TaskHandle) -> Result<()> {
        handle.join()
    }

    /// Submit every unit of work, then wait for all of them. Returns only
    /// after the whole batch has finished; if any task failed, the first
    /// failure in submission order is propagated.
    pub fn join_all(&self, works: Vec<Work>) -> Result<()> {
        let handles = works
            .into_iter()
            .map(|w| self.submit_boxed(w))
            .collect::<Result<Vec<_>>>()?;
        let mut first_failure = None;
        for handle in handles {
            if let Err(e) = handle.join() {
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> &ExecStats {
        match self {
            Async::Threads(t) => &t.stats,
            Async::Pool(p) => &p.stats,
            Async::ForkJoin(fj) => &fj.stats,
        }
    }

    pub fn as_fork_join(&self) -> Option<&ForkJoin> {
        match self {
            Async::ForkJoin(fj) => Some(fj),
            _ => None,
        }
    }

    /// Shared feeds need a producer that can block on a full drain without
    /// stealing queued work; a work-stealing wait could let the consuming
    /// thread drain the queue out of order.
    pub(crate) fn ensure_dedicated_producer(&self, what: &str) -> Result<()> {
        if matches!(self, Async::ForkJoin(_)) {
            return Err(Error::Configuration(format!(
                "{what} requires a dedicated producer; use a thread or bounded-pool strategy, not fork/join"
            )));
        }
        Ok(())
    }
}

/// Sleep helper for paced producers.
pub fn delay(duration: Duration) {
    thread::sleep(duration);
}

/// Shared slot for a task handle that is assigned at most once.
pub(crate) struct TaskSlot(Mutex<Option<TaskHandle>>);

impl TaskSlot {
    pub fn empty() -> Self {
        Self(Mutex::new(None))
    }

    pub fn put(&self, handle: TaskHandle) {
        *self.0.lock() = Some(handle);
    }

    /// Join the held task if one was started. Idempotent: later calls are a
    /// no-op returning `Ok`.
    pub fn join(&self) -> Result<()> {
        let handle = self.0.lock().take();
        match handle {
            Some(h) => h.join(),
            None => Ok(()),
        }
    }
}
