//! Worker pool for blocking and CPU-bound work

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::completion::Completion;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::scheduler::{context, Core};

/// Outcome of a job as it crosses back to the scheduler thread
pub(crate) type JobOutcome = Result<Box<dyn Any + Send>>;

/// Applies a job outcome to its completion, on the scheduler thread
pub(crate) type Resolver = Box<dyn FnOnce(JobOutcome)>;

type Job = Box<dyn FnOnce() + Send>;

/// Key of an in-flight job in the scheduler's resolver table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct JobId(pub(crate) u64);

/// Message posted by a worker on the handoff channel
pub(crate) struct ExternalCompletion {
    pub(crate) id: JobId,
    pub(crate) outcome: JobOutcome,
}

/// Fixed-size pool of worker threads fed by a crossbeam channel.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    size: usize,
    /// `None` once the pool is shut down
    jobs: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Start a pool with `size` threads (0 = number of CPUs).
    pub fn new(size: usize) -> Result<Self> {
        Self::from_config(&SchedulerConfig::default().with_worker_threads(size))
    }

    pub(crate) fn from_config(config: &SchedulerConfig) -> Result<Self> {
        let size = config.resolved_worker_threads();
        let (tx, rx) = channel::unbounded::<Job>();

        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || worker_loop(rx))
                .map_err(|e| Error::from(anyhow::Error::new(e).context("failed to spawn worker thread")))?;
            handles.push(handle);
        }
        tracing::debug!(size, name = %config.thread_name, "worker pool started");

        Ok(Self {
            inner: Arc::new(PoolInner {
                name: config.thread_name.clone(),
                size,
                jobs: Mutex::new(Some(tx)),
                handles: Mutex::new(handles),
                shutdown_timeout: config.shutdown_timeout,
            }),
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Whether `shutdown` has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.jobs.lock().is_none()
    }

    /// Run `work` on this pool and get a completion that resolves on the
    /// scheduler thread.
    ///
    /// # Panics
    ///
    /// Panics when called outside a running scheduler.
    pub fn submit<F, T>(&self, work: F) -> Completion<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        submit_to(&context::expect_current("WorkerPool::submit"), self, work)
    }

    fn execute(&self, job: Job) -> std::result::Result<(), Job> {
        match self.inner.jobs.lock().as_ref() {
            Some(tx) => tx.send(job).map_err(|rejected| rejected.into_inner()),
            None => Err(job),
        }
    }

    /// Stop accepting jobs, let queued jobs finish and join the threads.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("size", &self.inner.size)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl PoolInner {
    fn shutdown(&self) {
        let Some(sender) = self.jobs.lock().take() else {
            return;
        };
        drop(sender);

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            join_with_timeout(handle, self.shutdown_timeout);
        }
        tracing::debug!(name = %self.name, "worker pool shut down");
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(jobs: Receiver<Job>) {
    // Exits once the pool drops its sender and the queue is drained.
    while let Ok(job) = jobs.recv() {
        job();
    }
}

/// Join a worker, giving up after `timeout` so shutdown never hangs on a
/// job that does not return.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return;
        }
        if start.elapsed() > timeout {
            tracing::warn!(thread = ?handle.thread().name(), "worker did not exit in time; detaching");
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// Submission
// ============================================================================

pub(crate) fn submit_on<F, T>(core: &Rc<Core>, work: F) -> Completion<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match core.default_pool() {
        Ok(pool) => submit_to(core, &pool, work),
        Err(error) => {
            let completion = Completion::with_diagnostics(Some(core.diagnostics()));
            let _ = completion.set_error(error);
            completion
        }
    }
}

pub(crate) fn submit_to<F, T>(core: &Rc<Core>, pool: &WorkerPool, work: F) -> Completion<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let completion = Completion::with_diagnostics(Some(core.diagnostics()));

    let target = completion.clone();
    let resolver: Resolver = Box::new(move |outcome: JobOutcome| {
        if target.is_done() {
            tracing::trace!("worker result discarded: completion already resolved");
            return;
        }
        let outcome = outcome.and_then(|value| {
            value
                .downcast::<T>()
                .map(|value| *value)
                .map_err(|_| Error::msg("worker result has an unexpected type"))
        });
        if let Err(error) = target.resolve(outcome) {
            tracing::trace!(%error, "worker result not applied");
        }
    });
    let (id, tx) = core.register_job(resolver);

    let job: Job = Box::new(move || {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(value)) => Ok(Box::new(value) as Box<dyn Any + Send>),
            Ok(Err(error)) => Err(error),
            Err(payload) => Err(Error::from_panic(payload)),
        };
        if tx.send(ExternalCompletion { id, outcome }).is_err() {
            tracing::trace!(job = id.0, "scheduler gone; worker result dropped");
        }
    });

    if pool.execute(job).is_err() {
        core.forget_job(id);
        let _ = completion.set_error(Error::PoolClosed);
        return completion;
    }
    tracing::trace!(job = id.0, "job submitted");
    completion
}
