//! Scheduler core
//!
//! Each loop iteration drains the worker handoff channel, fires due timers,
//! moves woken tasks onto the ready queue and polls one ready task. With
//! nothing runnable the loop either jumps the virtual clock or blocks on the
//! wake and handoff channels until the next deadline.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use crossbeam::channel::{self, Receiver, Sender};
use rustc_hash::FxHashMap;

use super::context;
use super::task::{Task, TaskHeader, TaskId, TaskState, TaskWaker};
use super::timer::{TimerKey, TimerQueue};
use crate::bridge::{ExternalCompletion, JobId, Resolver, WorkerPool};
use crate::completion::{Completion, ErasedCompletion};
use crate::config::{ClockMode, SchedulerConfig};
use crate::error::{Error, Result};

type LocalBoxFuture = Pin<Box<dyn Future<Output = ()>>>;

// ============================================================================
// Diagnostics and stats
// ============================================================================

/// Counters bumped from completion cells without borrowing scheduler state.
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    unobserved_errors: Cell<u64>,
    callback_panics: Cell<u64>,
}

impl Diagnostics {
    pub(crate) fn record_unobserved_error(&self) {
        self.unobserved_errors.set(self.unobserved_errors.get() + 1);
    }

    pub(crate) fn record_callback_panic(&self) {
        self.callback_panics.set(self.callback_panics.get() + 1);
    }

    pub(crate) fn unobserved_errors(&self) -> u64 {
        self.unobserved_errors.get()
    }

    pub(crate) fn callback_panics(&self) -> u64 {
        self.callback_panics.get()
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Total tasks spawned
    pub tasks_spawned: u64,

    /// Tasks that finished with a value
    pub tasks_completed: u64,

    /// Tasks that finished with an error (panics included)
    pub tasks_failed: u64,

    /// Tasks that finished through cancellation
    pub tasks_cancelled: u64,

    /// Live tasks
    pub active_tasks: usize,

    /// Tasks waiting in the ready queue
    pub ready_tasks: usize,

    /// Armed timers
    pub sleeping: usize,

    /// Worker jobs whose result has not been handed back yet
    pub outstanding_jobs: usize,

    /// Errors dropped without anyone reading them
    pub unobserved_errors: u64,

    /// Completion callbacks that panicked
    pub callback_panics: u64,
}

/// Snapshot of one live task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Task id
    pub id: TaskId,
    /// Name given at spawn time
    pub name: Option<String>,
    /// Lifecycle state
    pub state: TaskState,
}

// ============================================================================
// Core
// ============================================================================

enum Clock {
    System,
    Virtual(Cell<Instant>),
}

impl Clock {
    fn new(mode: ClockMode) -> Self {
        match mode {
            ClockMode::System => Clock::System,
            ClockMode::Virtual => Clock::Virtual(Cell::new(Instant::now())),
        }
    }

    fn now(&self) -> Instant {
        match self {
            Clock::System => Instant::now(),
            Clock::Virtual(now) => now.get(),
        }
    }
}

struct TaskSlot {
    header: Rc<TaskHeader>,
    /// Taken out while the task is being polled
    future: Option<LocalBoxFuture>,
    completion: Box<dyn ErasedCompletion>,
    queued: bool,
}

#[derive(Default)]
struct Counters {
    spawned: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

struct CoreState {
    tasks: FxHashMap<TaskId, TaskSlot>,
    ready: VecDeque<TaskId>,
    timers: TimerQueue,
    /// Resolvers for worker jobs still in flight
    external: FxHashMap<JobId, Resolver>,
    next_job: u64,
    pool: Option<WorkerPool>,
    counters: Counters,
}

impl CoreState {
    /// Queue a task unless it is already queued.
    fn enqueue(&mut self, id: TaskId) {
        let Some(slot) = self.tasks.get_mut(&id) else {
            return;
        };
        if slot.queued {
            return;
        }
        slot.queued = true;
        if slot.header.state() != TaskState::Created {
            slot.header.set_state(TaskState::Resumed);
        }
        self.ready.push_back(id);
    }
}

pub(crate) struct Core {
    state: RefCell<CoreState>,
    clock: Clock,
    diagnostics: Rc<Diagnostics>,
    config: SchedulerConfig,
    wake_tx: Sender<TaskId>,
    wake_rx: Receiver<TaskId>,
    external_tx: Sender<ExternalCompletion>,
    external_rx: Receiver<ExternalCompletion>,
    running: Cell<bool>,
}

impl Core {
    fn new(config: SchedulerConfig) -> Self {
        let (wake_tx, wake_rx) = channel::unbounded();
        let (external_tx, external_rx) = channel::unbounded();
        Self {
            state: RefCell::new(CoreState {
                tasks: FxHashMap::default(),
                ready: VecDeque::new(),
                timers: TimerQueue::new(),
                external: FxHashMap::default(),
                next_job: 0,
                pool: None,
                counters: Counters::default(),
            }),
            clock: Clock::new(config.clock),
            diagnostics: Rc::new(Diagnostics::default()),
            config,
            wake_tx,
            wake_rx,
            external_tx,
            external_rx,
            running: Cell::new(false),
        }
    }

    pub(crate) fn diagnostics(&self) -> Rc<Diagnostics> {
        Rc::clone(&self.diagnostics)
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    pub(crate) fn spawn<F, T>(self: &Rc<Self>, name: Option<String>, future: F) -> Task<T>
    where
        F: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        let id = TaskId::new();
        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            tx: self.wake_tx.clone(),
        }));
        let header = Rc::new(TaskHeader::new(id, name, waker));
        let completion = Completion::with_diagnostics(Some(self.diagnostics()));

        // Cancelling the cell directly also cancels the computation behind it.
        let linked = Rc::downgrade(&header);
        completion.add_done_callback(move |cell: &Completion<T>| {
            if cell.is_cancelled() {
                if let Some(header) = linked.upgrade() {
                    header.request_cancel();
                }
            }
        });

        let output = completion.clone();
        let driven: LocalBoxFuture = Box::pin(async move {
            let outcome = future.await;
            if output.resolve(outcome).is_err() {
                tracing::trace!(task = %id, "outcome discarded: completion already resolved");
            }
        });

        {
            let mut state = self.state.borrow_mut();
            state.tasks.insert(
                id,
                TaskSlot {
                    header: Rc::clone(&header),
                    future: Some(driven),
                    completion: Box::new(completion.clone()),
                    queued: false,
                },
            );
            state.counters.spawned += 1;
            state.enqueue(id);
        }
        tracing::trace!(task = %id, name = header.name(), "spawned");

        Task::new(header, completion)
    }

    pub(crate) fn insert_timer(&self, deadline: Instant, completion: Completion<()>) -> TimerKey {
        self.state.borrow_mut().timers.insert(deadline, completion)
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) {
        // A sleep dropped while the state is borrowed leaves its entry to
        // expire; the completion is already cancelled by then.
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.timers.remove(key);
        }
    }

    pub(crate) fn register_job(&self, resolver: Resolver) -> (JobId, Sender<ExternalCompletion>) {
        let mut state = self.state.borrow_mut();
        let id = JobId(state.next_job);
        state.next_job += 1;
        state.external.insert(id, resolver);
        (id, self.external_tx.clone())
    }

    pub(crate) fn forget_job(&self, id: JobId) -> Option<Resolver> {
        self.state.borrow_mut().external.remove(&id)
    }

    pub(crate) fn default_pool(&self) -> Result<WorkerPool> {
        if let Some(pool) = &self.state.borrow().pool {
            return Ok(pool.clone());
        }
        let pool = WorkerPool::from_config(&self.config)?;
        self.state.borrow_mut().pool = Some(pool.clone());
        Ok(pool)
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        let state = self.state.borrow();
        SchedulerStats {
            tasks_spawned: state.counters.spawned,
            tasks_completed: state.counters.completed,
            tasks_failed: state.counters.failed,
            tasks_cancelled: state.counters.cancelled,
            active_tasks: state.tasks.len(),
            ready_tasks: state.ready.len(),
            sleeping: state.timers.len(),
            outstanding_jobs: state.external.len(),
            unobserved_errors: self.diagnostics.unobserved_errors(),
            callback_panics: self.diagnostics.callback_panics(),
        }
    }

    pub(crate) fn all_tasks(&self) -> Vec<TaskInfo> {
        let state = self.state.borrow();
        let mut tasks: Vec<TaskInfo> = state
            .tasks
            .values()
            .map(|slot| TaskInfo {
                id: slot.header.id(),
                name: slot.header.name().map(str::to_string),
                state: slot.header.state(),
            })
            .collect();
        tasks.sort_by_key(|info| info.id);
        tasks
    }

    fn is_idle(&self) -> bool {
        let state = self.state.borrow();
        state.tasks.is_empty() && state.timers.is_empty() && state.external.is_empty()
    }

    // ========================================================================
    // Loop
    // ========================================================================

    fn drive(&self, finished: &dyn Fn() -> bool) -> Result<()> {
        loop {
            if finished() {
                return Ok(());
            }

            self.drain_external();
            self.fire_timers();
            self.drain_wakes();

            if self.run_once() {
                continue;
            }
            if finished() {
                return Ok(());
            }
            if !self.park() {
                let pending = self.state.borrow().tasks.len();
                tracing::warn!(pending, "scheduler stalled: nothing can make progress");
                return Err(Error::Stalled { pending });
            }
        }
    }

    fn drain_external(&self) {
        while let Ok(done) = self.external_rx.try_recv() {
            self.resolve_external(done);
        }
    }

    fn resolve_external(&self, done: ExternalCompletion) {
        let resolver = self.forget_job(done.id);
        match resolver {
            Some(resolve) => resolve(done.outcome),
            None => tracing::trace!(job = done.id.0, "result for unknown job dropped"),
        }
    }

    fn fire_timers(&self) {
        let now = self.clock.now();
        let expired = self.state.borrow_mut().timers.pop_expired(now);
        for timer in expired {
            if timer.set_result(()).is_ok() {
                tracing::trace!("timer fired");
            }
        }
    }

    fn drain_wakes(&self) {
        while let Ok(id) = self.wake_rx.try_recv() {
            self.state.borrow_mut().enqueue(id);
        }
    }

    /// Poll the task at the head of the ready queue. Returns `false` when
    /// the queue was empty.
    fn run_once(&self) -> bool {
        let (id, header, mut future) = {
            let mut state = self.state.borrow_mut();
            let Some(id) = state.ready.pop_front() else {
                return false;
            };
            let Some(slot) = state.tasks.get_mut(&id) else {
                return true;
            };
            slot.queued = false;
            let Some(future) = slot.future.take() else {
                return true;
            };
            (id, Rc::clone(&slot.header), future)
        };

        if header.take_cancel_request() {
            if header.state() == TaskState::Created {
                drop(future);
                tracing::debug!(task = %id, "cancelled before first poll");
                self.retire(id, None);
                return true;
            }
            tracing::trace!(task = %id, "delivering cancellation");
            header.deliver_cancel();
        }

        header.set_state(TaskState::Running);
        let polled = {
            let _task = context::enter_task(Rc::clone(&header));
            let mut cx = Context::from_waker(header.waker());
            panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        };

        match polled {
            Ok(Poll::Pending) => {
                header.set_state(TaskState::Suspended);
                if let Some(slot) = self.state.borrow_mut().tasks.get_mut(&id) {
                    slot.future = Some(future);
                }
            }
            Ok(Poll::Ready(())) => {
                drop(future);
                self.retire(id, None);
            }
            Err(payload) => {
                drop(future);
                let error = Error::from_panic(payload);
                tracing::error!(task = %id, %error, "task panicked");
                self.retire(id, Some(error));
            }
        }
        true
    }

    fn retire(&self, id: TaskId, failure: Option<Error>) {
        let removed = self.state.borrow_mut().tasks.remove(&id);
        let Some(slot) = removed else {
            return;
        };

        if let Some(error) = failure {
            slot.completion.fail(error);
        }
        if !slot.completion.is_done() {
            slot.completion.cancel();
        }
        let state = TaskState::from_completion(slot.completion.state()).unwrap_or(TaskState::Cancelled);
        slot.header.set_state(state);

        {
            let mut core = self.state.borrow_mut();
            match state {
                TaskState::Completed => core.counters.completed += 1,
                TaskState::Failed => core.counters.failed += 1,
                _ => core.counters.cancelled += 1,
            }
        }
        tracing::debug!(task = %id, ?state, "task finished");
    }

    /// Wait for something that can make progress. Returns `false` when
    /// nothing ever will.
    fn park(&self) -> bool {
        if !self.wake_rx.is_empty() || !self.external_rx.is_empty() {
            return true;
        }

        let (deadline, outstanding) = {
            let state = self.state.borrow();
            (state.timers.next_deadline(), state.external.len())
        };
        if deadline.is_none() && outstanding == 0 {
            return false;
        }

        let timeout = match (&self.clock, deadline) {
            (Clock::Virtual(now), Some(deadline)) if outstanding == 0 => {
                if deadline > now.get() {
                    now.set(deadline);
                }
                return true;
            }
            (Clock::System, Some(deadline)) => Some(deadline.saturating_duration_since(Instant::now())),
            _ => None,
        };

        match timeout {
            Some(timeout) => channel::select! {
                recv(self.wake_rx) -> msg => {
                    if let Ok(id) = msg {
                        self.state.borrow_mut().enqueue(id);
                    }
                },
                recv(self.external_rx) -> msg => {
                    if let Ok(done) = msg {
                        self.resolve_external(done);
                    }
                },
                default(timeout) => {},
            },
            None => channel::select! {
                recv(self.wake_rx) -> msg => {
                    if let Ok(id) = msg {
                        self.state.borrow_mut().enqueue(id);
                    }
                },
                recv(self.external_rx) -> msg => {
                    if let Ok(done) = msg {
                        self.resolve_external(done);
                    }
                },
            },
        }
        true
    }

    fn begin_run(&self) -> RunGuard<'_> {
        if self.running.replace(true) {
            panic!("scheduler is already running");
        }
        RunGuard(&self.running)
    }
}

struct RunGuard<'a>(&'a Cell<bool>);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Single-thread cooperative scheduler.
///
/// Tasks are spawned onto it and driven by `run_until_complete`,
/// `block_on` or `run_until_idle`. Inside a running task the free functions
/// ([`spawn`](crate::spawn), [`sleep`](crate::sleep), [`submit`](crate::submit)
/// and friends) reach the same scheduler.
pub struct Scheduler {
    core: Rc<Core>,
}

impl Scheduler {
    /// Create a scheduler with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler with a custom configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        tracing::debug!(clock = ?config.clock, worker_threads = config.worker_threads, "scheduler created");
        Self {
            core: Rc::new(Core::new(config)),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    /// Spawn a computation.
    pub fn spawn<F, T>(&self, future: F) -> Task<T>
    where
        F: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        self.core.spawn(None, future)
    }

    /// Spawn a named computation.
    pub fn spawn_named<F, T>(&self, name: impl Into<String>, future: F) -> Task<T>
    where
        F: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        self.core.spawn(Some(name.into()), future)
    }

    /// Drive tasks until `task` finishes, then return its outcome.
    ///
    /// Fails with `Stalled` if the task can never finish.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler is already running.
    pub fn run_until_complete<T: Clone + 'static>(&self, task: &Task<T>) -> Result<T> {
        let _running = self.core.begin_run();
        let _entered = context::enter(Rc::clone(&self.core));
        self.core.drive(&|| task.done())?;
        task.result()
    }

    /// Spawn `future` and drive it to completion.
    pub fn block_on<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + 'static,
        T: Clone + 'static,
    {
        let task = self.spawn_named("main", future);
        self.run_until_complete(&task)
    }

    /// Drive until no task, timer or worker job remains.
    pub fn run_until_idle(&self) -> Result<()> {
        let _running = self.core.begin_run();
        let _entered = context::enter(Rc::clone(&self.core));
        self.core.drive(&|| self.core.is_idle())
    }

    /// Run blocking work on the default worker pool.
    pub fn submit<F, T>(&self, work: F) -> Completion<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        crate::bridge::submit_on(&self.core, work)
    }

    /// Current time on the scheduler's clock.
    pub fn now(&self) -> Instant {
        self.core.now()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> SchedulerStats {
        self.core.stats()
    }

    /// Live tasks ordered by id.
    pub fn all_tasks(&self) -> Vec<TaskInfo> {
        self.core.all_tasks()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let (slots, resolvers, pool) = {
            let mut state = self.core.state.borrow_mut();
            state.ready.clear();
            (
                std::mem::take(&mut state.tasks),
                std::mem::take(&mut state.external),
                state.pool.take(),
            )
        };
        if !slots.is_empty() {
            tracing::debug!(unfinished = slots.len(), "dropping unfinished tasks");
        }
        for (_, mut slot) in slots {
            drop(slot.future.take());
            slot.completion.cancel();
        }
        drop(resolvers);
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }
}
