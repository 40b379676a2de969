//! Task handles, ids and lifecycle state

use std::cell::Cell;
use std::fmt;
use std::future::IntoFuture;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Wake, Waker};

use crossbeam::channel::Sender;

use crate::completion::{Awaitable, CallbackId, Completion, CompletionState, Wait};
use crate::error::{Error, Result};

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a TaskId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        TaskId(id)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned, never polled
    Created,
    /// Being polled right now
    Running,
    /// Waiting on a completion, a timer or a primitive
    Suspended,
    /// Woken and sitting in the ready queue
    Resumed,
    /// Finished with a value
    Completed,
    /// Finished with an error
    Failed,
    /// Finished through cancellation
    Cancelled,
}

impl TaskState {
    /// Whether the task has finished.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub(crate) fn from_completion(state: CompletionState) -> Option<Self> {
        match state {
            CompletionState::Pending => None,
            CompletionState::ResultSet => Some(TaskState::Completed),
            CompletionState::ExceptionSet => Some(TaskState::Failed),
            CompletionState::Cancelled => Some(TaskState::Cancelled),
        }
    }
}

/// Waker that pushes the task id onto the scheduler's wake channel.
pub(crate) struct TaskWaker {
    pub(crate) id: TaskId,
    pub(crate) tx: Sender<TaskId>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // The receiver lives as long as the scheduler; a send after it is
        // gone has no task left to wake.
        let _ = self.tx.send(self.id);
    }
}

/// Scheduler-side bookkeeping shared by every handle of a task.
pub(crate) struct TaskHeader {
    id: TaskId,
    name: Option<String>,
    state: Cell<TaskState>,
    /// Set by `Task::cancel`, consumed when the task is next resumed
    cancel_requested: Cell<bool>,
    /// One-shot signal for the next suspension point the task polls
    cancel_delivery: Cell<bool>,
    waker: Waker,
}

impl TaskHeader {
    pub(crate) fn new(id: TaskId, name: Option<String>, waker: Waker) -> Self {
        Self {
            id,
            name,
            state: Cell::new(TaskState::Created),
            cancel_requested: Cell::new(false),
            cancel_delivery: Cell::new(false),
            waker,
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }

    pub(crate) fn waker(&self) -> &Waker {
        &self.waker
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.set(true);
        self.waker.wake_by_ref();
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.get()
    }

    pub(crate) fn take_cancel_request(&self) -> bool {
        self.cancel_requested.replace(false)
    }

    pub(crate) fn deliver_cancel(&self) {
        self.cancel_delivery.set(true);
    }

    pub(crate) fn take_cancel_delivery(&self) -> bool {
        self.cancel_delivery.replace(false)
    }
}

/// Handle to a spawned computation.
///
/// Cloning yields another handle to the same task. Awaiting a task (or a
/// reference to one) yields its outcome.
pub struct Task<T> {
    header: Rc<TaskHeader>,
    completion: Completion<T>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            header: Rc::clone(&self.header),
            completion: self.completion.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.header.id)
            .field("name", &self.header.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: 'static> Task<T> {
    pub(crate) fn new(header: Rc<TaskHeader>, completion: Completion<T>) -> Self {
        Self { header, completion }
    }

    /// Task id.
    pub fn id(&self) -> TaskId {
        self.header.id
    }

    /// Name given at spawn time.
    pub fn name(&self) -> Option<&str> {
        self.header.name()
    }

    /// Lifecycle state.
    pub fn state(&self) -> TaskState {
        TaskState::from_completion(self.completion.state()).unwrap_or_else(|| self.header.state())
    }

    /// Whether the task has finished.
    pub fn done(&self) -> bool {
        self.completion.is_done()
    }

    /// Whether the task finished through cancellation.
    pub fn cancelled(&self) -> bool {
        self.completion.is_cancelled()
    }

    /// Whether a cancellation has been requested and not yet delivered.
    pub fn cancel_requested(&self) -> bool {
        self.header.cancel_requested()
    }

    /// Request cancellation.
    ///
    /// The request is delivered at the task's next suspension point. Returns
    /// `false` (and does nothing) if the task already finished.
    pub fn cancel(&self) -> bool {
        if self.completion.is_done() {
            return false;
        }
        tracing::debug!(task = %self.header.id, "cancellation requested");
        self.header.request_cancel();
        true
    }

    /// The error the task failed with, if any.
    pub fn error(&self) -> Result<Option<Error>> {
        self.completion.error()
    }

    /// Register an observer on the task's completion.
    pub fn add_done_callback<F>(&self, callback: F) -> CallbackId
    where
        F: FnOnce(&Completion<T>) + 'static,
    {
        self.completion.add_done_callback(callback)
    }

    /// Handle to the task's completion cell.
    pub fn completion(&self) -> Completion<T> {
        self.completion.clone()
    }
}

impl<T: Clone + 'static> Task<T> {
    /// The task's outcome; `NotReady` while it runs.
    pub fn result(&self) -> Result<T> {
        self.completion.result()
    }
}

impl<T: Clone + 'static> IntoFuture for Task<T> {
    type Output = Result<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Wait<T> {
        Wait::new(self.completion)
    }
}

impl<T: Clone + 'static> IntoFuture for &Task<T> {
    type Output = Result<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Wait<T> {
        Wait::new(self.completion.clone())
    }
}

impl<T: Clone + 'static> Awaitable for Task<T> {
    type Output = T;

    fn completion(&self) -> Completion<T> {
        self.completion.clone()
    }

    fn cancel(&self) -> bool {
        Task::cancel(self)
    }
}
