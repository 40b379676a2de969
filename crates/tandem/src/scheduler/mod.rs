//! Task scheduler: a single-thread cooperative executor
//!
//! One scheduler thread owns the ready queue, the timer map and every task.
//! Wakers and worker threads reach it only through crossbeam channels that
//! the loop drains on each iteration.

pub(crate) mod context;
#[allow(clippy::module_inception)]
mod scheduler;
mod task;
mod timer;

use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::Result;

pub(crate) use scheduler::{Core, Diagnostics};
pub use scheduler::{Scheduler, SchedulerStats, TaskInfo};
pub use task::{Task, TaskId, TaskState};
pub use timer::Sleep;

/// Spawn a computation on the current scheduler.
///
/// # Panics
///
/// Panics when called outside a running scheduler.
pub fn spawn<F, T>(future: F) -> Task<T>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    context::expect_current("spawn").spawn(None, future)
}

/// Spawn a named computation on the current scheduler.
///
/// # Panics
///
/// Panics when called outside a running scheduler.
pub fn spawn_named<F, T>(name: impl Into<String>, future: F) -> Task<T>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    context::expect_current("spawn_named").spawn(Some(name.into()), future)
}

/// Suspend the current task for `duration`.
///
/// # Panics
///
/// Panics when called outside a running scheduler.
pub fn sleep(duration: Duration) -> Sleep {
    let core = context::expect_current("sleep");
    let deadline = core.now() + duration;
    Sleep::new(&core, deadline)
}

/// Suspend the current task until `deadline`.
///
/// # Panics
///
/// Panics when called outside a running scheduler.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep::new(&context::expect_current("sleep_until"), deadline)
}

/// Give every other ready task a turn before continuing.
pub fn yield_now() -> Sleep {
    sleep(Duration::ZERO)
}

/// Current time on the scheduler's clock.
///
/// # Panics
///
/// Panics when called outside a running scheduler.
pub fn now() -> Instant {
    context::expect_current("now").now()
}

/// Id of the task being polled, if any.
pub fn current_task_id() -> Option<TaskId> {
    context::current_task_id()
}
