//! Worker bridge
//!
//! Blocking or CPU-bound closures run on a [`WorkerPool`]. Each job posts its
//! outcome on the scheduler's handoff channel; the scheduler thread alone
//! resolves the matching [`Completion`](crate::Completion).

mod pool;
mod shared;

pub(crate) use pool::{submit_on, ExternalCompletion, JobId, Resolver};
pub use pool::WorkerPool;
pub use shared::{Shared, SharedReentrant};

use crate::completion::Completion;
use crate::error::Result;
use crate::scheduler::context;

/// Run `work` on the current scheduler's default worker pool.
///
/// The pool starts on first use with `SchedulerConfig::worker_threads`
/// threads.
///
/// # Panics
///
/// Panics when called outside a running scheduler.
pub fn submit<F, T>(work: F) -> Completion<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    submit_on(&context::expect_current("submit"), work)
}
