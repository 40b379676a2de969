//! Tandem cooperative task runtime
//!
//! This crate provides:
//! - Completion cells (single-assignment result holders with callbacks)
//! - A single-thread scheduler with a FIFO ready queue and deadline timers
//! - Tasks with cooperative cancellation
//! - Locks, a reentrant lock, semaphores and bounded semaphores
//! - Combinators: gather, wait, as_completed, wait_for, shield
//! - A worker bridge that runs blocking work on a thread pool

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod combinators;
pub mod completion;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod sync;

pub use bridge::{submit, Shared, SharedReentrant, WorkerPool};
pub use combinators::{
    as_completed, gather, shield, wait, wait_for, AsCompleted, Gather, GatherSettled,
    NextCompleted, ReturnWhen, WaitSet,
};
pub use completion::{Awaitable, CallbackId, Completion, CompletionState, Wait};
pub use config::{ClockMode, SchedulerConfig};
pub use error::{Error, Result};
pub use scheduler::{
    current_task_id, now, sleep, sleep_until, spawn, spawn_named, yield_now, Scheduler,
    SchedulerStats, Sleep, Task, TaskId, TaskInfo, TaskState,
};
pub use sync::{BoundedSemaphore, Lock, ReentrantLock, Semaphore};
