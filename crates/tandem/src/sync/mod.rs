//! Synchronization primitives for tasks
//!
//! All primitives queue waiters in arrival order and never let a newcomer
//! overtake a queued waiter. Acquisition is a suspension point, so a task
//! cancelled while waiting leaves the queue, and a grant that lands on a
//! cancelled acquirer is passed on.

mod acquire;
mod id;
mod lock;
mod reentrant;
mod semaphore;

pub use acquire::Acquire;
pub use id::{LockId, SemaphoreId};
pub use lock::{Lock, LockGuard};
pub use reentrant::{ReentrantGuard, ReentrantLock};
pub use semaphore::{BoundedSemaphore, Semaphore, SemaphorePermit};
