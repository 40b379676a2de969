//! Task-aware FIFO lock

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use super::acquire::{Acquire, Grantor};
use super::id::LockId;
use crate::completion::Completion;
use crate::error::{Error, Result};

/// Mutual-exclusion lock for tasks.
///
/// Waiters are granted strictly in arrival order. `release` hands the lock
/// straight to the head waiter, so a lock with waiters is never observably
/// free in between. Cloning yields another handle to the same lock.
#[derive(Clone)]
pub struct Lock {
    inner: Rc<LockInner>,
}

struct LockInner {
    id: LockId,
    held: Cell<bool>,
    waiters: RefCell<VecDeque<Completion<()>>>,
}

impl LockInner {
    fn has_waiters(&self) -> bool {
        self.waiters.borrow().iter().any(|waiter| !waiter.is_done())
    }

    fn release(&self) -> Result<()> {
        if !self.held.get() {
            return Err(Error::NotLocked);
        }
        loop {
            let next = self.waiters.borrow_mut().pop_front();
            match next {
                // Cancelled waiters refuse the grant and are skipped.
                Some(waiter) => {
                    if waiter.set_result(()).is_ok() {
                        tracing::trace!(lock = %self.id, "lock handed to next waiter");
                        return Ok(());
                    }
                }
                None => {
                    self.held.set(false);
                    return Ok(());
                }
            }
        }
    }
}

impl Grantor for LockInner {
    fn regrant(&self) {
        if let Err(error) = self.release() {
            tracing::warn!(lock = %self.id, %error, "unclaimed grant could not be passed on");
        }
    }

    fn withdraw(&self, waiter: &Completion<()>) {
        self.waiters.borrow_mut().retain(|queued| !queued.ptr_eq(waiter));
    }
}

impl Lock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(LockInner {
                id: LockId::new(),
                held: Cell::new(false),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Lock id.
    pub fn id(&self) -> LockId {
        self.inner.id
    }

    /// Whether the lock is held.
    pub fn locked(&self) -> bool {
        self.inner.held.get()
    }

    /// Number of tasks queued for the lock.
    pub fn waiting(&self) -> usize {
        self.inner
            .waiters
            .borrow()
            .iter()
            .filter(|waiter| !waiter.is_done())
            .count()
    }

    /// Acquire the lock, waiting behind earlier acquirers.
    ///
    /// Once the returned future resolves with `Ok(())` the caller holds the
    /// lock and must call [`release`](Self::release).
    pub fn acquire(&self) -> Acquire {
        let inner = &self.inner;
        if !inner.held.get() && !inner.has_waiters() {
            inner.held.set(true);
            return Acquire::granted(self.inner.clone());
        }
        let waiter = Completion::new();
        inner.waiters.borrow_mut().push_back(waiter.clone());
        Acquire::queued(self.inner.clone(), waiter)
    }

    /// Take the lock only if that needs no waiting.
    pub fn try_acquire(&self) -> bool {
        if self.inner.held.get() || self.inner.has_waiters() {
            return false;
        }
        self.inner.held.set(true);
        true
    }

    /// Release the lock. Fails with `NotLocked` if it is not held.
    pub fn release(&self) -> Result<()> {
        self.inner.release()
    }

    /// Acquire the lock and get a guard that releases it on drop.
    pub async fn lock(&self) -> Result<LockGuard> {
        self.acquire().await?;
        Ok(LockGuard { lock: self.clone() })
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("id", &self.inner.id)
            .field("locked", &self.locked())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// Holds a [`Lock`] until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    lock: Lock,
}

impl LockGuard {
    /// The guarded lock.
    pub fn lock(&self) -> &Lock {
        &self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(error) = self.lock.release() {
            tracing::warn!(lock = %self.lock.id(), %error, "guard release failed");
        }
    }
}
