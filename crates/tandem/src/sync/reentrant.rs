//! Reentrant lock owned by a task

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use super::acquire::{Acquire, Grantor};
use super::id::LockId;
use crate::completion::Completion;
use crate::error::{Error, Result};
use crate::scheduler::{context, TaskId};

/// Identity of a lock owner: the task being polled, or code running
/// outside any task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Task(TaskId),
    Outside,
}

impl Holder {
    fn current() -> Self {
        context::current_task_id().map_or(Holder::Outside, Holder::Task)
    }
}

/// Lock that its owning task may acquire again without waiting.
///
/// Each acquisition by the owner increments a depth counter; the lock passes
/// to the next waiter (FIFO) only when the depth returns to zero.
#[derive(Clone)]
pub struct ReentrantLock {
    inner: Rc<ReentrantInner>,
}

struct ReentrantInner {
    id: LockId,
    owner: Cell<Option<Holder>>,
    depth: Cell<usize>,
    waiters: RefCell<VecDeque<(Holder, Completion<()>)>>,
}

impl ReentrantInner {
    fn has_waiters(&self) -> bool {
        self.waiters.borrow().iter().any(|(_, waiter)| !waiter.is_done())
    }

    /// Drop one level of ownership, passing the lock on at depth zero.
    fn unwind_level(&self) {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth > 0 {
            return;
        }
        loop {
            let next = self.waiters.borrow_mut().pop_front();
            match next {
                Some((holder, waiter)) => {
                    self.owner.set(Some(holder));
                    self.depth.set(1);
                    if waiter.set_result(()).is_ok() {
                        tracing::trace!(lock = %self.id, ?holder, "reentrant lock handed to next waiter");
                        return;
                    }
                }
                None => {
                    self.owner.set(None);
                    self.depth.set(0);
                    return;
                }
            }
        }
    }
}

impl Grantor for ReentrantInner {
    fn regrant(&self) {
        self.unwind_level();
    }

    fn withdraw(&self, waiter: &Completion<()>) {
        self.waiters
            .borrow_mut()
            .retain(|(_, queued)| !queued.ptr_eq(waiter));
    }
}

impl ReentrantLock {
    /// Create an unlocked reentrant lock.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ReentrantInner {
                id: LockId::new(),
                owner: Cell::new(None),
                depth: Cell::new(0),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Lock id.
    pub fn id(&self) -> LockId {
        self.inner.id
    }

    /// Whether any owner holds the lock.
    pub fn locked(&self) -> bool {
        self.inner.owner.get().is_some()
    }

    /// Whether the current task owns the lock.
    pub fn is_owned_by_current(&self) -> bool {
        self.inner.owner.get() == Some(Holder::current())
    }

    /// Current acquisition depth.
    pub fn depth(&self) -> usize {
        self.inner.depth.get()
    }

    /// Acquire the lock. The owner gets it again immediately; other tasks
    /// queue in arrival order.
    pub fn acquire(&self) -> Acquire {
        let me = Holder::current();
        let inner = &self.inner;
        match inner.owner.get() {
            Some(owner) if owner == me => {
                inner.depth.set(inner.depth.get() + 1);
                Acquire::granted(self.inner.clone())
            }
            None if !inner.has_waiters() => {
                inner.owner.set(Some(me));
                inner.depth.set(1);
                Acquire::granted(self.inner.clone())
            }
            _ => {
                let waiter = Completion::new();
                inner.waiters.borrow_mut().push_back((me, waiter.clone()));
                Acquire::queued(self.inner.clone(), waiter)
            }
        }
    }

    /// Release one level.
    ///
    /// Fails with `NotLocked` if nobody holds the lock and `NotOwner` if
    /// another task does.
    pub fn release(&self) -> Result<()> {
        match self.inner.owner.get() {
            None => Err(Error::NotLocked),
            Some(owner) if owner != Holder::current() => Err(Error::NotOwner),
            Some(_) => {
                self.inner.unwind_level();
                Ok(())
            }
        }
    }

    /// Acquire and get a guard that releases one level on drop.
    pub async fn lock(&self) -> Result<ReentrantGuard> {
        self.acquire().await?;
        Ok(ReentrantGuard {
            lock: self.clone(),
            holder: Holder::current(),
        })
    }
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner.get())
            .field("depth", &self.depth())
            .finish()
    }
}

/// Holds one level of a [`ReentrantLock`] until dropped.
#[must_use = "the level is released as soon as the guard is dropped"]
pub struct ReentrantGuard {
    lock: ReentrantLock,
    holder: Holder,
}

impl Drop for ReentrantGuard {
    fn drop(&mut self) {
        // May run outside the owner's poll, e.g. when the scheduler drops
        // an unfinished task, so ownership is checked against the recorded
        // holder rather than the current task.
        if self.lock.inner.owner.get() == Some(self.holder) {
            self.lock.inner.unwind_level();
        } else {
            tracing::warn!(lock = %self.lock.id(), holder = ?self.holder, "guard dropped after its owner gave the lock up");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::{sleep, Scheduler};
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        Scheduler::with_config(SchedulerConfig::virtual_time())
    }

    #[test]
    fn test_owner_reenters_and_unwinds() {
        let sched = scheduler();
        let lock = ReentrantLock::new();
        let inner = lock.clone();
        sched
            .block_on(async move {
                let outer = inner.lock().await?;
                let nested = inner.lock().await?;
                assert_eq!(inner.depth(), 2);
                assert!(inner.is_owned_by_current());
                drop(nested);
                assert!(inner.locked());
                drop(outer);
                assert!(!inner.locked());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_release_by_non_owner_rejected() {
        let sched = scheduler();
        let lock = ReentrantLock::new();
        assert!(matches!(lock.release(), Err(Error::NotLocked)));

        let owner = lock.clone();
        let holder = sched.spawn(async move {
            owner.acquire().await?;
            sleep(Duration::from_secs(5)).await?;
            owner.release()
        });

        let intruder = lock.clone();
        let attempt = sched.spawn(async move {
            sleep(Duration::from_secs(1)).await?;
            Ok(intruder.release().map_err(|e| matches!(e, Error::NotOwner)))
        });

        assert_eq!(sched.run_until_complete(&attempt).unwrap(), Err(true));
        sched.run_until_complete(&holder).unwrap();
        assert!(!lock.locked());
    }

    #[test]
    fn test_passes_to_waiters_only_at_depth_zero() {
        let sched = scheduler();
        let lock = ReentrantLock::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let first = lock.clone();
        let first_log = Rc::clone(&log);
        sched.spawn(async move {
            first.acquire().await?;
            first.acquire().await?;
            sleep(Duration::from_secs(1)).await?;
            first.release()?;
            first_log.borrow_mut().push("first released once");
            sleep(Duration::from_secs(1)).await?;
            first.release()?;
            first_log.borrow_mut().push("first released twice");
            Ok(())
        });

        let second = lock.clone();
        let second_log = Rc::clone(&log);
        sched.spawn(async move {
            second.acquire().await?;
            second_log.borrow_mut().push("second acquired");
            second.release()
        });

        sched.run_until_idle().unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["first released once", "first released twice", "second acquired"]
        );
        assert!(!lock.locked());
    }

    #[test]
    fn test_stale_guard_leaves_new_owner_alone() {
        let sched = scheduler();
        let lock = ReentrantLock::new();

        let first = lock.clone();
        sched.spawn(async move {
            let guard = first.lock().await?;
            first.release()?;
            sleep(Duration::from_secs(2)).await?;
            drop(guard);
            Ok(())
        });
        let second = lock.clone();
        let owner = sched.spawn(async move {
            sleep(Duration::from_secs(1)).await?;
            second.acquire().await?;
            sleep(Duration::from_secs(5)).await?;
            second.release()
        });

        let observed = lock.clone();
        let (locked, depth) = sched
            .block_on(async move {
                sleep(Duration::from_secs(3)).await?;
                Ok((observed.locked(), observed.depth()))
            })
            .unwrap();
        assert!(locked);
        assert_eq!(depth, 1);
        sched.run_until_complete(&owner).unwrap();
        assert!(!lock.locked());
    }
}
