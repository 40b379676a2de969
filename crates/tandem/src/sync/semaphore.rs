//! Task-aware Semaphore and BoundedSemaphore

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use super::acquire::{Acquire, Grantor};
use super::id::SemaphoreId;
use crate::completion::Completion;
use crate::error::{Error, Result};

struct SemaphoreInner {
    id: SemaphoreId,
    /// Permits available right now
    permits: Cell<usize>,
    /// Upper bound for bounded semaphores
    max_permits: Option<usize>,
    /// FIFO wait queue
    waiters: RefCell<VecDeque<Completion<()>>>,
}

impl SemaphoreInner {
    fn new(permits: usize, max_permits: Option<usize>) -> Rc<Self> {
        Rc::new(Self {
            id: SemaphoreId::new(),
            permits: Cell::new(permits),
            max_permits,
            waiters: RefCell::new(VecDeque::new()),
        })
    }

    fn has_waiters(&self) -> bool {
        self.waiters.borrow().iter().any(|waiter| !waiter.is_done())
    }

    fn waiting(&self) -> usize {
        self.waiters
            .borrow()
            .iter()
            .filter(|waiter| !waiter.is_done())
            .count()
    }

    fn acquire(self: &Rc<Self>) -> Acquire {
        if self.try_acquire() {
            return Acquire::granted(self.clone());
        }
        let waiter = Completion::new();
        self.waiters.borrow_mut().push_back(waiter.clone());
        Acquire::queued(self.clone(), waiter)
    }

    fn try_acquire(&self) -> bool {
        let permits = self.permits.get();
        if permits == 0 || self.has_waiters() {
            return false;
        }
        self.permits.set(permits - 1);
        true
    }

    fn release(&self) -> Result<()> {
        let permits = self.permits.get();
        if let Some(max) = self.max_permits {
            if permits >= max {
                tracing::warn!(semaphore = %self.id, max, "release would exceed max permits");
                return Err(Error::OverReleased);
            }
        }
        self.permits.set(permits + 1);
        self.dispatch();
        Ok(())
    }

    /// Reserve available permits for queued waiters, head first.
    fn dispatch(&self) {
        while self.permits.get() > 0 {
            let next = self.waiters.borrow_mut().pop_front();
            let Some(waiter) = next else {
                break;
            };
            self.permits.set(self.permits.get() - 1);
            if waiter.set_result(()).is_err() {
                // Cancelled while queued: the permit stays available.
                self.permits.set(self.permits.get() + 1);
            }
        }
    }
}

impl Grantor for SemaphoreInner {
    fn regrant(&self) {
        self.permits.set(self.permits.get() + 1);
        self.dispatch();
    }

    fn withdraw(&self, waiter: &Completion<()>) {
        self.waiters.borrow_mut().retain(|queued| !queued.ptr_eq(waiter));
    }
}

/// Permit-counting gate for tasks.
///
/// `acquire` takes a permit or queues behind earlier acquirers; `release`
/// returns one and reserves it for the head of the queue. Cloning yields
/// another handle to the same semaphore.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<SemaphoreInner>,
}

impl Semaphore {
    /// Create a semaphore with `permits` permits.
    pub fn new(permits: usize) -> Self {
        Self {
            inner: SemaphoreInner::new(permits, None),
        }
    }

    /// Semaphore id.
    pub fn id(&self) -> SemaphoreId {
        self.inner.id
    }

    /// Permits available right now.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.get()
    }

    /// Whether an acquire would have to wait.
    pub fn locked(&self) -> bool {
        self.inner.permits.get() == 0 || self.inner.has_waiters()
    }

    /// Number of tasks queued for a permit.
    pub fn waiting(&self) -> usize {
        self.inner.waiting()
    }

    /// Take a permit, waiting behind earlier acquirers.
    pub fn acquire(&self) -> Acquire {
        self.inner.acquire()
    }

    /// Take a permit only if that needs no waiting.
    pub fn try_acquire(&self) -> bool {
        self.inner.try_acquire()
    }

    /// Return a permit.
    pub fn release(&self) -> Result<()> {
        self.inner.release()
    }

    /// Take a permit and get a guard that returns it on drop.
    pub async fn permit(&self) -> Result<SemaphorePermit> {
        self.inner.acquire().await?;
        Ok(SemaphorePermit::new(self.inner.clone()))
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("id", &self.inner.id)
            .field("permits", &self.available_permits())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// Semaphore that refuses to grow past its initial permit count.
///
/// Releasing more often than acquiring fails with `OverReleased` instead of
/// silently inflating the count.
#[derive(Clone)]
pub struct BoundedSemaphore {
    inner: Rc<SemaphoreInner>,
}

impl BoundedSemaphore {
    /// Create a bounded semaphore with `max_permits` permits.
    pub fn new(max_permits: usize) -> Self {
        Self {
            inner: SemaphoreInner::new(max_permits, Some(max_permits)),
        }
    }

    /// Semaphore id.
    pub fn id(&self) -> SemaphoreId {
        self.inner.id
    }

    /// The bound.
    pub fn max_permits(&self) -> usize {
        self.inner.max_permits.unwrap_or_default()
    }

    /// Permits available right now.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.get()
    }

    /// Whether an acquire would have to wait.
    pub fn locked(&self) -> bool {
        self.inner.permits.get() == 0 || self.inner.has_waiters()
    }

    /// Number of tasks queued for a permit.
    pub fn waiting(&self) -> usize {
        self.inner.waiting()
    }

    /// Take a permit, waiting behind earlier acquirers.
    pub fn acquire(&self) -> Acquire {
        self.inner.acquire()
    }

    /// Take a permit only if that needs no waiting.
    pub fn try_acquire(&self) -> bool {
        self.inner.try_acquire()
    }

    /// Return a permit. Fails with `OverReleased` if every permit is
    /// already available.
    pub fn release(&self) -> Result<()> {
        self.inner.release()
    }

    /// Take a permit and get a guard that returns it on drop.
    pub async fn permit(&self) -> Result<SemaphorePermit> {
        self.inner.acquire().await?;
        Ok(SemaphorePermit::new(self.inner.clone()))
    }
}

impl fmt::Debug for BoundedSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedSemaphore")
            .field("id", &self.inner.id)
            .field("permits", &self.available_permits())
            .field("max_permits", &self.max_permits())
            .finish()
    }
}

/// A permit that is returned to its semaphore on drop.
#[must_use = "the permit is returned as soon as it is dropped"]
pub struct SemaphorePermit {
    semaphore: Rc<SemaphoreInner>,
    active: bool,
}

impl SemaphorePermit {
    fn new(semaphore: Rc<SemaphoreInner>) -> Self {
        Self {
            semaphore,
            active: true,
        }
    }

    /// Keep the permit taken: it is not returned on drop.
    pub fn forget(mut self) {
        self.active = false;
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(error) = self.semaphore.release() {
            tracing::warn!(semaphore = %self.semaphore.id, %error, "permit release failed");
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
    fn test_semaphore_limits_concurrency() {
        let sched = scheduler();
        let semaphore = Semaphore::new(2);
        let active = Rc::new(Cell::new(0));
        let peak = Rc::new(Cell::new(0));

        for _ in 0..6 {
            let semaphore = semaphore.clone();
            let active = Rc::clone(&active);
            let peak = Rc::clone(&peak);
            sched.spawn(async move {
                let _permit = semaphore.permit().await?;
                active.set(active.get() + 1);
                peak.set(peak.get().max(active.get()));
                sleep(Duration::from_secs(1)).await?;
                active.set(active.get() - 1);
                Ok(())
            });
        }

        let start = sched.now();
        sched.run_until_idle().unwrap();
        assert_eq!(peak.get(), 2);
        assert_eq!(sched.now() - start, Duration::from_secs(3));
        assert_eq!(semaphore.available_permits(), 2);
    }

    #[test]
    fn test_semaphore_fifo_order() {
        let sched = scheduler();
        let semaphore = Semaphore::new(0);
        let order = Rc::new(RefCell::new(Vec::new()));

        for n in 0..3 {
            let semaphore = semaphore.clone();
            let order = Rc::clone(&order);
            sched.spawn(async move {
                semaphore.acquire().await?;
                order.borrow_mut().push(n);
                Ok(())
            });
        }

        let releaser = semaphore.clone();
        sched
            .block_on(async move {
                sleep(Duration::from_millis(1)).await?;
                assert_eq!(releaser.waiting(), 3);
                for _ in 0..3 {
                    releaser.release()?;
                }
                // Every permit went straight to a waiter.
                assert_eq!(releaser.available_permits(), 0);
                Ok(())
            })
            .unwrap();
        sched.run_until_idle().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_plain_semaphore_release_grows_count() {
        let semaphore = Semaphore::new(1);
        semaphore.release().unwrap();
        assert_eq!(semaphore.available_permits(), 2);
    }

    #[test]
    fn test_bounded_semaphore_over_release() {
        let bounded = BoundedSemaphore::new(1);
        assert!(bounded.try_acquire());
        assert!(bounded.locked());
        bounded.release().unwrap();
        assert!(matches!(bounded.release(), Err(Error::OverReleased)));
        assert_eq!(bounded.available_permits(), 1);
        assert_eq!(bounded.max_permits(), 1);
    }

    #[test]
    fn test_forgotten_permit_stays_taken() {
        let sched = scheduler();
        let semaphore = BoundedSemaphore::new(2);
        let inner = semaphore.clone();
        sched
            .block_on(async move {
                inner.permit().await?.forget();
                Ok(())
            })
            .unwrap();
        assert_eq!(semaphore.available_permits(), 1);
    }
}
