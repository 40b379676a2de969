//! Explicit shared-state handles for worker jobs
//!
//! Worker jobs run in parallel, so state they share must be owned by the
//! caller and passed in through one of these handles rather than living in
//! a global.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

/// Mutex-protected value shared between worker jobs.
pub struct Shared<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default> Default for Shared<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared").field(&*self.inner.lock()).finish()
    }
}

impl<T> Shared<T> {
    /// Wrap a value.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Run `f` with exclusive access to the value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Like [`with`](Self::with) but gives up instead of blocking.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner.try_lock().map(|mut guard| f(&mut guard))
    }
}

impl<T: Clone> Shared<T> {
    /// Copy of the current value.
    pub fn get(&self) -> T {
        self.inner.lock().clone()
    }
}

/// Value behind a reentrant mutex: a thread already inside
/// [`with`](Self::with) may call it again without deadlocking.
pub struct SharedReentrant<T> {
    inner: Arc<ReentrantMutex<RefCell<T>>>,
}

impl<T> Clone for SharedReentrant<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default> Default for SharedReentrant<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SharedReentrant<T> {
    /// Wrap a value.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(ReentrantMutex::new(RefCell::new(value))),
        }
    }

    /// Run `f` while holding the lock. Borrow the cell only for as long as
    /// needed; nested calls borrow it again.
    pub fn with<R>(&self, f: impl FnOnce(&RefCell<T>) -> R) -> R {
        let guard = self.inner.lock();
        f(&guard)
    }
}

impl<T: Clone> SharedReentrant<T> {
    /// Copy of the current value.
    pub fn get(&self) -> T {
        self.with(|cell| cell.borrow().clone())
    }
}
