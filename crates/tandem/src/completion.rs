//! Completion cells
//!
//! A [`Completion`] is a single-assignment holder for a value, an error or a
//! cancellation. Observers registered with [`Completion::add_done_callback`]
//! fire exactly once, in registration order, inside the call that moves the
//! cell out of `Pending`. Tasks, sleeps, worker jobs and lock acquisitions
//! all surface their outcome through one of these cells, and the combinators
//! only ever talk to cells through the [`Awaitable`] trait.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{panic_message, Error, Result};
use crate::scheduler::context;
use crate::scheduler::Diagnostics;

/// Observable state of a completion cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// No outcome yet
    Pending,
    /// Holds a value
    ResultSet,
    /// Holds an error
    ExceptionSet,
    /// Ended through cancellation
    Cancelled,
}

impl CompletionState {
    /// Whether the state is terminal.
    pub fn is_done(self) -> bool {
        self != CompletionState::Pending
    }
}

enum Slot<T> {
    Pending,
    Value(T),
    Error(Error),
    Cancelled,
}

type Callback<T> = Box<dyn FnOnce(&Completion<T>)>;

/// Handle to a registered done-callback, for [`Completion::remove_done_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

struct Inner<T> {
    slot: RefCell<Slot<T>>,
    callbacks: RefCell<Vec<(CallbackId, Callback<T>)>>,
    next_callback: Cell<u64>,
    /// Set once anyone has read the stored error
    observed: Cell<bool>,
    diagnostics: Option<Rc<Diagnostics>>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Slot::Error(error) = self.slot.get_mut() {
            if !self.observed.get() {
                tracing::warn!(error = %error, "completion dropped with an unobserved error");
                if let Some(diagnostics) = &self.diagnostics {
                    diagnostics.record_unobserved_error();
                }
            }
        }
    }
}

/// Single-assignment cell holding a value, an error or a cancellation.
///
/// Cloning yields another handle to the same cell.
pub struct Completion<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("state", &self.state())
            .finish()
    }
}

impl<T: 'static> Completion<T> {
    /// Create a pending cell.
    ///
    /// Created inside a running scheduler, the cell reports unobserved
    /// errors and callback panics to that scheduler's stats.
    pub fn new() -> Self {
        Self::with_diagnostics(context::current().map(|core| core.diagnostics()))
    }

    pub(crate) fn with_diagnostics(diagnostics: Option<Rc<Diagnostics>>) -> Self {
        Self {
            inner: Rc::new(Inner {
                slot: RefCell::new(Slot::Pending),
                callbacks: RefCell::new(Vec::new()),
                next_callback: Cell::new(0),
                observed: Cell::new(false),
                diagnostics,
            }),
        }
    }

    /// A cell that already holds `value`.
    pub(crate) fn resolved(value: T) -> Self {
        let cell = Self::new();
        *cell.inner.slot.borrow_mut() = Slot::Value(value);
        cell
    }

    /// Current state.
    pub fn state(&self) -> CompletionState {
        match &*self.inner.slot.borrow() {
            Slot::Pending => CompletionState::Pending,
            Slot::Value(_) => CompletionState::ResultSet,
            Slot::Error(_) => CompletionState::ExceptionSet,
            Slot::Cancelled => CompletionState::Cancelled,
        }
    }

    /// Whether the cell is terminal.
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Whether the cell ended through cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.state() == CompletionState::Cancelled
    }

    /// Non-blocking readiness check.
    pub fn poll(&self) -> Poll<()> {
        if self.is_done() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    /// Store a value. Fails with `AlreadyResolved` if the cell is terminal.
    pub fn set_result(&self, value: T) -> Result<()> {
        self.transition(Slot::Value(value))
    }

    /// Store an error. `Error::Cancelled` moves the cell to `Cancelled`.
    pub fn set_error(&self, error: impl Into<Error>) -> Result<()> {
        match error.into() {
            Error::Cancelled => self.transition(Slot::Cancelled),
            error => self.transition(Slot::Error(error)),
        }
    }

    /// Cancel the cell. Returns `false` if it was already terminal.
    pub fn cancel(&self) -> bool {
        self.transition(Slot::Cancelled).is_ok()
    }

    pub(crate) fn resolve(&self, outcome: Result<T>) -> Result<()> {
        match outcome {
            Ok(value) => self.set_result(value),
            Err(error) => self.set_error(error),
        }
    }

    /// Register an observer. On a terminal cell it runs immediately.
    pub fn add_done_callback<F>(&self, callback: F) -> CallbackId
    where
        F: FnOnce(&Completion<T>) + 'static,
    {
        let id = CallbackId(self.inner.next_callback.get());
        self.inner.next_callback.set(id.0 + 1);
        if self.is_done() {
            self.invoke(Box::new(callback));
        } else {
            self.inner.callbacks.borrow_mut().push((id, Box::new(callback)));
        }
        id
    }

    /// Unregister an observer that has not fired yet. Returns `false` if it
    /// already ran or was removed.
    pub fn remove_done_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.inner.callbacks.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != id);
        callbacks.len() != before
    }

    /// Number of observers waiting for the cell to finish.
    pub fn pending_callbacks(&self) -> usize {
        self.inner.callbacks.borrow().len()
    }

    /// The stored error, if any, without touching the value.
    pub fn error(&self) -> Result<Option<Error>> {
        match &*self.inner.slot.borrow() {
            Slot::Pending => Err(Error::NotReady),
            Slot::Cancelled => Err(Error::Cancelled),
            Slot::Value(_) => Ok(None),
            Slot::Error(error) => {
                self.inner.observed.set(true);
                Ok(Some(error.clone()))
            }
        }
    }

    /// Whether both handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Completion<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn wake_on_done(&self, waker: &Waker) -> CallbackId {
        let waker = waker.clone();
        self.add_done_callback(move |_| waker.wake())
    }

    fn transition(&self, next: Slot<T>) -> Result<()> {
        {
            let mut slot = self.inner.slot.borrow_mut();
            if !matches!(*slot, Slot::Pending) {
                return Err(Error::AlreadyResolved);
            }
            *slot = next;
        }

        let callbacks = std::mem::take(&mut *self.inner.callbacks.borrow_mut());
        for (_, callback) in callbacks {
            self.invoke(callback);
        }
        Ok(())
    }

    fn invoke(&self, callback: Callback<T>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(self))) {
            let message = panic_message(payload.as_ref());
            tracing::error!(%message, "completion callback panicked");
            if let Some(diagnostics) = &self.inner.diagnostics {
                diagnostics.record_callback_panic();
            }
        }
    }
}

impl<T: Clone + 'static> Completion<T> {
    /// The stored outcome.
    ///
    /// Fails with `NotReady` while pending, `Cancelled` after cancellation,
    /// or the stored error.
    pub fn result(&self) -> Result<T> {
        match &*self.inner.slot.borrow() {
            Slot::Pending => Err(Error::NotReady),
            Slot::Cancelled => Err(Error::Cancelled),
            Slot::Value(value) => Ok(value.clone()),
            Slot::Error(error) => {
                self.inner.observed.set(true);
                Err(error.clone())
            }
        }
    }
}

/// Future resolving to a completion's outcome.
///
/// Polling it is a suspension point: a pending cancellation of the current
/// task is delivered here as `Err(Cancelled)`.
#[must_use = "futures do nothing unless awaited"]
pub struct Wait<T> {
    completion: Completion<T>,
    registrations: Registrations,
}

impl<T> Wait<T> {
    pub(crate) fn new(completion: Completion<T>) -> Self {
        Self {
            completion,
            registrations: Registrations::default(),
        }
    }
}

impl<T: Clone + 'static> Future for Wait<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if context::take_cancellation() {
            return Poll::Ready(Err(Error::Cancelled));
        }
        if this.completion.is_done() {
            return Poll::Ready(this.completion.result());
        }
        if this.registrations.is_empty() {
            this.registrations.wake_on_done(&this.completion, cx.waker());
        }
        Poll::Pending
    }
}

impl<T: Clone + 'static> IntoFuture for Completion<T> {
    type Output = Result<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Wait<T> {
        Wait::new(self)
    }
}

impl<T: Clone + 'static> IntoFuture for &Completion<T> {
    type Output = Result<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Wait<T> {
        Wait::new(self.clone())
    }
}

/// Anything that produces a completion cell and can be asked to cancel.
///
/// Implemented by [`Task`](crate::Task), [`Completion`],
/// [`Sleep`](crate::Sleep) and [`Acquire`](crate::sync::Acquire); the
/// combinators accept any of them.
pub trait Awaitable {
    /// Value carried by the completion
    type Output: Clone + 'static;

    /// Handle to the underlying completion cell.
    fn completion(&self) -> Completion<Self::Output>;

    /// Request cancellation. Returns `false` if already terminal.
    fn cancel(&self) -> bool {
        self.completion().cancel()
    }

    /// Take ownership of whatever the outcome grants.
    ///
    /// Combinators call this just before handing a member's value to their
    /// caller. An unclaimed lock or permit grant is passed on when the
    /// awaitable is dropped.
    fn claim(&self) {}
}

impl<T: Clone + 'static> Awaitable for Completion<T> {
    type Output = T;

    fn completion(&self) -> Completion<T> {
        self.clone()
    }
}

impl<A: Awaitable + ?Sized> Awaitable for &A {
    type Output = A::Output;

    fn completion(&self) -> Completion<Self::Output> {
        (**self).completion()
    }

    fn cancel(&self) -> bool {
        (**self).cancel()
    }

    fn claim(&self) {
        (**self).claim()
    }
}

/// Type-erased view of a completion, for bookkeeping that does not care
/// about the value type.
pub(crate) trait ErasedCompletion {
    fn state(&self) -> CompletionState;
    fn is_done(&self) -> bool;
    fn cancel(&self) -> bool;
    fn fail(&self, error: Error);
    fn notify(&self, callback: Box<dyn FnOnce()>) -> CallbackId;
    fn remove_callback(&self, id: CallbackId) -> bool;
    fn boxed(&self) -> Box<dyn ErasedCompletion>;
}

impl<T: 'static> ErasedCompletion for Completion<T> {
    fn state(&self) -> CompletionState {
        Completion::state(self)
    }

    fn is_done(&self) -> bool {
        Completion::is_done(self)
    }

    fn cancel(&self) -> bool {
        Completion::cancel(self)
    }

    fn fail(&self, error: Error) {
        if self.set_error(error).is_err() {
            tracing::trace!("failure ignored: completion already resolved");
        }
    }

    fn notify(&self, callback: Box<dyn FnOnce()>) -> CallbackId {
        self.add_done_callback(move |_| callback())
    }

    fn remove_callback(&self, id: CallbackId) -> bool {
        self.remove_done_callback(id)
    }

    fn boxed(&self) -> Box<dyn ErasedCompletion> {
        Box::new(self.clone())
    }
}

/// Callbacks a waiter registered on other cells; the ones that have not
/// fired are removed when the waiter is dropped.
#[derive(Default)]
pub(crate) struct Registrations {
    entries: Vec<(Box<dyn ErasedCompletion>, CallbackId)>,
}

impl Registrations {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn on_done<T, F>(&mut self, cell: &Completion<T>, callback: F)
    where
        T: 'static,
        F: FnOnce(&Completion<T>) + 'static,
    {
        let id = cell.add_done_callback(callback);
        self.entries.push((Box::new(cell.clone()), id));
    }

    pub(crate) fn wake_on_done<T: 'static>(&mut self, cell: &Completion<T>, waker: &Waker) {
        let waker = waker.clone();
        self.on_done(cell, move |_| waker.wake());
    }

    pub(crate) fn notify(&mut self, cell: &dyn ErasedCompletion, callback: Box<dyn FnOnce()>) {
        let id = cell.notify(callback);
        self.entries.push((cell.boxed(), id));
    }
}

impl Drop for Registrations {
    fn drop(&mut self) {
        for (cell, id) in self.entries.drain(..) {
            cell.remove_callback(id);
        }
    }
}
