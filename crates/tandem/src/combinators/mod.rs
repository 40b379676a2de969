//! Completion combinators
//!
//! Each combinator observes a set of [`Awaitable`](crate::Awaitable)s
//! through their completion cells and resolves to one outcome with its own
//! ordering, partial-failure and timeout policy.

mod as_completed;
mod gather;
mod timeout;
mod wait;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::completion::{Completion, ErasedCompletion, Registrations};
use crate::error::{Error, Result};
use crate::scheduler::context;

pub use as_completed::{as_completed, AsCompleted, NextCompleted};
pub use gather::{gather, Gather, GatherSettled};
pub use timeout::{shield, wait_for};
pub use wait::{wait, ReturnWhen, WaitSet};

/// Resolves to the index of the first watched cell that is done.
///
/// An interruptible race is a suspension point and yields `Err(Cancelled)`
/// when the current task is cancelled. A non-interruptible one leaves the
/// cancellation pending for the next suspension point.
pub(crate) struct FirstDone {
    watched: Vec<Box<dyn ErasedCompletion>>,
    interruptible: bool,
    registrations: Registrations,
}

impl FirstDone {
    pub(crate) fn new(interruptible: bool) -> Self {
        Self {
            watched: Vec::new(),
            interruptible,
            registrations: Registrations::default(),
        }
    }

    pub(crate) fn watch<T: 'static>(mut self, cell: &Completion<T>) -> Self {
        self.watched.push(Box::new(cell.clone()));
        self
    }
}

impl Future for FirstDone {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.interruptible && context::take_cancellation() {
            return Poll::Ready(Err(Error::Cancelled));
        }
        if let Some(index) = this.watched.iter().position(|cell| cell.is_done()) {
            return Poll::Ready(Ok(index));
        }
        if this.registrations.is_empty() {
            for cell in &this.watched {
                let waker = cx.waker().clone();
                this.registrations.notify(cell.as_ref(), Box::new(move || waker.wake()));
            }
        }
        Poll::Pending
    }
}
