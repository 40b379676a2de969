//! The acquisition future shared by every primitive

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::completion::{Awaitable, Completion, CompletionState, Wait};
use crate::error::Result;

/// Primitive side of an acquisition.
pub(crate) trait Grantor {
    /// A grant reached an acquirer that stopped waiting; pass it on.
    fn regrant(&self);

    /// Drop a waiter that was abandoned while still queued.
    fn withdraw(&self, waiter: &Completion<()>);
}

/// Pending acquisition of a [`Lock`](super::Lock),
/// [`ReentrantLock`](super::ReentrantLock) or semaphore.
///
/// Awaiting it is a suspension point. When it resolves with `Ok(())` the
/// caller holds the primitive and must release it. Dropping it before then
/// removes it from the wait queue, and a grant that arrives for an
/// acquisition that was cancelled is passed to the next waiter.
///
/// Handed to a combinator, the grant belongs to the combinator's caller only
/// once the combinator returns it as `Ok`; an acquisition dropped with an
/// unclaimed grant releases it.
#[must_use = "futures do nothing unless awaited"]
pub struct Acquire {
    grantor: Rc<dyn Grantor>,
    waiter: Completion<()>,
    wait: Wait<()>,
    /// Outcome consumed by `poll` or claimed by a combinator's caller
    settled: Cell<bool>,
}

impl Acquire {
    pub(crate) fn granted(grantor: Rc<dyn Grantor>) -> Self {
        Self::queued(grantor, Completion::resolved(()))
    }

    pub(crate) fn queued(grantor: Rc<dyn Grantor>, waiter: Completion<()>) -> Self {
        Self {
            grantor,
            wait: Wait::new(waiter.clone()),
            waiter,
            settled: Cell::new(false),
        }
    }

    /// Whether the primitive has been granted to this acquisition.
    pub fn is_granted(&self) -> bool {
        self.waiter.state() == CompletionState::ResultSet
    }

    fn abandon(&self) {
        if self.waiter.state() == CompletionState::ResultSet {
            self.grantor.regrant();
        } else {
            self.waiter.cancel();
            self.grantor.withdraw(&self.waiter);
        }
    }
}

impl Future for Acquire {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.wait).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                this.settled.set(true);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => {
                this.settled.set(true);
                this.abandon();
                Poll::Ready(Err(error))
            }
        }
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        if !self.settled.get() {
            self.abandon();
        }
    }
}

impl Awaitable for Acquire {
    type Output = ();

    fn completion(&self) -> Completion<()> {
        self.waiter.clone()
    }

    fn claim(&self) {
        if self.is_granted() {
            self.settled.set(true);
        }
    }

    fn cancel(&self) -> bool {
        if self.waiter.is_done() {
            return false;
        }
        self.waiter.cancel();
        self.grantor.withdraw(&self.waiter);
        true
    }
}
