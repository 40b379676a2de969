//! gather: wait for every member, results in input order

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::completion::{Awaitable, Completion, CompletionState, Registrations};
use crate::error::{Error, Result};
use crate::scheduler::context;

/// Await every member and collect their values in input order.
///
/// The returned future fails fast: as soon as a member has failed or been
/// cancelled it resolves to that error, picking the first failed member in
/// input order. The other members keep running. Use
/// [`Gather::return_errors`] to collect every outcome instead.
///
/// Cancelling the awaiting task cancels every unfinished member. Lock and
/// semaphore grants belong to the caller only once the gather returns
/// `Ok`; otherwise they are passed on when the gather is dropped.
pub fn gather<I, A>(members: I) -> Gather<A>
where
    I: IntoIterator<Item = A>,
    A: Awaitable,
{
    let members: Vec<A> = members.into_iter().collect();
    let cells = members.iter().map(Awaitable::completion).collect();
    Gather {
        set: MemberSet::new(members, cells),
    }
}

struct MemberSet<A: Awaitable> {
    members: Vec<A>,
    cells: Vec<Completion<A::Output>>,
    registrations: Registrations,
}

impl<A: Awaitable> MemberSet<A> {
    fn new(members: Vec<A>, cells: Vec<Completion<A::Output>>) -> Self {
        Self {
            members,
            cells,
            registrations: Registrations::default(),
        }
    }

    fn all_done(&self) -> bool {
        self.cells.iter().all(Completion::is_done)
    }

    fn first_failure(&self) -> Option<Error> {
        self.cells.iter().find_map(|cell| match cell.state() {
            CompletionState::ExceptionSet | CompletionState::Cancelled => {
                cell.result().err()
            }
            _ => None,
        })
    }

    fn arm(&mut self, cx: &Context<'_>) {
        if !self.registrations.is_empty() {
            return;
        }
        for cell in &self.cells {
            self.registrations.wake_on_done(cell, cx.waker());
        }
    }

    /// Hand every member's outcome to the caller.
    fn claim(&mut self) {
        self.registrations = Registrations::default();
        for member in &self.members {
            member.claim();
        }
    }

    fn cancel_unfinished(&self) {
        let mut cancelled = 0;
        for member in &self.members {
            if member.cancel() {
                cancelled += 1;
            }
        }
        tracing::debug!(cancelled, "gather cancelled, members cancelled");
    }
}

/// Future returned by [`gather`].
#[must_use = "futures do nothing unless awaited"]
pub struct Gather<A: Awaitable> {
    set: MemberSet<A>,
}

// Members are never pinned.
impl<A: Awaitable> Unpin for Gather<A> {}

impl<A: Awaitable> Gather<A> {
    /// Wait for every member and return each outcome, errors included.
    pub fn return_errors(self) -> GatherSettled<A> {
        GatherSettled { set: self.set }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.set.members.len()
    }

    /// Whether there are no members.
    pub fn is_empty(&self) -> bool {
        self.set.members.is_empty()
    }
}

impl<A: Awaitable> Future for Gather<A> {
    type Output = Result<Vec<A::Output>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let set = &mut self.get_mut().set;
        if context::take_cancellation() {
            set.cancel_unfinished();
            return Poll::Ready(Err(Error::Cancelled));
        }
        if let Some(error) = set.first_failure() {
            return Poll::Ready(Err(error));
        }
        if set.all_done() {
            let values: Result<Vec<A::Output>> = set.cells.iter().map(Completion::result).collect();
            if values.is_ok() {
                set.claim();
            }
            return Poll::Ready(values);
        }
        set.arm(cx);
        Poll::Pending
    }
}

/// Future returned by [`Gather::return_errors`].
///
/// Resolves once every member is done. Only the cancellation of the awaiting
/// task makes the outer result an error.
#[must_use = "futures do nothing unless awaited"]
pub struct GatherSettled<A: Awaitable> {
    set: MemberSet<A>,
}

impl<A: Awaitable> Unpin for GatherSettled<A> {}

impl<A: Awaitable> Future for GatherSettled<A> {
    type Output = Result<Vec<Result<A::Output>>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let set = &mut self.get_mut().set;
        if context::take_cancellation() {
            set.cancel_unfinished();
            return Poll::Ready(Err(Error::Cancelled));
        }
        if set.all_done() {
            let outcomes: Vec<Result<A::Output>> = set.cells.iter().map(Completion::result).collect();
            set.claim();
            return Poll::Ready(Ok(outcomes));
        }
        set.arm(cx);
        Poll::Pending
    }
}
