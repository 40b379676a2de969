//! as_completed: yield member outcomes in completion order

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::completion::{Awaitable, Completion, Registrations};
use crate::error::{Error, Result};
use crate::scheduler::{context, sleep, Sleep};

/// Iterate over member outcomes in the order the members finish.
///
/// Call [`AsCompleted::next`] exactly as many times as there are members;
/// each call yields a future for the next outcome to land. A lock or permit
/// grant belongs to the caller once its `Ok` has been yielded.
///
/// ```ignore
/// let mut results = as_completed(tasks).with_timeout(Duration::from_secs(2));
/// while let Some(next) = results.next() {
///     match next.await {
///         Ok(value) => println!("{value}"),
///         Err(error) if error.is_timeout() => println!("gave up waiting"),
///         Err(error) => return Err(error),
///     }
/// }
/// ```
pub fn as_completed<I, A>(members: I) -> AsCompleted<A>
where
    I: IntoIterator<Item = A>,
    A: Awaitable,
{
    let members: Vec<A> = members.into_iter().collect();
    let arrivals = Rc::new(RefCell::new(Arrivals::default()));
    let cells: Vec<Completion<A::Output>> = members.iter().map(Awaitable::completion).collect();
    let mut registrations = Registrations::default();
    for (index, cell) in cells.iter().enumerate() {
        let arrivals = Rc::clone(&arrivals);
        registrations.on_done(cell, move |_| arrivals.borrow_mut().push(index));
    }
    AsCompleted {
        remaining: members.len(),
        members,
        cells,
        arrivals,
        timeout: None,
        _registrations: registrations,
    }
}

#[derive(Default)]
struct Arrivals {
    /// Member indices in completion order
    order: VecDeque<usize>,
    waker: Option<Waker>,
}

impl Arrivals {
    fn push(&mut self, index: usize) {
        self.order.push_back(index);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Completion-order iterator returned by [`as_completed`].
pub struct AsCompleted<A: Awaitable> {
    members: Vec<A>,
    cells: Vec<Completion<A::Output>>,
    arrivals: Rc<RefCell<Arrivals>>,
    remaining: usize,
    timeout: Option<Duration>,
    /// Arrival callbacks, removed if the iterator is dropped early
    _registrations: Registrations,
}

impl<A: Awaitable> AsCompleted<A> {
    /// Give each `next()` at most `timeout` to produce an outcome.
    ///
    /// An iteration that times out yields `Err(TimedOut)` and consumes its
    /// slot; no member is cancelled.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of outcomes still to be yielded.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// The members, in input order.
    pub fn members(&self) -> &[A] {
        &self.members
    }

    /// Future for the next outcome, or `None` once every slot was yielded.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<NextCompleted<'_, A>> {
        if self.remaining == 0 {
            return None;
        }
        Some(NextCompleted {
            set: self,
            timer: None,
        })
    }
}

/// Future for one outcome of an [`AsCompleted`] sequence.
#[must_use = "futures do nothing unless awaited"]
pub struct NextCompleted<'a, A: Awaitable> {
    set: &'a mut AsCompleted<A>,
    timer: Option<Sleep>,
}

impl<A: Awaitable> Future for NextCompleted<'_, A> {
    type Output = Result<A::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if context::take_cancellation() {
            return Poll::Ready(Err(Error::Cancelled));
        }

        let arrived = this.set.arrivals.borrow_mut().order.pop_front();
        if let Some(index) = arrived {
            this.set.remaining -= 1;
            let outcome = this.set.cells[index].result();
            if outcome.is_ok() {
                this.set.members[index].claim();
            }
            return Poll::Ready(outcome);
        }

        if let Some(timeout) = this.set.timeout {
            if this.timer.is_none() {
                let timer = sleep(timeout);
                timer.completion().wake_on_done(cx.waker());
                this.timer = Some(timer);
            }
            if this.timer.as_ref().is_some_and(Sleep::is_elapsed) {
                this.set.remaining -= 1;
                tracing::trace!(remaining = this.set.remaining, "as_completed iteration timed out");
                return Poll::Ready(Err(Error::TimedOut));
            }
        }

        this.set.arrivals.borrow_mut().waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::{spawn, Scheduler, Task};

    fn scheduler() -> Scheduler {
        Scheduler::with_config(SchedulerConfig::virtual_time())
    }

    fn delayed(secs: u64) -> Task<u64> {
        spawn(async move {
            sleep(Duration::from_secs(secs)).await?;
            Ok(secs)
        })
    }

    #[test]
    fn test_yields_in_completion_order() {
        let sched = scheduler();
        let order = sched
            .block_on(async {
                let mut results = as_completed([delayed(10), delayed(1), delayed(1)]);
                let mut order = Vec::new();
                while let Some(next) = results.next() {
                    order.push(next.await?);
                }
                assert_eq!(results.remaining(), 0);
                Ok(order)
            })
            .unwrap();
        assert_eq!(order, vec![1, 1, 10]);
    }

    #[test]
    fn test_finished_members_yield_first() {
        let sched = scheduler();
        let seen = sched
            .block_on(async {
                let ready = Completion::new();
                ready.set_result(5)?;
                let mut results = as_completed([delayed(1).completion(), ready]);
                let mut seen = Vec::new();
                while let Some(next) = results.next() {
                    seen.push(next.await?);
                }
                assert!(results.next().is_none());
                Ok(seen)
            })
            .unwrap();
        assert_eq!(seen, vec![5, 1]);
    }

    #[test]
    fn test_iteration_timeout_consumes_slot_without_cancelling() {
        let sched = scheduler();
        let (outcomes, members) = sched
            .block_on(async {
                let mut results = as_completed([delayed(1), delayed(10)])
                    .with_timeout(Duration::from_secs(2));
                let mut outcomes = Vec::new();
                while let Some(next) = results.next() {
                    outcomes.push(next.await.map_err(|error| error.is_timeout()));
                }
                Ok((outcomes, results.members().to_vec()))
            })
            .unwrap();
        assert_eq!(outcomes, vec![Ok(1), Err(true)]);
        assert!(!members[1].done());
        assert_eq!(sched.run_until_complete(&members[1]).unwrap(), 10);
    }
}
