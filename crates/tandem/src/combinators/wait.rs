//! wait: split members into done and pending under a completion policy

use std::cell::RefCell;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::completion::{Awaitable, CompletionState, Registrations};
use crate::error::{Error, Result};
use crate::scheduler::{context, sleep, Sleep};

/// When a [`wait`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnWhen {
    /// As soon as any member is done
    FirstCompleted,
    /// As soon as any member fails, or when all are done
    FirstError,
    /// When every member is done
    #[default]
    AllCompleted,
}

/// Wait until `policy` holds or `timeout` elapses, then split the members
/// into `(done, pending)`.
///
/// The split is taken at the instant the condition first held, so a member
/// that finishes later in the same scheduler step is still reported as
/// pending. A pending member may therefore already be done by the time the
/// caller resumes, and cancelling it is then a no-op; check
/// [`Awaitable::completion`] before relying on a cancel. Member errors are
/// never raised and members are never cancelled; inspect and cancel them
/// afterwards as needed.
///
/// Members come back unclaimed: await a granted lock or semaphore
/// acquisition from `done` to take ownership, or drop it to pass the grant
/// on.
///
/// # Panics
///
/// Polling with a `timeout` outside a running scheduler panics.
pub fn wait<I, A>(members: I, policy: ReturnWhen, timeout: Option<Duration>) -> WaitSet<A>
where
    I: IntoIterator<Item = A>,
    A: Awaitable,
{
    let members: Vec<A> = members.into_iter().collect();
    let progress = Progress {
        done: vec![false; members.len()],
        errored: false,
        policy,
        split: None,
        waker: None,
    };
    WaitSet {
        members,
        progress: Rc::new(RefCell::new(progress)),
        timeout,
        timer: None,
        armed: false,
        registrations: Registrations::default(),
    }
}

struct Progress {
    done: Vec<bool>,
    errored: bool,
    policy: ReturnWhen,
    /// Done flags captured when the wait was decided
    split: Option<Vec<bool>>,
    waker: Option<Waker>,
}

impl Progress {
    fn satisfied(&self) -> bool {
        let all = self.done.iter().all(|done| *done);
        match self.policy {
            ReturnWhen::AllCompleted => all,
            ReturnWhen::FirstCompleted => all || self.done.iter().any(|done| *done),
            ReturnWhen::FirstError => all || self.errored,
        }
    }

    fn decide(&mut self) {
        if self.split.is_some() {
            return;
        }
        self.split = Some(self.done.clone());
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Future returned by [`wait`].
#[must_use = "futures do nothing unless awaited"]
pub struct WaitSet<A: Awaitable> {
    members: Vec<A>,
    progress: Rc<RefCell<Progress>>,
    timeout: Option<Duration>,
    timer: Option<Sleep>,
    armed: bool,
    registrations: Registrations,
}

// Members are never pinned.
impl<A: Awaitable> Unpin for WaitSet<A> {}

impl<A: Awaitable> WaitSet<A> {
    fn arm(&mut self) {
        self.armed = true;
        for (index, member) in self.members.iter().enumerate() {
            let progress = Rc::clone(&self.progress);
            self.registrations.on_done(&member.completion(), move |cell| {
                let mut progress = progress.borrow_mut();
                progress.done[index] = true;
                if cell.state() == CompletionState::ExceptionSet {
                    progress.errored = true;
                }
                if progress.satisfied() {
                    progress.decide();
                }
            });
        }
        if self.progress.borrow().satisfied() {
            self.progress.borrow_mut().decide();
        }

        if let Some(timeout) = self.timeout {
            let timer = sleep(timeout);
            let progress = Rc::clone(&self.progress);
            timer.completion().add_done_callback(move |cell| {
                if cell.state() == CompletionState::ResultSet {
                    tracing::trace!("wait timed out");
                    progress.borrow_mut().decide();
                }
            });
            self.timer = Some(timer);
        }
    }
}

impl<A: Awaitable> Future for WaitSet<A> {
    type Output = Result<(Vec<A>, Vec<A>)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if context::take_cancellation() {
            return Poll::Ready(Err(Error::Cancelled));
        }
        this.progress.borrow_mut().waker = Some(cx.waker().clone());
        if !this.armed {
            this.arm();
        }

        let split = this.progress.borrow_mut().split.take();
        let Some(split) = split else {
            return Poll::Pending;
        };
        this.timer = None;
        this.registrations = Registrations::default();
        let mut done = Vec::new();
        let mut pending = Vec::new();
        for (member, finished) in mem::take(&mut this.members).into_iter().zip(split) {
            if finished {
                done.push(member);
            } else {
                pending.push(member);
            }
        }
        Poll::Ready(Ok((done, pending)))
    }
}
