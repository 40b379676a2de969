//! Deadline-ordered timers and the sleep future

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use super::scheduler::Core;
use crate::completion::{Awaitable, Completion, CompletionState, Wait};
use crate::error::Result;

/// Position of a timer in the queue; equal deadlines fire in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    deadline: Instant,
    seq: u64,
}

/// Timers keyed by (deadline, sequence)
pub(crate) struct TimerQueue {
    entries: BTreeMap<TimerKey, Completion<()>>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn insert(&mut self, deadline: Instant, completion: Completion<()>) -> TimerKey {
        let key = TimerKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, completion);
        key
    }

    pub(crate) fn remove(&mut self, key: TimerKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|key| key.deadline)
    }

    /// Remove every timer due at `now`, earliest first.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<Completion<()>> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().deadline > now {
                break;
            }
            expired.push(entry.remove());
        }
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Future that resolves once the scheduler clock reaches a deadline.
///
/// Created by [`sleep`](crate::sleep), [`sleep_until`](crate::sleep_until)
/// and [`yield_now`](crate::yield_now). Dropping it early disarms the timer
/// and cancels its completion.
#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    completion: Completion<()>,
    wait: Wait<()>,
    key: TimerKey,
    core: Weak<Core>,
}

impl Sleep {
    pub(crate) fn new(core: &Rc<Core>, deadline: Instant) -> Self {
        let completion = Completion::with_diagnostics(Some(core.diagnostics()));
        let key = core.insert_timer(deadline, completion.clone());
        Self {
            wait: Wait::new(completion.clone()),
            completion,
            key,
            core: Rc::downgrade(core),
        }
    }

    /// Deadline this sleep waits for.
    pub fn deadline(&self) -> Instant {
        self.key.deadline
    }

    /// Whether the deadline has been reached.
    pub fn is_elapsed(&self) -> bool {
        self.completion.state() == CompletionState::ResultSet
    }
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().wait).poll(cx)
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if self.completion.is_done() {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.cancel_timer(self.key);
        }
        self.completion.cancel();
    }
}

impl Awaitable for Sleep {
    type Output = ();

    fn completion(&self) -> Completion<()> {
        self.completion.clone()
    }
}
