//! Thread-local access to the running scheduler and the task being polled.

use std::cell::RefCell;
use std::rc::Rc;

use super::scheduler::Core;
use super::task::{TaskHeader, TaskId};

thread_local! {
    static CURRENT: RefCell<Option<Rc<Core>>> = const { RefCell::new(None) };
    static CURRENT_TASK: RefCell<Option<Rc<TaskHeader>>> = const { RefCell::new(None) };
}

/// Restores the previously entered scheduler on drop.
pub(crate) struct EnterGuard {
    prev: Option<Rc<Core>>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

pub(crate) fn enter(core: Rc<Core>) -> EnterGuard {
    let prev = CURRENT.with(|current| current.borrow_mut().replace(core));
    EnterGuard { prev }
}

pub(crate) fn current() -> Option<Rc<Core>> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) fn expect_current(operation: &str) -> Rc<Core> {
    match current() {
        Some(core) => core,
        None => panic!("`{operation}` called outside of a running scheduler"),
    }
}

/// Clears the current task on drop.
pub(crate) struct TaskGuard {
    prev: Option<Rc<TaskHeader>>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_TASK.with(|task| *task.borrow_mut() = prev);
    }
}

pub(crate) fn enter_task(header: Rc<TaskHeader>) -> TaskGuard {
    let prev = CURRENT_TASK.with(|task| task.borrow_mut().replace(header));
    TaskGuard { prev }
}

pub(crate) fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK.with(|task| task.borrow().as_ref().map(|header| header.id()))
}

/// Consume a cancellation delivered to the task being polled.
///
/// Every suspension point calls this first; `true` means the point must
/// return `Err(Cancelled)` instead of waiting.
pub(crate) fn take_cancellation() -> bool {
    CURRENT_TASK.with(|task| {
        task.borrow()
            .as_ref()
            .is_some_and(|header| header.take_cancel_delivery())
    })
}
