/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! A single-threaded event loop with a macrotask queue and a microtask queue.
//!
//! IndexedDB requests complete on the [`TaskSourceName::DatabaseAccess`] task
//! source, so their events always run after every microtask queued by the task
//! that issued them.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use log::trace;

type Task = Box<dyn FnOnce()>;

/// <https://html.spec.whatwg.org/multipage/#task-source>
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TaskSourceName {
    DatabaseAccess,
    DomManipulation,
    Timer,
}

#[derive(Clone, Default)]
pub struct EventLoop {
    inner: Rc<EventLoopInner>,
}

#[derive(Default)]
struct EventLoopInner {
    tasks: RefCell<VecDeque<(TaskSourceName, Task)>>,
    microtasks: RefCell<VecDeque<Task>>,
    performing_a_microtask_checkpoint: Cell<bool>,
    /// Run once at the end of the next microtask checkpoint.
    transaction_cleanups: RefCell<Vec<Task>>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("tasks", &self.inner.tasks.borrow().len())
            .field("microtasks", &self.inner.microtasks.borrow().len())
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_task(&self, source: TaskSourceName, task: impl FnOnce() + 'static) {
        self.inner
            .tasks
            .borrow_mut()
            .push_back((source, Box::new(task)));
    }

    pub fn queue_microtask(&self, microtask: impl FnOnce() + 'static) {
        self.inner
            .microtasks
            .borrow_mut()
            .push_back(Box::new(microtask));
    }

    /// Registers a step of "cleanup Indexed Database transactions" for the
    /// current task.
    pub(crate) fn register_transaction_cleanup(&self, cleanup: impl FnOnce() + 'static) {
        self.inner
            .transaction_cleanups
            .borrow_mut()
            .push(Box::new(cleanup));
    }

    pub fn has_pending_tasks(&self) -> bool {
        !self.inner.tasks.borrow().is_empty()
    }

    /// Runs the oldest queued task followed by a microtask checkpoint.
    /// Returns false if there was nothing to run.
    pub fn run_one_task(&self) -> bool {
        let Some((source, task)) = self.inner.tasks.borrow_mut().pop_front() else {
            return false;
        };
        trace!("Running task from {source:?}");
        task();
        self.perform_a_microtask_checkpoint();
        true
    }

    /// Finishes the current task with a microtask checkpoint, then runs tasks
    /// until the queue is empty.
    pub fn run_until_idle(&self) {
        self.perform_a_microtask_checkpoint();
        while self.run_one_task() {}
    }

    /// <https://html.spec.whatwg.org/multipage/#perform-a-microtask-checkpoint>
    pub fn perform_a_microtask_checkpoint(&self) {
        // Step 1.
        if self.inner.performing_a_microtask_checkpoint.get() {
            return;
        }
        // Step 2.
        self.inner.performing_a_microtask_checkpoint.set(true);

        // Step 3.
        loop {
            let Some(microtask) = self.inner.microtasks.borrow_mut().pop_front() else {
                break;
            };
            microtask();
        }

        // Step 6: Cleanup Indexed Database transactions.
        let cleanups = std::mem::take(&mut *self.inner.transaction_cleanups.borrow_mut());
        for cleanup in cleanups {
            cleanup();
        }

        // Step 8.
        self.inner.performing_a_microtask_checkpoint.set(false);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{EventLoop, TaskSourceName};

    #[test]
    fn microtasks_run_before_the_next_task() {
        let event_loop = EventLoop::new();
        let log = Rc::new(RefCell::new(vec![]));

        let (task_log, inner_loop) = (log.clone(), event_loop.clone());
        event_loop.queue_task(TaskSourceName::DomManipulation, move || {
            let microtask_log = task_log.clone();
            inner_loop.queue_microtask(move || microtask_log.borrow_mut().push("microtask"));
            let queued_log = task_log.clone();
            inner_loop.queue_task(TaskSourceName::DatabaseAccess, move || {
                queued_log.borrow_mut().push("task")
            });
            task_log.borrow_mut().push("first");
        });
        event_loop.run_until_idle();

        assert_eq!(*log.borrow(), ["first", "microtask", "task"]);
    }

    #[test]
    fn cleanups_run_after_microtasks() {
        let event_loop = EventLoop::new();
        let log = Rc::new(RefCell::new(vec![]));

        let cleanup_log = log.clone();
        event_loop.register_transaction_cleanup(move || cleanup_log.borrow_mut().push("cleanup"));
        let microtask_log = log.clone();
        event_loop.queue_microtask(move || microtask_log.borrow_mut().push("microtask"));
        event_loop.perform_a_microtask_checkpoint();
        event_loop.perform_a_microtask_checkpoint();

        assert_eq!(*log.borrow(), ["microtask", "cleanup"]);
    }
}
