// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks: resumable units of execution.
//!
//! A task stores its continuation as a boxed future; the scheduler is
//! the sole mutator of task state and polls the continuation until it
//! suspends or settles. The typed result travels through a slot shared
//! between the spawned body and the `TaskHandle`, the same split the
//! scheduler uses for its own type-erased bookkeeping.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::error::TaskError;
use crate::sched::Core;

/// Unique, monotonically increasing task identifier. Doubles as the
/// deterministic tie-break key wherever one is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, waiting for the scheduler to resume it.
    Ready,
    /// Currently being polled.
    Running,
    /// Suspended on exactly one channel, select, timer, or handle.
    Blocked,
    /// Settled with a value.
    Done,
    /// Settled by panicking.
    Failed,
}

/// What unblocked a task. Diagnostic only; cleared when the task resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    /// A value (or the close notification) arrived on the channel.
    ChannelReadable(u64),
    /// Buffer space freed up or a receiver arrived on the channel.
    ChannelWritable(u64),
    /// The channel closed while the task waited on it.
    ChannelClosed(u64),
    /// One of a select's registered cases committed on the channel.
    SelectResolved(u64),
    /// A registered logical-time delay expired.
    TimerFired,
    /// The awaited task settled.
    TaskSettled(TaskId),
}

/// The scheduler-side task record. Owned exclusively by the scheduler
/// while the task is live; removed the moment the task settles.
pub(crate) struct TaskRecord {
    pub(crate) state: TaskState,
    /// The stored continuation. `None` only while the scheduler is
    /// actively polling it.
    pub(crate) future: Option<Pin<Box<dyn Future<Output = ()>>>>,
    pub(crate) completion: Rc<RefCell<Completion>>,
    pub(crate) wake_cause: Option<WakeCause>,
}

/// Type-erased settlement slot shared between the scheduler and the
/// task's handle. Outlives the task record.
pub(crate) struct Completion {
    pub(crate) outcome: Option<Result<(), TaskError>>,
    /// The single task awaiting this one, if any.
    pub(crate) waiter: Option<TaskId>,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            outcome: None,
            waiter: None,
        }
    }
}

/// Handle to a spawned task.
///
/// Awaiting the handle yields the task's result once it settles;
/// `outcome()` reads it without blocking (for use after `run()`).
/// Dropping the handle detaches the task — fire-and-forget is legal.
pub struct TaskHandle<T> {
    id: TaskId,
    completion: Rc<RefCell<Completion>>,
    value: Rc<RefCell<Option<T>>>,
    core: Weak<Core>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(
        id: TaskId,
        completion: Rc<RefCell<Completion>>,
        value: Rc<RefCell<Option<T>>>,
        core: Weak<Core>,
    ) -> Self {
        Self {
            id,
            completion,
            value,
            core,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current lifecycle state of the task.
    pub fn state(&self) -> TaskState {
        match &self.completion.borrow().outcome {
            Some(Ok(())) => TaskState::Done,
            Some(Err(_)) => TaskState::Failed,
            None => self
                .core
                .upgrade()
                .and_then(|core| core.task_state(self.id))
                .expect("unsettled task has no record"),
        }
    }

    /// Non-blocking read of the task's result. `None` until it settles.
    ///
    /// Panics if the result was already taken (here or via await).
    pub fn outcome(&self) -> Option<Result<T, TaskError>> {
        let done = self.completion.borrow();
        match done.outcome.as_ref()? {
            Ok(()) => Some(Ok(self
                .value
                .borrow_mut()
                .take()
                .expect("task result already taken"))),
            Err(e) => Some(Err(e.clone())),
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut done = this.completion.borrow_mut();
        if let Some(outcome) = done.outcome.as_ref() {
            let result = match outcome {
                Ok(()) => Ok(this
                    .value
                    .borrow_mut()
                    .take()
                    .expect("task result already taken")),
                Err(e) => Err(e.clone()),
            };
            return Poll::Ready(result);
        }
        let core = this
            .core
            .upgrade()
            .expect("scheduler dropped while awaiting a task");
        let me = core.current_or_panic("awaiting a task handle");
        assert!(
            done.waiter.is_none() || done.waiter == Some(me),
            "{} awaited from two tasks at once",
            this.id
        );
        done.waiter = Some(me);
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::sched::Scheduler;

    #[test]
    fn task_id_display() {
        assert_eq!(TaskId(3).to_string(), "task-3");
    }

    #[test]
    fn handle_reports_lifecycle() {
        let sched = Scheduler::new();
        let handle = sched.spawn(async { 41 + 1 });
        assert_eq!(handle.state(), TaskState::Ready);
        assert!(handle.outcome().is_none());
        sched.run();
        assert_eq!(handle.state(), TaskState::Done);
        assert_eq!(handle.outcome(), Some(Ok(42)));
    }

    #[test]
    fn awaiting_a_handle_yields_the_result() {
        let sched = Scheduler::new();
        let child = sched.spawn(async { "payload" });
        let got = sched
            .run_until(async move { child.await.unwrap() })
            .unwrap();
        assert_eq!(got, "payload");
    }

    #[test]
    fn failed_task_surfaces_to_awaiter() {
        let sched = Scheduler::new();
        let child = sched.spawn(async { panic!("boom") });
        let got: Result<(), TaskError> = sched.run_until(async move { child.await }).unwrap();
        match got {
            Err(TaskError::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn awaiting_an_already_settled_task_is_immediate() {
        let sched = Scheduler::new();
        let child = sched.spawn(async { 7 });
        sched.run();
        let got = sched.run_until(async move { child.await.unwrap() }).unwrap();
        assert_eq!(got, 7);
    }
}
