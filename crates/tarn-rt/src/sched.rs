// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deterministic cooperative scheduler.
//!
//! Single-threaded by contract. One FIFO ready queue decides what runs
//! next; a time-ordered queue of delayed wakeups decides what happens
//! when nothing is runnable. Logical time is simulated and advances
//! only at that point — never from wall time.
//!
//! Wakers are inert: every wakeup in this runtime is an explicit push
//! onto the ready queue performed by the scheduler, a channel, or a
//! select resolution. Given the same program, the interleaving is the
//! same on every run.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::channel::Channel;
use crate::clock::TimerQueue;
use crate::error::TaskError;
use crate::task::{Completion, TaskHandle, TaskId, TaskRecord, TaskState, WakeCause};

/// Shared scheduler state. Tasks reach it through `Scheduler` clones;
/// channels and handles hold `Weak` references to it.
pub(crate) struct Core {
    ready: RefCell<VecDeque<TaskId>>,
    /// Live task records. Keyed lookups only — never iterated, so the
    /// map's internal order cannot leak into execution order.
    tasks: RefCell<HashMap<TaskId, TaskRecord>>,
    timers: RefCell<TimerQueue>,
    now: Cell<u64>,
    /// The task currently being polled, if any.
    current: Cell<Option<TaskId>>,
    next_task: Cell<u64>,
    next_channel: Cell<u64>,
    failed: Cell<u64>,
}

impl Core {
    fn new() -> Self {
        Self {
            ready: RefCell::new(VecDeque::new()),
            tasks: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerQueue::new()),
            now: Cell::new(0),
            current: Cell::new(None),
            next_task: Cell::new(0),
            next_channel: Cell::new(0),
            failed: Cell::new(0),
        }
    }

    pub(crate) fn now(&self) -> u64 {
        self.now.get()
    }

    /// The task being polled right now. Every blocking operation calls
    /// this; using one outside a task is a programming bug.
    pub(crate) fn current_or_panic(&self, what: &str) -> TaskId {
        self.current
            .get()
            .unwrap_or_else(|| panic!("{what} outside a running task"))
    }

    pub(crate) fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.borrow().get(&id).map(|rec| rec.state)
    }

    pub(crate) fn next_channel_id(&self) -> u64 {
        let id = self.next_channel.get();
        self.next_channel.set(id + 1);
        id
    }

    /// Move a task to the ready-queue tail. The single wake path in
    /// the runtime: channels, selects, timers and settling tasks all
    /// come through here. Stale ids (settled tasks) are ignored.
    pub(crate) fn wake(&self, id: TaskId, cause: WakeCause) {
        let mut tasks = self.tasks.borrow_mut();
        let Some(rec) = tasks.get_mut(&id) else {
            return;
        };
        match rec.state {
            TaskState::Blocked | TaskState::Running => {
                rec.state = TaskState::Ready;
                rec.wake_cause = Some(cause);
                self.ready.borrow_mut().push_back(id);
            }
            // Already queued; a task resumes at most once per step.
            TaskState::Ready => {}
            TaskState::Done | TaskState::Failed => {
                unreachable!("settled tasks leave the table")
            }
        }
    }

    /// Register the current task for a wakeup at logical `wake_at`.
    pub(crate) fn register_timer(&self, wake_at: u64) -> u64 {
        let task = self.current_or_panic("sleep");
        self.timers.borrow_mut().insert(wake_at, task)
    }

    pub(crate) fn cancel_timer(&self, wake_at: u64, seq: u64) {
        self.timers.borrow_mut().remove(wake_at, seq);
    }

    /// Resume one task: poll its stored continuation until it settles
    /// or suspends again. Panics in the body are caught here and
    /// converted into task failure; the loop itself never dies.
    fn poll_task(&self, id: TaskId) {
        let mut fut = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(rec) = tasks.get_mut(&id) else {
                // Settled while queued (e.g. woken then killed by a
                // close on the same step). Nothing to do.
                return;
            };
            rec.state = TaskState::Running;
            rec.wake_cause = None;
            rec.future.take().expect("task polled re-entrantly")
        };
        self.current.set(Some(id));
        let waker = inert_waker();
        let mut cx = Context::from_waker(&waker);
        let polled = catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx)));
        self.current.set(None);
        match polled {
            Ok(Poll::Ready(())) => self.finish(id, Ok(())),
            Ok(Poll::Pending) => {
                let mut tasks = self.tasks.borrow_mut();
                let rec = tasks.get_mut(&id).expect("pending task lost its record");
                rec.future = Some(fut);
                // A wake that landed during the poll already moved the
                // task back to Ready; otherwise it is now suspended on
                // whatever the poll registered.
                if rec.state == TaskState::Running {
                    rec.state = TaskState::Blocked;
                }
            }
            Err(payload) => {
                // Drop the continuation first so pending channel and
                // select registrations deregister before the task is
                // declared settled.
                drop(fut);
                self.failed.set(self.failed.get() + 1);
                self.finish(id, Err(TaskError::Panicked(panic_message(payload))));
            }
        }
    }

    /// Settle a task: drop its record, publish the outcome, wake the
    /// awaiter if one is parked on the handle.
    fn finish(&self, id: TaskId, outcome: Result<(), TaskError>) {
        let rec = self
            .tasks
            .borrow_mut()
            .remove(&id)
            .expect("settling task has no record");
        let waiter = {
            let mut done = rec.completion.borrow_mut();
            done.outcome = Some(outcome);
            done.waiter.take()
        };
        if let Some(waiter) = waiter {
            self.wake(waiter, WakeCause::TaskSettled(id));
        }
    }
}

/// Handle to the runtime. Cheap to clone; every clone drives the same
/// scheduler. Spawned tasks typically capture a clone to spawn, sleep,
/// or open channels.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<Core>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            core: Rc::new(Core::new()),
        }
    }

    /// Queue an async body as a new task at the ready-queue tail.
    ///
    /// Never runs the body synchronously — not even its first step.
    pub fn spawn<T: 'static>(&self, body: impl Future<Output = T> + 'static) -> TaskHandle<T> {
        let id = TaskId(self.core.next_task.get());
        self.core.next_task.set(id.0 + 1);
        let completion = Rc::new(RefCell::new(Completion::new()));
        let value = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&value);
        let wrapped: Pin<Box<dyn Future<Output = ()>>> = Box::pin(async move {
            let out = body.await;
            *slot.borrow_mut() = Some(out);
        });
        self.core.tasks.borrow_mut().insert(
            id,
            TaskRecord {
                state: TaskState::Ready,
                future: Some(wrapped),
                completion: Rc::clone(&completion),
                wake_cause: None,
            },
        );
        self.core.ready.borrow_mut().push_back(id);
        TaskHandle::new(id, completion, value, Rc::downgrade(&self.core))
    }

    /// Open a channel on this scheduler. Capacity 0 is a rendezvous
    /// channel: every send waits for its receive.
    pub fn channel<T: 'static>(&self, capacity: usize) -> Channel<T> {
        Channel::new(
            Rc::downgrade(&self.core),
            self.core.next_channel_id(),
            capacity,
        )
    }

    /// Awaitable logical delay. `sleep(0)` still suspends: it resumes
    /// once the ready queue has drained at the current time.
    pub fn sleep(&self, ms: u64) -> Sleep {
        Sleep {
            core: Rc::downgrade(&self.core),
            state: SleepState::Unregistered { ms },
        }
    }

    /// A capacity-1 channel that receives `()` after `ms` logical
    /// milliseconds and is then closed. Combine with `select` for
    /// caller-level timeouts.
    pub fn timer(&self, ms: u64) -> Channel<()> {
        let ch = self.channel::<()>(1);
        let out = ch.clone();
        let sched = self.clone();
        let _detached = self.spawn(async move {
            sched.sleep(ms).await;
            let _ = ch.send(()).await;
            ch.close();
        });
        out
    }

    /// Run until no task is runnable and no timer is pending.
    ///
    /// Tasks still blocked on a channel or handle at that point stay
    /// blocked; `run` simply returns around them.
    pub fn run(&self) {
        loop {
            let next = self.core.ready.borrow_mut().pop_front();
            if let Some(id) = next {
                self.core.poll_task(id);
                continue;
            }
            let deadline = match self.core.timers.borrow().next_deadline() {
                Some(at) => at,
                None => break,
            };
            self.core.now.set(self.core.now.get().max(deadline));
            let due = self.core.timers.borrow_mut().take_due(deadline);
            for id in due {
                self.core.wake(id, WakeCause::TimerFired);
            }
        }
    }

    /// Spawn `body`, run to quiescence, return its result.
    ///
    /// Panics if `body` never settles — the quiescent scheduler has no
    /// way left to unblock it, so that is a deadlock in the program.
    pub fn run_until<T: 'static>(
        &self,
        body: impl Future<Output = T> + 'static,
    ) -> Result<T, TaskError> {
        let handle = self.spawn(body);
        self.run();
        handle
            .outcome()
            .expect("root task is still blocked after the scheduler quiesced")
    }

    /// Current logical time in milliseconds.
    pub fn now(&self) -> u64 {
        self.core.now()
    }

    /// Number of unsettled tasks (ready, running, or blocked).
    pub fn task_count(&self) -> usize {
        self.core.tasks.borrow().len()
    }

    /// Number of tasks that have settled by panicking.
    pub fn failed_count(&self) -> u64 {
        self.core.failed.get()
    }

    /// Number of delayed wakeups not yet fired or cancelled.
    pub fn pending_timers(&self) -> usize {
        self.core.timers.borrow().len()
    }
}

enum SleepState {
    Unregistered { ms: u64 },
    Waiting { wake_at: u64, seq: u64 },
    Elapsed,
}

/// Future returned by [`Scheduler::sleep`]. Dropping it before it
/// elapses cancels the timer entry.
pub struct Sleep {
    core: std::rc::Weak<Core>,
    state: SleepState,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let core = this.core.upgrade().expect("scheduler dropped mid-sleep");
        match this.state {
            SleepState::Unregistered { ms } => {
                let wake_at = core.now() + ms;
                let seq = core.register_timer(wake_at);
                this.state = SleepState::Waiting { wake_at, seq };
                Poll::Pending
            }
            SleepState::Waiting { wake_at, .. } => {
                if core.now() >= wake_at {
                    this.state = SleepState::Elapsed;
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
            SleepState::Elapsed => Poll::Ready(()),
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let SleepState::Waiting { wake_at, seq } = self.state {
            if let Some(core) = self.core.upgrade() {
                core.cancel_timer(wake_at, seq);
            }
        }
    }
}

fn inert_raw_waker() -> RawWaker {
    fn clone(_: *const ()) -> RawWaker {
        inert_raw_waker()
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    RawWaker::new(std::ptr::null(), &VTABLE)
}

/// A waker that does nothing. Suspension points register directly with
/// the scheduler's queues instead of going through the waker protocol.
fn inert_waker() -> Waker {
    // Safety: the vtable functions are all no-ops over a null pointer.
    unsafe { Waker::from_raw(inert_raw_waker()) }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn spawn_does_not_run_synchronously() {
        let sched = Scheduler::new();
        let touched = Rc::new(Cell::new(false));
        let flag = Rc::clone(&touched);
        sched.spawn(async move { flag.set(true) });
        assert!(!touched.get());
        sched.run();
        assert!(touched.get());
    }

    #[test]
    fn tasks_spawned_together_start_in_spawn_order() {
        let sched = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for n in 0..4 {
            let order = Rc::clone(&order);
            sched.spawn(async move { order.borrow_mut().push(n) });
        }
        sched.run();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn logical_time_advances_only_on_sleep() {
        let sched = Scheduler::new();
        let s = sched.clone();
        sched.spawn(async move {
            assert_eq!(s.now(), 0);
            s.sleep(250).await;
            assert_eq!(s.now(), 250);
            s.sleep(0).await;
            assert_eq!(s.now(), 250);
        });
        sched.run();
        assert_eq!(sched.now(), 250);
    }

    #[test]
    fn equal_deadline_sleeps_wake_in_registration_order() {
        let sched = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for n in 0..3 {
            let s = sched.clone();
            let order = Rc::clone(&order);
            sched.spawn(async move {
                s.sleep(10).await;
                order.borrow_mut().push(n);
            });
        }
        sched.run();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn sleeps_interleave_by_deadline_not_spawn_order() {
        let sched = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (name, ms) in [("slow", 30u64), ("fast", 10), ("mid", 20)] {
            let s = sched.clone();
            let order = Rc::clone(&order);
            sched.spawn(async move {
                s.sleep(ms).await;
                order.borrow_mut().push(name);
            });
        }
        sched.run();
        assert_eq!(*order.borrow(), vec!["fast", "mid", "slow"]);
    }

    #[test]
    fn panicking_task_does_not_stop_its_siblings() {
        let sched = Scheduler::new();
        let survivor = Rc::new(Cell::new(false));
        sched.spawn(async { panic!("isolated failure") });
        let flag = Rc::clone(&survivor);
        let s = sched.clone();
        sched.spawn(async move {
            s.sleep(5).await;
            flag.set(true);
        });
        sched.run();
        assert!(survivor.get());
        assert_eq!(sched.failed_count(), 1);
        assert_eq!(sched.task_count(), 0);
    }

    #[test]
    fn run_is_reentrant_across_calls() {
        let sched = Scheduler::new();
        let first = sched.spawn(async { 1 });
        sched.run();
        assert_eq!(first.outcome(), Some(Ok(1)));
        let second = sched.spawn(async { 2 });
        sched.run();
        assert_eq!(second.outcome(), Some(Ok(2)));
    }

    #[test]
    fn dropping_a_sleep_cancels_its_timer() {
        let sched = Scheduler::new();
        let s = sched.clone();
        sched.spawn(async move {
            let mut long = Box::pin(s.sleep(1_000));
            let waker = inert_waker();
            let mut cx = Context::from_waker(&waker);
            assert!(long.as_mut().poll(&mut cx).is_pending());
            drop(long);
        });
        sched.run();
        assert_eq!(sched.pending_timers(), 0);
        assert_eq!(sched.now(), 0);
    }

    #[test]
    fn timer_delivers_then_closes() {
        let sched = Scheduler::new();
        let s = sched.clone();
        let got = sched
            .run_until(async move {
                let t = s.timer(40);
                let fired = t.recv().await;
                (fired, t.recv().await, s.now())
            })
            .unwrap();
        assert_eq!(got, (Some(()), None, 40));
    }

    #[test]
    fn run_until_returns_the_root_result() {
        let sched = Scheduler::new();
        let s = sched.clone();
        let got = sched
            .run_until(async move {
                s.sleep(7).await;
                s.now()
            })
            .unwrap();
        assert_eq!(got, 7);
    }
}
