// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels: the only way tasks communicate.
//!
//! A channel is a bounded FIFO mailbox plus two FIFO queues of blocked
//! waiters. Capacity 0 is a rendezvous channel: every send waits for
//! its matching receive. The waiter queues are heterogeneous — plain
//! task waiters and registered select cases share them, so per-channel
//! FIFO order covers both.
//!
//! Borrow discipline: waking a task or deregistering a select touches
//! the scheduler core or *other* channels, so those actions are never
//! performed while this channel's state is borrowed. Every operation
//! collects them into [`Followups`] and applies them after the borrow
//! ends.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::error::SendOnClosedChannelError;
use crate::sched::Core;
use crate::select::{Selected, SelectShared};
use crate::task::{TaskId, WakeCause};

/// Cheap-clone handle to one channel. All clones alias the same state.
pub struct Channel<T> {
    inner: Rc<RefCell<ChanState<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

struct ChanState<T> {
    core: Weak<Core>,
    id: u64,
    capacity: usize,
    buffer: VecDeque<T>,
    senders: VecDeque<SendWaiter<T>>,
    receivers: VecDeque<RecvWaiter<T>>,
    closed: bool,
}

enum SendWaiter<T> {
    Task {
        task: TaskId,
        value: T,
        done: Rc<RefCell<Option<Result<(), SendOnClosedChannelError>>>>,
    },
    Select {
        shared: Rc<SelectShared<T>>,
        case: usize,
    },
}

enum RecvWaiter<T> {
    Task {
        task: TaskId,
        slot: Rc<RefCell<Option<Option<T>>>>,
    },
    Select {
        shared: Rc<SelectShared<T>>,
        case: usize,
    },
}

/// Actions that must wait until the channel borrow is released: waking
/// tasks borrows the scheduler core, and deregistering a resolved
/// select borrows the other channels it is registered on.
pub(crate) struct Followups<T> {
    wakes: Vec<(TaskId, WakeCause)>,
    dereg: Vec<Rc<SelectShared<T>>>,
}

impl<T> Followups<T> {
    pub(crate) fn new() -> Self {
        Self {
            wakes: Vec::new(),
            dereg: Vec::new(),
        }
    }

    fn run(self, core: &Weak<Core>) {
        if let Some(core) = core.upgrade() {
            for (task, cause) in self.wakes {
                core.wake(task, cause);
            }
        }
        for shared in self.dereg {
            shared.deregister_all();
        }
    }
}

/// Outcome of a non-blocking receive attempt.
pub(crate) enum TryRecv<T> {
    Value(T),
    Closed,
    NotReady,
}

/// Outcome of a non-blocking send attempt. `Closed` and `Full` hand
/// the undelivered value back.
pub(crate) enum TrySend<T> {
    Done,
    Closed(T),
    Full(T),
}

impl<T> ChanState<T> {
    /// Pop the next receiver that can still accept a value, discarding
    /// select entries whose waiter already committed elsewhere.
    fn pop_live_receiver(&mut self) -> Option<RecvWaiter<T>> {
        while let Some(w) = self.receivers.pop_front() {
            if let RecvWaiter::Select { shared, .. } = &w {
                if shared.is_resolved() {
                    continue;
                }
            }
            return Some(w);
        }
        None
    }

    fn pop_live_sender(&mut self) -> Option<SendWaiter<T>> {
        while let Some(w) = self.senders.pop_front() {
            if let SendWaiter::Select { shared, .. } = &w {
                if shared.is_resolved() {
                    continue;
                }
            }
            return Some(w);
        }
        None
    }

    /// Hand `value` straight to the longest-waiting receiver, skipping
    /// the buffer. `Err(value)` if nobody is waiting.
    fn offer_to_receiver(&mut self, value: T, fx: &mut Followups<T>) -> Result<(), T> {
        match self.pop_live_receiver() {
            Some(RecvWaiter::Task { task, slot }) => {
                *slot.borrow_mut() = Some(Some(value));
                fx.wakes.push((task, WakeCause::ChannelReadable(self.id)));
                Ok(())
            }
            Some(RecvWaiter::Select { shared, case }) => {
                shared.resolve(Ok(Selected {
                    index: case,
                    value: Some(value),
                    ok: true,
                }));
                fx.wakes.push((shared.task(), WakeCause::SelectResolved(self.id)));
                fx.dereg.push(shared);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Take the longest-waiting sender's value and complete its send.
    fn take_from_sender(&mut self, fx: &mut Followups<T>) -> Option<T> {
        match self.pop_live_sender()? {
            SendWaiter::Task { task, value, done } => {
                *done.borrow_mut() = Some(Ok(()));
                fx.wakes.push((task, WakeCause::ChannelWritable(self.id)));
                Some(value)
            }
            SendWaiter::Select { shared, case } => {
                let value = shared.take_send_value(case);
                shared.resolve(Ok(Selected {
                    index: case,
                    value: None,
                    ok: true,
                }));
                fx.wakes.push((shared.task(), WakeCause::SelectResolved(self.id)));
                fx.dereg.push(shared);
                Some(value)
            }
        }
    }

    /// A receive just freed a buffer slot; move the longest-waiting
    /// sender's value into it.
    fn refill_from_sender(&mut self, fx: &mut Followups<T>) {
        if self.buffer.len() >= self.capacity {
            return;
        }
        if let Some(value) = self.take_from_sender(fx) {
            self.buffer.push_back(value);
        }
    }
}

impl<T> Channel<T> {
    pub(crate) fn new(core: Weak<Core>, id: u64, capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChanState {
                core,
                id,
                capacity,
                buffer: VecDeque::new(),
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Deliver `value` into the channel. Completes once the value is
    /// handed to a receiver or buffered; blocks while the buffer is
    /// full (always, at capacity 0, until a receiver arrives).
    pub fn send(&self, value: T) -> SendFuture<T> {
        SendFuture {
            chan: self.clone(),
            value: Some(value),
            done: None,
        }
    }

    /// Take the next value in FIFO order. Blocks while the channel is
    /// open and empty; yields `None` once it is closed and drained.
    pub fn recv(&self) -> RecvFuture<T> {
        RecvFuture {
            chan: self.clone(),
            slot: None,
            finished: false,
        }
    }

    /// Close the channel. Idempotent. Buffered values survive and
    /// drain through later `recv`s; every blocked receiver wakes with
    /// `None` and every blocked sender with the send error, in their
    /// queue order (receivers first).
    pub fn close(&self) {
        let mut fx = Followups::new();
        let core = {
            let mut st = self.inner.borrow_mut();
            if st.closed {
                return;
            }
            st.closed = true;
            while let Some(w) = st.pop_live_receiver() {
                match w {
                    RecvWaiter::Task { task, slot } => {
                        *slot.borrow_mut() = Some(None);
                        fx.wakes.push((task, WakeCause::ChannelClosed(st.id)));
                    }
                    RecvWaiter::Select { shared, case } => {
                        shared.resolve(Ok(Selected {
                            index: case,
                            value: None,
                            ok: false,
                        }));
                        fx.wakes
                            .push((shared.task(), WakeCause::SelectResolved(st.id)));
                        fx.dereg.push(shared);
                    }
                }
            }
            while let Some(w) = st.pop_live_sender() {
                match w {
                    SendWaiter::Task { task, done, value: _value } => {
                        *done.borrow_mut() = Some(Err(SendOnClosedChannelError));
                        fx.wakes.push((task, WakeCause::ChannelClosed(st.id)));
                    }
                    SendWaiter::Select { shared, .. } => {
                        shared.resolve(Err(SendOnClosedChannelError));
                        fx.wakes
                            .push((shared.task(), WakeCause::SelectResolved(st.id)));
                        fx.dereg.push(shared);
                    }
                }
            }
            st.core.clone()
        };
        fx.run(&core);
    }

    /// Receive values one at a time until the channel is closed and
    /// drained, applying `f` to each.
    pub async fn for_each(&self, mut f: impl FnMut(T)) {
        while let Some(value) = self.recv().await {
            f(value);
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub(crate) fn core(&self) -> Weak<Core> {
        self.inner.borrow().core.clone()
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.inner.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Blocked senders, counting each registered select case once and
    /// skipping entries whose select already committed elsewhere.
    pub fn blocked_senders(&self) -> usize {
        self.inner
            .borrow()
            .senders
            .iter()
            .filter(|w| match w {
                SendWaiter::Task { .. } => true,
                SendWaiter::Select { shared, .. } => !shared.is_resolved(),
            })
            .count()
    }

    pub fn blocked_receivers(&self) -> usize {
        self.inner
            .borrow()
            .receivers
            .iter()
            .filter(|w| match w {
                RecvWaiter::Task { .. } => true,
                RecvWaiter::Select { shared, .. } => !shared.is_resolved(),
            })
            .count()
    }

    /// One synchronous receive attempt; never parks.
    pub(crate) fn try_recv_now(&self) -> TryRecv<T> {
        let mut fx = Followups::new();
        let (out, core) = {
            let mut st = self.inner.borrow_mut();
            let out = if let Some(value) = st.buffer.pop_front() {
                st.refill_from_sender(&mut fx);
                TryRecv::Value(value)
            } else if let Some(value) = st.take_from_sender(&mut fx) {
                // Rendezvous: take straight from a blocked sender.
                TryRecv::Value(value)
            } else if st.closed {
                TryRecv::Closed
            } else {
                TryRecv::NotReady
            };
            (out, st.core.clone())
        };
        fx.run(&core);
        out
    }

    /// One synchronous send attempt; never parks.
    pub(crate) fn try_send_now(&self, value: T) -> TrySend<T> {
        let mut fx = Followups::new();
        let (out, core) = {
            let mut st = self.inner.borrow_mut();
            let out = if st.closed {
                TrySend::Closed(value)
            } else {
                match st.offer_to_receiver(value, &mut fx) {
                    Ok(()) => TrySend::Done,
                    Err(value) => {
                        if st.buffer.len() < st.capacity {
                            st.buffer.push_back(value);
                            TrySend::Done
                        } else {
                            TrySend::Full(value)
                        }
                    }
                }
            };
            (out, st.core.clone())
        };
        fx.run(&core);
        out
    }

    fn park_sender(&self, value: T) -> Rc<RefCell<Option<Result<(), SendOnClosedChannelError>>>> {
        let mut st = self.inner.borrow_mut();
        let core = st.core.upgrade().expect("scheduler dropped with channel live");
        let task = core.current_or_panic("send");
        let done = Rc::new(RefCell::new(None));
        st.senders.push_back(SendWaiter::Task {
            task,
            value,
            done: Rc::clone(&done),
        });
        done
    }

    fn park_receiver(&self) -> Rc<RefCell<Option<Option<T>>>> {
        let mut st = self.inner.borrow_mut();
        let core = st.core.upgrade().expect("scheduler dropped with channel live");
        let task = core.current_or_panic("recv");
        let slot = Rc::new(RefCell::new(None));
        st.receivers.push_back(RecvWaiter::Task {
            task,
            slot: Rc::clone(&slot),
        });
        slot
    }

    pub(crate) fn register_select_recv(&self, shared: &Rc<SelectShared<T>>, case: usize) {
        self.inner.borrow_mut().receivers.push_back(RecvWaiter::Select {
            shared: Rc::clone(shared),
            case,
        });
    }

    pub(crate) fn register_select_send(&self, shared: &Rc<SelectShared<T>>, case: usize) {
        self.inner.borrow_mut().senders.push_back(SendWaiter::Select {
            shared: Rc::clone(shared),
            case,
        });
    }

    /// Remove every entry belonging to `shared`, on both queues.
    pub(crate) fn remove_select(&self, shared: &Rc<SelectShared<T>>) {
        let mut st = self.inner.borrow_mut();
        st.senders.retain(|w| match w {
            SendWaiter::Select { shared: s, .. } => !Rc::ptr_eq(s, shared),
            SendWaiter::Task { .. } => true,
        });
        st.receivers.retain(|w| match w {
            RecvWaiter::Select { shared: s, .. } => !Rc::ptr_eq(s, shared),
            RecvWaiter::Task { .. } => true,
        });
    }
}

/// Future returned by [`Channel::send`]. Dropping it while parked
/// withdraws the pending send, value included.
pub struct SendFuture<T> {
    chan: Channel<T>,
    value: Option<T>,
    done: Option<Rc<RefCell<Option<Result<(), SendOnClosedChannelError>>>>>,
}

impl<T> Unpin for SendFuture<T> {}

impl<T> Future for SendFuture<T> {
    type Output = Result<(), SendOnClosedChannelError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(done) = &this.done {
            let taken = done.borrow_mut().take();
            return match taken {
                Some(result) => {
                    this.done = None;
                    Poll::Ready(result)
                }
                None => Poll::Pending,
            };
        }
        let value = this
            .value
            .take()
            .expect("send future polled after completion");
        match this.chan.try_send_now(value) {
            TrySend::Done => Poll::Ready(Ok(())),
            TrySend::Closed(_value) => Poll::Ready(Err(SendOnClosedChannelError)),
            TrySend::Full(value) => {
                this.done = Some(this.chan.park_sender(value));
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for SendFuture<T> {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };
        if done.borrow().is_some() {
            // Completed but never observed; nothing left in the queue.
            return;
        }
        let mut st = self.chan.inner.borrow_mut();
        st.senders.retain(|w| match w {
            SendWaiter::Task { done: d, .. } => !Rc::ptr_eq(d, &done),
            SendWaiter::Select { .. } => true,
        });
    }
}

/// Future returned by [`Channel::recv`]. Dropping it while parked
/// withdraws the waiting receiver.
pub struct RecvFuture<T> {
    chan: Channel<T>,
    slot: Option<Rc<RefCell<Option<Option<T>>>>>,
    finished: bool,
}

impl<T> Future for RecvFuture<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(slot) = &this.slot {
            let taken = slot.borrow_mut().take();
            return match taken {
                Some(result) => {
                    this.slot = None;
                    this.finished = true;
                    Poll::Ready(result)
                }
                None => Poll::Pending,
            };
        }
        assert!(!this.finished, "recv future polled after completion");
        match this.chan.try_recv_now() {
            TryRecv::Value(value) => {
                this.finished = true;
                Poll::Ready(Some(value))
            }
            TryRecv::Closed => {
                this.finished = true;
                Poll::Ready(None)
            }
            TryRecv::NotReady => {
                this.slot = Some(this.chan.park_receiver());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for RecvFuture<T> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if slot.borrow().is_some() {
            return;
        }
        let mut st = self.chan.inner.borrow_mut();
        st.receivers.retain(|w| match w {
            RecvWaiter::Task { slot: s, .. } => !Rc::ptr_eq(s, &slot),
            RecvWaiter::Select { .. } => true,
        });
    }
}
