// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-way select over channel operations.
//!
//! `select` resolves to exactly one of its cases. Readiness is checked
//! synchronously in case order first — the priority pass — and only if
//! nothing is ready does the task register a single shared waiter on
//! every participating channel and block. The first channel operation
//! to satisfy a registered case commits it; commitment is exactly-once
//! and eagerly deregisters the waiter everywhere else.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::channel::{Channel, TryRecv, TrySend};
use crate::error::SendOnClosedChannelError;
use crate::task::TaskId;

/// The committed case of a `select`.
#[derive(Debug, PartialEq, Eq)]
pub struct Selected<T> {
    /// Position of the committed case in the original case list.
    pub index: usize,
    /// The received value for a recv case; `None` for send cases and
    /// for a recv case that resolved on a closed channel.
    pub value: Option<T>,
    /// `false` only when a recv case resolved because its channel was
    /// closed and drained.
    pub ok: bool,
}

enum CaseOp<T> {
    Recv,
    Send(Option<T>),
}

/// One arm of a `select`: a pending receive or a pending send.
pub struct Case<T> {
    channel: Channel<T>,
    op: CaseOp<T>,
}

impl<T> Case<T> {
    pub fn recv(channel: &Channel<T>) -> Self {
        Self {
            channel: channel.clone(),
            op: CaseOp::Recv,
        }
    }

    pub fn send(channel: &Channel<T>, value: T) -> Self {
        Self {
            channel: channel.clone(),
            op: CaseOp::Send(Some(value)),
        }
    }
}

/// Waiter shared by all of one select's registrations. Channels hold
/// it in their waiter queues; commitment flips `resolved` exactly once.
pub(crate) struct SelectShared<T> {
    task: TaskId,
    resolved: Cell<bool>,
    outcome: RefCell<Option<Result<Selected<T>, SendOnClosedChannelError>>>,
    /// Pending send values, indexed by case. Taken by the channel that
    /// commits the corresponding send case.
    send_values: RefCell<Vec<Option<T>>>,
    /// Channels this waiter is registered on, in registration order.
    registered: RefCell<Vec<Channel<T>>>,
}

impl<T> SelectShared<T> {
    pub(crate) fn task(&self) -> TaskId {
        self.task
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved.get()
    }

    /// Commit the select. Exactly-once: a second commitment is a bug
    /// in the deregistration bookkeeping and fails loudly.
    pub(crate) fn resolve(&self, outcome: Result<Selected<T>, SendOnClosedChannelError>) {
        assert!(!self.resolved.get(), "select waiter resolved twice");
        self.resolved.set(true);
        *self.outcome.borrow_mut() = Some(outcome);
    }

    pub(crate) fn take_send_value(&self, case: usize) -> T {
        self.send_values.borrow_mut()[case]
            .take()
            .expect("committed send case has no pending value")
    }

    /// Drop every registration. Callers must not hold any channel
    /// borrow; each removal borrows that channel's state.
    pub(crate) fn deregister_all(self: &Rc<Self>) {
        let channels: Vec<_> = self.registered.borrow_mut().drain(..).collect();
        for ch in channels {
            ch.remove_select(self);
        }
    }
}

/// Wait on several channel operations at once; exactly one commits.
///
/// Panics on an empty case list, and when blocking is required outside
/// a running task.
pub fn select<T>(cases: Vec<Case<T>>) -> SelectFuture<T> {
    assert!(!cases.is_empty(), "select over zero cases");
    SelectFuture {
        cases: Some(cases),
        shared: None,
    }
}

/// Future returned by [`select`]. Dropping it unresolved deregisters
/// from every channel.
pub struct SelectFuture<T> {
    cases: Option<Vec<Case<T>>>,
    shared: Option<Rc<SelectShared<T>>>,
}

impl<T> Unpin for SelectFuture<T> {}

impl<T> Future for SelectFuture<T> {
    type Output = Result<Selected<T>, SendOnClosedChannelError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(shared) = &this.shared {
            let taken = shared.outcome.borrow_mut().take();
            return match taken {
                Some(result) => {
                    this.shared = None;
                    Poll::Ready(result)
                }
                None => Poll::Pending,
            };
        }
        let mut cases = this
            .cases
            .take()
            .expect("select future polled after completion");

        // Priority pass: first ready case in caller order wins.
        for (index, case) in cases.iter_mut().enumerate() {
            match &mut case.op {
                CaseOp::Recv => match case.channel.try_recv_now() {
                    TryRecv::Value(value) => {
                        return Poll::Ready(Ok(Selected {
                            index,
                            value: Some(value),
                            ok: true,
                        }))
                    }
                    TryRecv::Closed => {
                        return Poll::Ready(Ok(Selected {
                            index,
                            value: None,
                            ok: false,
                        }))
                    }
                    TryRecv::NotReady => {}
                },
                CaseOp::Send(slot) => {
                    let value = slot.take().expect("send case has no value");
                    match case.channel.try_send_now(value) {
                        TrySend::Done => {
                            return Poll::Ready(Ok(Selected {
                                index,
                                value: None,
                                ok: true,
                            }))
                        }
                        TrySend::Closed(_value) => {
                            return Poll::Ready(Err(SendOnClosedChannelError))
                        }
                        TrySend::Full(value) => *slot = Some(value),
                    }
                }
            }
        }

        // Nothing ready: register one shared waiter on every channel,
        // in case order, then block.
        let core = cases[0]
            .channel
            .core()
            .upgrade()
            .expect("scheduler dropped mid-select");
        let task = core.current_or_panic("select");
        let send_values = cases
            .iter_mut()
            .map(|case| match &mut case.op {
                CaseOp::Send(slot) => slot.take(),
                CaseOp::Recv => None,
            })
            .collect();
        let shared = Rc::new(SelectShared {
            task,
            resolved: Cell::new(false),
            outcome: RefCell::new(None),
            send_values: RefCell::new(send_values),
            registered: RefCell::new(Vec::with_capacity(cases.len())),
        });
        for (index, case) in cases.iter().enumerate() {
            match &case.op {
                CaseOp::Recv => case.channel.register_select_recv(&shared, index),
                CaseOp::Send(_) => case.channel.register_select_send(&shared, index),
            }
            shared.registered.borrow_mut().push(case.channel.clone());
        }
        this.shared = Some(shared);
        Poll::Pending
    }
}

impl<T> Drop for SelectFuture<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            if !shared.is_resolved() {
                shared.deregister_all();
            }
        }
    }
}
