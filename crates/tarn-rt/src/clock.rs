// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Time-ordered queue of delayed wakeups.
//!
//! Logical time is simulated: the scheduler advances it only when no
//! task is runnable and a delayed wakeup is pending — never from wall
//! time. The current time itself lives in the scheduler core; this
//! module owns the ordering of pending wakeups.

use std::collections::BTreeMap;

use crate::task::TaskId;

/// Pending wakeups keyed by `(wake_at, seq)`. `seq` is the insertion
/// sequence: entries sharing a deadline fire in registration order,
/// which is what keeps "simultaneous" timers deterministic.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<(u64, u64), TaskId>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` to wake at logical time `wake_at`. Returns the
    /// entry's sequence number, needed to cancel it.
    pub fn insert(&mut self, wake_at: u64, task: TaskId) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((wake_at, seq), task);
        seq
    }

    /// Cancel a registered wakeup. No-op if it already fired.
    pub fn remove(&mut self, wake_at: u64, seq: u64) {
        self.entries.remove(&(wake_at, seq));
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.keys().next().map(|&(at, _)| at)
    }

    /// Remove and return every entry at exactly `deadline`, in
    /// registration order.
    pub fn take_due(&mut self, deadline: u64) -> Vec<TaskId> {
        let mut due = Vec::new();
        while let Some((&(at, seq), _)) = self.entries.first_key_value() {
            if at != deadline {
                break;
            }
            let task = self
                .entries
                .remove(&(at, seq))
                .expect("peeked timer entry vanished");
            due.push(task);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u64) -> TaskId {
        TaskId(n)
    }

    #[test]
    fn earliest_deadline_first() {
        let mut q = TimerQueue::new();
        q.insert(30, t(1));
        q.insert(10, t(2));
        q.insert(20, t(3));
        assert_eq!(q.next_deadline(), Some(10));
        assert_eq!(q.take_due(10), vec![t(2)]);
        assert_eq!(q.next_deadline(), Some(20));
    }

    #[test]
    fn equal_deadlines_keep_registration_order() {
        let mut q = TimerQueue::new();
        q.insert(5, t(7));
        q.insert(5, t(3));
        q.insert(5, t(9));
        q.insert(6, t(1));
        assert_eq!(q.take_due(5), vec![t(7), t(3), t(9)]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_cancels_a_single_entry() {
        let mut q = TimerQueue::new();
        let seq_a = q.insert(5, t(1));
        q.insert(5, t(2));
        q.remove(5, seq_a);
        assert_eq!(q.take_due(5), vec![t(2)]);
        assert!(q.is_empty());
    }

    #[test]
    fn remove_after_fire_is_noop() {
        let mut q = TimerQueue::new();
        let seq = q.insert(5, t(1));
        assert_eq!(q.take_due(5), vec![t(1)]);
        q.remove(5, seq);
        assert!(q.is_empty());
    }
}
