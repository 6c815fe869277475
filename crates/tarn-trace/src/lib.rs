// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Execution-trace recording and determinism checking.
//!
//! A [`Trace`] is a cheap-clone recorder of ordered events. Its hash
//! is a SHA-256 digest over the canonical JSON serialization of the
//! event list, so two runs hash equal exactly when they produced the
//! same events in the same order. [`check_repeated`] runs a program
//! several times and insists on byte-identical traces.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// One recorded step of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// Position in the trace, assigned at record time.
    pub seq: u64,
    pub label: String,
}

/// Ordered event recorder. Clones share the same underlying trace, so
/// every task in a program can append to one recorder.
#[derive(Clone, Default)]
pub struct Trace {
    events: Rc<RefCell<Vec<Event>>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event. Order of calls is the order of the trace.
    pub fn record(&self, label: impl Into<String>) {
        let mut events = self.events.borrow_mut();
        let seq = events.len() as u64;
        events.push(Event {
            seq,
            label: label.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    /// Just the labels, for compact assertions in tests.
    pub fn labels(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .map(|e| e.label.clone())
            .collect()
    }

    /// `sha256:<hex>` digest over the serialized event list.
    pub fn hash(&self) -> String {
        let bytes =
            serde_json::to_vec(&*self.events.borrow()).expect("trace events always serialize");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("sha256:{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeterminismError {
    #[error("run {run} diverged: expected {expected}, got {actual}")]
    HashMismatch {
        run: usize,
        expected: String,
        actual: String,
    },
}

/// Execute `f` against `runs` fresh recorders and require every run to
/// hash identically. Returns the common hash.
pub fn check_repeated(
    runs: usize,
    mut f: impl FnMut(&Trace),
) -> Result<String, DeterminismError> {
    assert!(runs > 0, "check_repeated needs at least one run");
    let mut expected: Option<String> = None;
    for run in 0..runs {
        let trace = Trace::new();
        f(&trace);
        let actual = trace.hash();
        match &expected {
            None => expected = Some(actual),
            Some(e) if *e == actual => {}
            Some(e) => {
                return Err(DeterminismError::HashMismatch {
                    run,
                    expected: e.clone(),
                    actual,
                })
            }
        }
    }
    Ok(expected.expect("runs > 0"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_traces_hash_identically() {
        let a = Trace::new();
        let b = Trace::new();
        for t in [&a, &b] {
            t.record("start");
            t.record("stop");
        }
        assert_eq!(a.hash(), b.hash());
        assert!(a.hash().starts_with("sha256:"));
    }

    #[test]
    fn order_changes_the_hash() {
        let a = Trace::new();
        a.record("x");
        a.record("y");
        let b = Trace::new();
        b.record("y");
        b.record("x");
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn clones_append_to_the_same_trace() {
        let trace = Trace::new();
        let alias = trace.clone();
        trace.record("one");
        alias.record("two");
        assert_eq!(trace.labels(), vec!["one", "two"]);
        assert_eq!(trace.events()[1].seq, 1);
    }

    #[test]
    fn check_repeated_accepts_a_stable_program() {
        let hash = check_repeated(10, |t| {
            t.record("a");
            t.record("b");
        })
        .unwrap();
        assert!(hash.starts_with("sha256:"));
    }

    #[test]
    fn check_repeated_reports_the_diverging_run() {
        let mut n = 0;
        let err = check_repeated(5, |t| {
            t.record(if n < 4 { "steady" } else { "diverged" });
            n += 1;
        })
        .unwrap_err();
        match err {
            DeterminismError::HashMismatch { run, .. } => assert_eq!(run, 4),
        }
    }
}
