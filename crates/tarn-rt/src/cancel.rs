// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation.
//!
//! Cancellation never interrupts a blocked operation; a task observes
//! it by checking its token at suspension points and winding down on
//! its own. Single-threaded runtime, so a `Cell` suffices.

use std::cell::Cell;
use std::rc::Rc;

/// Cloneable cancellation flag. All clones observe the same state.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Rc<Cell<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; never un-set.
    pub fn cancel(&self) {
        self.flag.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.get()
    }
}
