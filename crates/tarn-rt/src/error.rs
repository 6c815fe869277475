// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error taxonomy.
//!
//! Closed+drained `recv` is not an error — it is the expected terminal
//! condition for consumers and surfaces as `None`. Misuse (blocking
//! operations outside a task, double-resolved selects) panics instead:
//! those are programming bugs, not runtime conditions.

use thiserror::Error;

/// Raised when `send` targets a closed channel, or when a pending
/// send's channel is closed before the send is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("send on closed channel")]
pub struct SendOnClosedChannelError;

/// Why a task failed. Surfaced to whoever awaits the task's handle;
/// never aborts the scheduler or the other tasks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task body panicked with the given message.
    #[error("task panicked: {0}")]
    Panicked(String),
}
