// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deterministic concurrency runtime.
//!
//! A single-threaded cooperative scheduler with simulated logical
//! time, CSP-style bounded channels, and multi-way select. The same
//! program produces the same interleaving on every run: scheduling is
//! a FIFO ready queue, timers fire in registration order at each
//! deadline, and channels serve their waiters first-come first-served.
//!
//! ```
//! use tarn_rt::Scheduler;
//!
//! let sched = Scheduler::new();
//! let ch = sched.channel::<u32>(0);
//! let tx = ch.clone();
//! sched.spawn(async move {
//!     tx.send(42).await.unwrap();
//! });
//! let got = sched.run_until(async move { ch.recv().await }).unwrap();
//! assert_eq!(got, Some(42));
//! ```

pub mod cancel;
pub mod channel;
pub mod clock;
pub mod error;
pub mod sched;
pub mod select;
pub mod task;

pub use cancel::CancelToken;
pub use channel::{Channel, RecvFuture, SendFuture};
pub use error::{SendOnClosedChannelError, TaskError};
pub use sched::{Scheduler, Sleep};
pub use select::{select, Case, Selected, SelectFuture};
pub use task::{TaskHandle, TaskId, TaskState, WakeCause};
