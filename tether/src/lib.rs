//! Thread affinity and allocation-free completions.
//!
//! `tether` provides two small concurrency primitives:
//!
//! - [`WorkQueueDispatcher`]: an unbounded multi-producer queue drained by a
//!   single dedicated worker thread. Its [`AffinityContext`] lets any thread
//!   hand continuations back to that worker, and [`TaskScheduler`] drives
//!   futures whose every wake-up resumes on it.
//! - [`ReusableCompletionSource`]: one heap allocation that can be completed
//!   once per cycle, reset, and completed again. [`FutureHandle`]s capture the
//!   cycle's version so that a handle from an earlier cycle is rejected instead
//!   of reading someone else's result.
//!
//! [`DelayOperation`] ties the second primitive to a [`Timer`].

pub mod dispatch;
pub use dispatch::{
    AffinityContext, Builder, DispatchError, DispatcherId, IdleStrategy, OnPanic, Post,
    TaskScheduler, WorkItem, WorkQueueDispatcher, WorkerContext,
};

pub mod source;
pub use source::{
    CompletionStatus, FutureHandle, ReusableCompletionSource, SourceBuilder, SourceError,
    Staleness,
};

pub mod time;
pub use time::{DelayOperation, Timer, TimerEntry};

#[doc(no_inline)]
pub use tokio_util::sync::CancellationToken;

mod utils;

#[cfg(test)]
mod test_utils;
