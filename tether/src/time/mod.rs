//! Deferred completions.
//!
//! [`Timer`] runs callbacks on a background thread after a delay.
//! [`DelayOperation`] uses it to complete a
//! [`ReusableCompletionSource`](crate::ReusableCompletionSource) once per
//! cycle.

pub mod delay;
pub use delay::DelayOperation;

pub mod timer;
pub use timer::{Timer, TimerEntry};
