//! Reusable single-shot completions.
//!
//! A [`ReusableCompletionSource`] stands in for the allocation a one-off
//! promise would cost on every operation: the producer completes it, the
//! consumer takes the outcome through a [`FutureHandle`], and the owner
//! [`reset`](ReusableCompletionSource::reset)s it for the next operation.
//! Versions make misuse of the reuse protocol observable.

// Public API
pub mod core;
pub use self::core::{CompletionStatus, ReusableCompletionSource, SourceBuilder};

pub mod errors;
pub use errors::{SourceError, Staleness};

pub mod handle;
pub use handle::FutureHandle;
