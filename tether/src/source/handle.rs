use crate::source::core::Inner;
use crate::source::{CompletionStatus, SourceError, Staleness};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

enum State<T> {
    /// Created already completed. Never touches a source.
    Ready(Option<T>),

    Source {
        inner: Arc<Inner<T>>,
        version: u64,
        /// Identifies this handle (clones get their own) in the continuation
        /// slot.
        awaiter: u64,
    },
}

/// An awaitable view of one cycle of a
/// [`ReusableCompletionSource`](crate::ReusableCompletionSource).
///
/// The handle remembers the version it was created at. Every read checks it
/// against the source, so a handle that outlives a reset fails with
/// [`SourceError::Stale`] instead of observing someone else's result.
///
/// The outcome can be obtained exactly once per cycle, through any of
/// `.await`, [`wait`](Self::wait), [`wait_timeout`](Self::wait_timeout) or
/// [`try_get_result`](Self::try_get_result). Later attempts, from this handle
/// or a clone, fail with [`Staleness::Consumed`]. Awaiting a cycle from two
/// clones at once fails the second one with [`SourceError::ConcurrentAwait`].
pub struct FutureHandle<T> {
    state: State<T>,
}

impl<T> FutureHandle<T> {
    /// A handle that is already completed with `value`.
    pub fn ready(value: T) -> Self {
        Self {
            state: State::Ready(Some(value)),
        }
    }

    pub(crate) fn from_source(inner: Arc<Inner<T>>, version: u64) -> Self {
        let awaiter = inner.next_awaiter();
        Self {
            state: State::Source {
                inner,
                version,
                awaiter,
            },
        }
    }

    /// The version this handle is bound to, `None` for ready handles.
    pub fn version(&self) -> Option<u64> {
        match &self.state {
            State::Ready(_) => None,
            State::Source { version, .. } => Some(*version),
        }
    }

    pub fn get_status(&self) -> Result<CompletionStatus, SourceError> {
        match &self.state {
            State::Ready(_) => Ok(CompletionStatus::Completed),
            State::Source { inner, version, .. } => inner.status(*version),
        }
    }

    /// Whether the outcome is available (or was already taken). Stale handles
    /// report `true`: reading them won't block.
    pub fn is_ready(&self) -> bool {
        !matches!(self.get_status(), Ok(CompletionStatus::Pending))
    }

    /// Takes the outcome without blocking. Fails with
    /// [`SourceError::NotCompleted`] while the cycle is pending, in which case
    /// the handle stays usable.
    pub fn try_get_result(&mut self) -> Result<T, SourceError> {
        match &mut self.state {
            State::Ready(value) => value.take().ok_or_else(consumed_ready),
            State::Source { inner, version, .. } => inner.try_take(*version),
        }
    }

    /// Blocks the calling thread until the cycle completes, then takes the
    /// outcome.
    ///
    /// Must not be called from the thread expected to complete the source,
    /// e.g. from a work item when the producer was posted to the same
    /// dispatcher.
    pub fn wait(&mut self) -> Result<T, SourceError> {
        match &mut self.state {
            State::Ready(value) => value.take().ok_or_else(consumed_ready),
            State::Source { inner, version, .. } => inner.wait_take(*version, None),
        }
    }

    /// Like [`wait`](Self::wait), bounded by `timeout`. On
    /// [`SourceError::TimedOut`] the handle stays usable.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<T, SourceError> {
        match &mut self.state {
            State::Ready(value) => value.take().ok_or_else(consumed_ready),
            State::Source { inner, version, .. } => {
                // Overflowing deadlines wait forever.
                let deadline = Instant::now().checked_add(timeout);
                inner.wait_take(*version, deadline)
            }
        }
    }
}

fn consumed_ready() -> SourceError {
    SourceError::Stale(Staleness::Consumed { version: None })
}

impl<T> Future for FutureHandle<T> {
    type Output = Result<T, SourceError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            State::Ready(value) => Poll::Ready(value.take().ok_or_else(consumed_ready)),
            State::Source {
                inner,
                version,
                awaiter,
            } => inner.poll_take(*version, *awaiter, cx.waker()),
        }
    }
}

// The outcome lives behind the `Arc` or in an `Option` that is only ever
// moved out of, nothing is pinned.
impl<T> Unpin for FutureHandle<T> {}

impl<T> Drop for FutureHandle<T> {
    fn drop(&mut self) {
        // A handle dropped mid-await must not keep other handles of its cycle
        // from awaiting.
        if let State::Source {
            inner,
            version,
            awaiter,
        } = &self.state
        {
            inner.unregister(*version, *awaiter);
        }
    }
}

impl<T: Clone> Clone for FutureHandle<T> {
    fn clone(&self) -> Self {
        let state = match &self.state {
            State::Ready(value) => State::Ready(value.clone()),
            State::Source { inner, version, .. } => State::Source {
                inner: Arc::clone(inner),
                version: *version,
                awaiter: inner.next_awaiter(),
            },
        };

        Self { state }
    }
}

impl<T> fmt::Debug for FutureHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Ready(value) => f
                .debug_struct("FutureHandle")
                .field("ready", &value.is_some())
                .finish(),
            State::Source { version, .. } => f
                .debug_struct("FutureHandle")
                .field("version", version)
                .field("status", &self.get_status().ok())
                .finish(),
        }
    }
}
