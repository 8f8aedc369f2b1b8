use std::fmt;

/// Why a handle can no longer observe its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// The source was reset since the handle was created. Whatever the source
    /// holds now belongs to another logical operation.
    Reset { handle: u64, current: u64 },

    /// The outcome of this cycle was already taken. `version` is `None` for
    /// handles created with [`FutureHandle::ready`](crate::FutureHandle::ready).
    Consumed { version: Option<u64> },
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Staleness::Reset { handle, current } => write!(
                f,
                "handle captured version {} but the source is at version {}",
                handle, current
            ),
            Staleness::Consumed { version: Some(v) } => {
                write!(f, "result of version {} was already consumed", v)
            }
            Staleness::Consumed { version: None } => {
                write!(f, "ready result was already consumed")
            }
        }
    }
}

/// Errors returned by [`ReusableCompletionSource`](crate::ReusableCompletionSource)
/// and [`FutureHandle`](crate::FutureHandle).
///
/// Misuse of the reuse protocol (`DoubleCompletion`, `Stale`) is always
/// reported, never recovered from internally.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// `set_result` / `set_exception` called twice in one cycle. The first
    /// outcome is kept.
    #[error("completion source already completed in version {version}")]
    DoubleCompletion { version: u64 },

    #[error("stale handle: {0}")]
    Stale(Staleness),

    /// Another handle of the same cycle is already awaiting it. A cycle has a
    /// single continuation slot.
    #[error("version {version} is already awaited by another handle")]
    ConcurrentAwait { version: u64 },

    /// A non-blocking read found the cycle still pending.
    #[error("version {version} has not completed yet")]
    NotCompleted { version: u64 },

    /// A bounded wait elapsed. The handle is still usable.
    #[error("timed out waiting for completion")]
    TimedOut,

    /// The producer completed the cycle with `set_exception`.
    #[error(transparent)]
    Faulted(anyhow::Error),
}

impl SourceError {
    pub fn is_stale(&self) -> bool {
        matches!(self, SourceError::Stale(_))
    }

    pub fn is_double_completion(&self) -> bool {
        matches!(self, SourceError::DoubleCompletion { .. })
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, SourceError::Faulted(_))
    }

    /// The producer's error, if this is a fault.
    pub fn into_fault(self) -> Option<anyhow::Error> {
        match self {
            SourceError::Faulted(e) => Some(e),
            _ => None,
        }
    }
}

impl PartialEq for SourceError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::DoubleCompletion { version: a }, Self::DoubleCompletion { version: b }) => a == b,
            (Self::Stale(a), Self::Stale(b)) => a == b,
            (Self::ConcurrentAwait { version: a }, Self::ConcurrentAwait { version: b }) => a == b,
            (Self::NotCompleted { version: a }, Self::NotCompleted { version: b }) => a == b,
            (Self::TimedOut, Self::TimedOut) => true,
            (Self::Faulted(a), Self::Faulted(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}
