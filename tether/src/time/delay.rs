use crate::source::{CompletionStatus, FutureHandle, ReusableCompletionSource};
use crate::time::{Timer, TimerEntry};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tracing::trace;

/// A resettable "complete with this value after that long".
///
/// Each cycle arms the timer once and hands out a handle on the underlying
/// [`ReusableCompletionSource`]. A zero delay short-circuits to a ready handle
/// and leaves the source untouched.
///
/// ```
/// use std::time::Duration;
/// use tether::DelayOperation;
///
/// # fn main() -> anyhow::Result<()> {
/// let delay = DelayOperation::new()?;
///
/// let mut handle = delay.schedule(Duration::from_millis(10), "tick");
/// assert_eq!(handle.wait()?, "tick");
///
/// delay.reset();
/// let mut handle = delay.schedule(Duration::from_millis(10), "tock");
/// assert_eq!(handle.wait()?, "tock");
/// # Ok(())
/// # }
/// ```
pub struct DelayOperation<T> {
    source: ReusableCompletionSource<T>,

    timer: Timer,

    /// Trigger armed in the current cycle, if any.
    pending: Mutex<Option<TimerEntry>>,
}

impl<T: Send + 'static> DelayOperation<T> {
    /// Uses the process-wide shared timer.
    pub fn new() -> Result<Self> {
        let timer = Timer::shared().ok_or_else(|| anyhow!("shared timer is unavailable"))?;
        Ok(Self::with_timer(timer))
    }

    pub fn with_timer(timer: Timer) -> Self {
        Self::with_source(timer, ReusableCompletionSource::new())
    }

    /// Completes through `source`, e.g. one that runs continuations
    /// asynchronously.
    pub fn with_source(timer: Timer, source: ReusableCompletionSource<T>) -> Self {
        Self {
            source,
            timer,
            pending: Mutex::new(None),
        }
    }

    /// Arms the timer to complete the current cycle with `value` once
    /// `duration` elapsed, and returns a handle on it.
    ///
    /// Scheduling again within the same cycle replaces the pending trigger.
    /// If the previous one already fired, the cycle keeps its first value.
    pub fn schedule(&self, duration: Duration, value: T) -> FutureHandle<T> {
        if duration.is_zero() {
            return FutureHandle::ready(value);
        }

        let handle = self.source.get_handle();
        let Some(version) = handle.version() else {
            return handle;
        };

        let source = self.source.clone();
        let entry = self.timer.schedule(duration, move || {
            // Versioned, so a trigger that fires while a reset races its
            // cancellation can't complete the next cycle.
            if let Err(e) = source.try_set_result(version, value) {
                trace!(version, error = %e, "delay fired into a finished cycle");
            }
        });

        if let Some(previous) = self.pending.lock().replace(entry) {
            previous.cancel();
        }

        handle
    }

    /// Cancels the pending trigger and starts a new cycle. Returns the new
    /// version.
    pub fn reset(&self) -> u64 {
        if let Some(entry) = self.pending.lock().take() {
            entry.cancel();
        }

        self.source.reset()
    }

    pub fn version(&self) -> u64 {
        self.source.version()
    }

    /// Whether a trigger armed in this cycle has not fired yet.
    pub fn is_armed(&self) -> bool {
        let pending = self.pending.lock();
        pending.is_some()
            && self
                .source
                .get_status(self.version())
                .is_ok_and(|status| status == CompletionStatus::Pending)
    }
}

impl<T> fmt::Debug for DelayOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayOperation")
            .field("source", &self.source)
            .field("timer", &self.timer)
            .finish()
    }
}
