use crate::dispatch::{AffinityContext, WorkItem, background_context};
use crate::source::{FutureHandle, SourceError, Staleness};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Poll, Waker};
use std::time::Instant;
use tracing::{trace, warn};

/// Observable state of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    Pending,
    Completed,
    Faulted,
}

enum Outcome<T> {
    Pending,
    Completed(T),
    Faulted(anyhow::Error),
    /// The terminal outcome was moved out by a handle. Remembers what it was
    /// so that status queries keep answering.
    Consumed(CompletionStatus),
}

impl<T> Outcome<T> {
    fn status(&self) -> CompletionStatus {
        match self {
            Outcome::Pending => CompletionStatus::Pending,
            Outcome::Completed(_) => CompletionStatus::Completed,
            Outcome::Faulted(_) => CompletionStatus::Faulted,
            Outcome::Consumed(status) => *status,
        }
    }
}

struct Slot<T> {
    outcome: Outcome<T>,

    /// Bumped by every reset. Handles are only valid for the version they
    /// captured.
    version: u64,

    /// At most one continuation per cycle, owned by a single awaiter.
    continuation: Option<Continuation>,
}

/// Waker of the last poll, tagged with the handle that registered it.
struct Continuation {
    awaiter: u64,
    waker: Waker,
}

impl<T> Slot<T> {
    fn check(&self, version: u64) -> Result<(), SourceError> {
        if self.version == version {
            Ok(())
        } else {
            Err(SourceError::Stale(Staleness::Reset {
                handle: version,
                current: self.version,
            }))
        }
    }

    /// Moves the terminal outcome out, leaving `Consumed` behind. `None` while
    /// pending. The caller must have checked the version.
    fn take(&mut self) -> Option<Result<T, SourceError>> {
        let status = self.outcome.status();

        match mem::replace(&mut self.outcome, Outcome::Consumed(status)) {
            Outcome::Pending => {
                self.outcome = Outcome::Pending;
                None
            }
            Outcome::Completed(value) => Some(Ok(value)),
            Outcome::Faulted(err) => Some(Err(SourceError::Faulted(err))),
            Outcome::Consumed(status) => {
                self.outcome = Outcome::Consumed(status);
                Some(Err(SourceError::Stale(Staleness::Consumed {
                    version: Some(self.version),
                })))
            }
        }
    }

    /// Registers `awaiter`'s waker. A second handle awaiting the same cycle
    /// while another one is registered is refused, it would never be woken.
    fn register(&mut self, awaiter: u64, waker: &Waker) -> Result<(), SourceError> {
        match &mut self.continuation {
            Some(current) if current.awaiter != awaiter => Err(SourceError::ConcurrentAwait {
                version: self.version,
            }),
            Some(current) if current.waker.will_wake(waker) => Ok(()),
            slot => {
                *slot = Some(Continuation {
                    awaiter,
                    waker: waker.clone(),
                });
                Ok(())
            }
        }
    }

    fn unregister(&mut self, awaiter: u64) {
        if self
            .continuation
            .as_ref()
            .is_some_and(|current| current.awaiter == awaiter)
        {
            self.continuation = None;
        }
    }
}

/// Where a completion invokes the registered continuation.
#[derive(Debug, Clone)]
enum Continuations {
    /// On the completing thread, right after the state transition.
    Inline,

    /// Posted to a dispatcher, so the completing thread never runs the
    /// awaiter's wake-up logic.
    Posted(AffinityContext),
}

impl Continuations {
    fn invoke(&self, waker: Waker) {
        match self {
            Continuations::Inline => waker.wake(),
            Continuations::Posted(ctx) if ctx.is_stopped() => {
                // Posting would silently drop the wake-up and strand the
                // awaiter forever.
                warn!(
                    dispatcher = %ctx.dispatcher_id(),
                    "continuation dispatcher stopped, waking inline"
                );
                waker.wake();
            }
            Continuations::Posted(ctx) => ctx.post(WorkItem::new(move |_| waker.wake())),
        }
    }
}

pub(crate) struct Inner<T> {
    slot: Mutex<Slot<T>>,

    /// Signalled on every completion and reset, for blocking waiters.
    completed: Condvar,

    continuations: Continuations,

    /// Source of awaiter ids, one per handle.
    next_awaiter: AtomicU64,
}

impl<T> Inner<T> {
    pub(super) fn next_awaiter(&self) -> u64 {
        self.next_awaiter.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn status(&self, version: u64) -> Result<CompletionStatus, SourceError> {
        let slot = self.slot.lock();
        slot.check(version)?;
        Ok(slot.outcome.status())
    }

    pub(super) fn poll_take(
        &self,
        version: u64,
        awaiter: u64,
        waker: &Waker,
    ) -> Poll<Result<T, SourceError>> {
        let mut slot = self.slot.lock();

        if let Err(e) = slot.check(version) {
            return Poll::Ready(Err(e));
        }

        match slot.take() {
            Some(res) => Poll::Ready(res),
            None => match slot.register(awaiter, waker) {
                Ok(()) => Poll::Pending,
                Err(e) => Poll::Ready(Err(e)),
            },
        }
    }

    /// Forgets `awaiter`'s continuation, if it is still the registered one.
    pub(super) fn unregister(&self, version: u64, awaiter: u64) {
        let mut slot = self.slot.lock();
        if slot.version == version {
            slot.unregister(awaiter);
        }
    }

    pub(super) fn try_take(&self, version: u64) -> Result<T, SourceError> {
        let mut slot = self.slot.lock();
        slot.check(version)?;
        slot.take()
            .unwrap_or(Err(SourceError::NotCompleted { version }))
    }

    pub(super) fn wait_take(
        &self,
        version: u64,
        deadline: Option<Instant>,
    ) -> Result<T, SourceError> {
        let mut slot = self.slot.lock();

        loop {
            slot.check(version)?;

            if let Some(res) = slot.take() {
                return res;
            }

            match deadline {
                None => self.completed.wait(&mut slot),
                Some(deadline) => {
                    if self.completed.wait_until(&mut slot, deadline).timed_out() {
                        // Last look, the completion may have raced the deadline.
                        slot.check(version)?;
                        return slot.take().unwrap_or(Err(SourceError::TimedOut));
                    }
                }
            }
        }
    }

    fn complete(&self, expected: Option<u64>, outcome: Outcome<T>) -> Result<(), SourceError> {
        let continuation = {
            let mut slot = self.slot.lock();

            if let Some(version) = expected {
                slot.check(version)?;
            }

            if !matches!(slot.outcome, Outcome::Pending) {
                return Err(SourceError::DoubleCompletion {
                    version: slot.version,
                });
            }

            slot.outcome = outcome;
            slot.continuation.take()
        };

        // The transition is visible before anyone is woken. A reset sneaking in
        // between is seen by the woken poll as a version mismatch.
        self.completed.notify_all();

        if let Some(continuation) = continuation {
            self.continuations.invoke(continuation.waker);
        }

        Ok(())
    }

    fn reset(&self) -> u64 {
        let (version, continuation) = {
            let mut slot = self.slot.lock();
            slot.version += 1;
            slot.outcome = Outcome::Pending;
            (slot.version, slot.continuation.take())
        };

        // Anyone still waiting on the previous cycle is woken so it observes
        // `Stale` instead of hanging.
        self.completed.notify_all();

        if let Some(continuation) = continuation {
            trace!(version, awaiter = continuation.awaiter, "reset woke an outstanding awaiter");
            self.continuations.invoke(continuation.waker);
        }

        version
    }
}

/// A single-shot completion that can be reset and reused indefinitely.
///
/// The source is one heap allocation shared by every clone and every
/// [`FutureHandle`] it hands out. Each cycle (the span between two resets)
/// accepts exactly one completion, with a value or an error, and exactly one
/// consumption of that outcome. Handles capture the version of the cycle they
/// were created in and refuse to read any other.
///
/// Resetting is the caller's responsibility and must only happen once every
/// handle of the previous cycle is done with. Breaking that rule is detected
/// and reported as [`SourceError::Stale`], not silently tolerated.
///
/// ```
/// use tether::{ReusableCompletionSource, SourceError};
///
/// let source = ReusableCompletionSource::new();
///
/// let mut first = source.get_handle();
/// source.set_result(42).unwrap();
/// assert_eq!(first.wait().unwrap(), 42);
///
/// source.reset();
/// let mut second = source.get_handle();
/// assert!(matches!(first.wait(), Err(SourceError::Stale(_))));
///
/// source.set_result(43).unwrap();
/// assert_eq!(second.wait().unwrap(), 43);
/// ```
pub struct ReusableCompletionSource<T> {
    inner: Arc<Inner<T>>,
}

impl<T> ReusableCompletionSource<T> {
    /// A source that wakes awaiters inline, on the completing thread.
    pub fn new() -> Self {
        SourceBuilder::new().build()
    }

    fn with_continuations(continuations: Continuations) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    outcome: Outcome::Pending,
                    version: 0,
                    continuation: None,
                }),
                completed: Condvar::new(),
                continuations,
                next_awaiter: AtomicU64::new(0),
            }),
        }
    }

    /// Version of the current cycle.
    pub fn version(&self) -> u64 {
        self.inner.slot.lock().version
    }

    pub fn runs_continuations_asynchronously(&self) -> bool {
        matches!(self.inner.continuations, Continuations::Posted(_))
    }

    /// A handle on the current cycle.
    pub fn get_handle(&self) -> FutureHandle<T> {
        let version = self.version();
        FutureHandle::from_source(Arc::clone(&self.inner), version)
    }

    /// Completes the current cycle with `value` and wakes its awaiter.
    ///
    /// Fails with [`SourceError::DoubleCompletion`] if the cycle already
    /// completed, in which case `value` is dropped and the first outcome kept.
    pub fn set_result(&self, value: T) -> Result<(), SourceError> {
        self.inner.complete(None, Outcome::Completed(value))
    }

    /// Completes the current cycle with an error, delivered to the awaiter as
    /// [`SourceError::Faulted`].
    pub fn set_exception<E>(&self, err: E) -> Result<(), SourceError>
    where
        E: Into<anyhow::Error>,
    {
        self.inner.complete(None, Outcome::Faulted(err.into()))
    }

    /// Like [`set_result`](Self::set_result), but only if the source is still
    /// at `version`. Lets a producer armed during one cycle avoid completing a
    /// later one.
    pub fn try_set_result(&self, version: u64, value: T) -> Result<(), SourceError> {
        self.inner.complete(Some(version), Outcome::Completed(value))
    }

    /// Versioned flavor of [`set_exception`](Self::set_exception).
    pub fn try_set_exception<E>(&self, version: u64, err: E) -> Result<(), SourceError>
    where
        E: Into<anyhow::Error>,
    {
        self.inner.complete(Some(version), Outcome::Faulted(err.into()))
    }

    /// Starts a new cycle: drops any stored outcome, forgets the registered
    /// continuation and bumps the version, invalidating every outstanding
    /// handle. Returns the new version.
    pub fn reset(&self) -> u64 {
        self.inner.reset()
    }

    /// Status of the cycle identified by `version`. Never blocks.
    pub fn get_status(&self, version: u64) -> Result<CompletionStatus, SourceError> {
        self.inner.status(version)
    }
}

impl ReusableCompletionSource<()> {
    /// Starts configuring a source. The value type is picked by
    /// [`SourceBuilder::build`], not by this call.
    pub fn builder() -> SourceBuilder {
        SourceBuilder::new()
    }
}

impl<T> Default for ReusableCompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ReusableCompletionSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ReusableCompletionSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("ReusableCompletionSource")
            .field("version", &slot.version)
            .field("status", &slot.outcome.status())
            .field("continuations", &self.inner.continuations)
            .finish()
    }
}

/// Configures where a [`ReusableCompletionSource`] runs continuations.
#[derive(Debug, Default)]
pub struct SourceBuilder {
    run_continuations_asynchronously: bool,

    context: Option<AffinityContext>,
}

impl SourceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, completing the source posts the awaiter's wake-up to a
    /// dispatcher instead of running it on the completing thread. Without an
    /// explicit [`continuation_context`](Self::continuation_context), a shared
    /// background dispatcher is used.
    pub fn run_continuations_asynchronously(mut self, val: bool) -> Self {
        self.run_continuations_asynchronously = val;
        self
    }

    /// Runs continuations on `ctx`'s worker. Implies
    /// `run_continuations_asynchronously(true)`.
    pub fn continuation_context(mut self, ctx: AffinityContext) -> Self {
        self.run_continuations_asynchronously = true;
        self.context = Some(ctx);
        self
    }

    pub fn build<T>(self) -> ReusableCompletionSource<T> {
        let continuations = match (self.run_continuations_asynchronously, self.context) {
            (false, _) => Continuations::Inline,
            (true, Some(ctx)) => Continuations::Posted(ctx),
            (true, None) => match background_context() {
                Some(ctx) => Continuations::Posted(ctx),
                None => {
                    warn!("no background dispatcher available, continuations run inline");
                    Continuations::Inline
                }
            },
        };

        ReusableCompletionSource::with_continuations(continuations)
    }
}
