use crate::dispatch::{DispatchError, Post, WorkItem, WorkerContext};
use crate::source::{FutureHandle, ReusableCompletionSource};
use crate::utils::{ScopeGuard, panic_message};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use tracing::{trace, warn};

/// Runs closures and futures on the worker behind a [`Post`] implementation.
///
/// Every wake-up of a spawned future re-posts its poll, so the future's
/// continuations all run on the worker thread no matter which thread completed
/// what it was awaiting.
///
/// ```
/// use tether::{CancellationToken, WorkQueueDispatcher};
///
/// # fn main() -> anyhow::Result<()> {
/// let dispatcher = WorkQueueDispatcher::new(CancellationToken::new())?;
/// let scheduler = dispatcher.task_scheduler();
///
/// let mut handle = scheduler.spawn(|ctx| ctx.executed() + 40);
/// assert_eq!(handle.wait()?, 40);
///
/// let mut handle = scheduler.spawn_future(async { 2 });
/// assert_eq!(handle.wait()?, 2);
/// # Ok(())
/// # }
/// ```
pub struct TaskScheduler<P: Post> {
    poster: Arc<P>,
}

impl<P: Post> TaskScheduler<P> {
    pub fn new(poster: P) -> Self {
        Self {
            poster: Arc::new(poster),
        }
    }

    /// Runs `f` on the worker and delivers its return value through the
    /// returned handle.
    pub fn spawn<F, R>(&self, f: F) -> FutureHandle<R>
    where
        F: FnOnce(&WorkerContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let source = ReusableCompletionSource::new();
        let handle = source.get_handle();
        let mut guard = abandon_guard(source.clone());

        self.poster.post(WorkItem::new(move |ctx| {
            let res = panic::catch_unwind(AssertUnwindSafe(|| f(ctx)));
            guard.disarm();
            complete(&source, res.map_err(|payload| panic_message(&*payload)));
        }));

        handle
    }

    /// Drives `fut` to completion on the worker.
    ///
    /// A future that never completes and whose waker is never invoked again
    /// is leaked together with its handle's source.
    pub fn spawn_future<Fut>(&self, fut: Fut) -> FutureHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let source = ReusableCompletionSource::new();
        let handle = source.get_handle();
        let mut guard = abandon_guard(source.clone());

        let fut = async move {
            let res = AssertUnwindSafe(fut).catch_unwind().await;
            guard.disarm();
            complete(&source, res.map_err(|payload| panic_message(&*payload)));
        };

        Task::schedule(Arc::new(Task {
            future: Mutex::new(Some(fut.boxed())),
            poster: Arc::clone(&self.poster),
            scheduled: AtomicBool::new(true),
        }));

        handle
    }
}

impl<P: Post> Clone for TaskScheduler<P> {
    fn clone(&self) -> Self {
        Self {
            poster: Arc::clone(&self.poster),
        }
    }
}

impl<P: Post + fmt::Debug> fmt::Debug for TaskScheduler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("poster", &self.poster)
            .finish()
    }
}

fn complete<R>(source: &ReusableCompletionSource<R>, res: Result<R, String>) {
    let res = match res {
        Ok(value) => source.set_result(value),
        Err(reason) => {
            warn!(%reason, "spawned task panicked");
            source.set_exception(DispatchError::TaskPanicked(reason))
        }
    };

    // The source is private to this task, it can't have been completed twice.
    debug_assert!(res.is_ok());
}

/// Faults `source` with `Abandoned` if dropped armed, i.e. if the work that
/// owns it is dropped without ever running to completion.
fn abandon_guard<R>(source: ReusableCompletionSource<R>) -> ScopeGuard<impl FnOnce()> {
    ScopeGuard::new(move || {
        warn!("task dropped before completing, faulting its handle");
        let _ = source.set_exception(DispatchError::Abandoned);
    })
}

/// A spawned future together with the means to poll it again on its worker.
struct Task<P: Post> {
    /// `None` once the future completed.
    future: Mutex<Option<BoxFuture<'static, ()>>>,

    poster: Arc<P>,

    /// A poll is already queued. Coalesces wake-ups that arrive before the
    /// worker gets to it.
    scheduled: AtomicBool,
}

impl<P: Post> Task<P> {
    fn schedule(self: Arc<Self>) {
        let poster = Arc::clone(&self.poster);
        poster.post(WorkItem::new(move |_| self.run()));
    }

    fn run(self: Arc<Self>) {
        self.scheduled.store(false, Ordering::Release);

        let mut slot = self.future.lock();
        let Some(fut) = slot.as_mut() else {
            trace!("spurious wake-up of a completed task");
            return;
        };

        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);

        if let Poll::Ready(()) = fut.as_mut().poll(&mut cx) {
            *slot = None;
        }
    }
}

impl<P: Post> Wake for Task<P> {
    fn wake(self: Arc<Self>) {
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            self.schedule();
        }
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Arc::clone(self).wake();
    }
}
