use crate::dispatch::{
    Builder, DispatcherId, OnPanic, Post, Shared, TaskScheduler, WorkItem, WorkQueueDispatcher,
    WorkerContext,
};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Posting façade over a [`WorkQueueDispatcher`].
///
/// Any code holding an `AffinityContext` can guarantee that a continuation
/// runs on the dispatcher's single worker thread, never concurrently with
/// another continuation posted through the same dispatcher. Contexts are cheap
/// to clone and do not keep the worker alive: once the dispatcher stops, posts
/// are accepted and dropped.
#[derive(Clone)]
pub struct AffinityContext {
    shared: Arc<Shared>,
}

impl AffinityContext {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Schedules `item` to run on the worker thread.
    pub fn post(&self, item: WorkItem) {
        self.shared.enqueue(item);
    }

    /// Same as [`post`](Self::post). There is no synchronous flavor: the
    /// caller never waits for the item to run.
    pub fn send(&self, item: WorkItem) {
        self.post(item);
    }

    pub fn post_fn<F>(&self, f: F)
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        self.post(WorkItem::new(f));
    }

    /// Whether the calling thread is this context's worker.
    pub fn is_current(&self) -> bool {
        self.shared.is_worker_thread()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    pub fn dispatcher_id(&self) -> DispatcherId {
        self.shared.id
    }

    pub fn task_scheduler(&self) -> TaskScheduler<AffinityContext> {
        TaskScheduler::new(self.clone())
    }
}

impl Post for AffinityContext {
    fn post(&self, item: WorkItem) {
        AffinityContext::post(self, item);
    }
}

impl PartialEq for AffinityContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for AffinityContext {}

impl fmt::Debug for AffinityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AffinityContext")
            .field("dispatcher", &self.shared.id)
            .field("stopped", &self.shared.is_stopped())
            .finish()
    }
}

/// Process-wide dispatcher used to run continuations asynchronously when the
/// caller did not provide a context of its own. Spawned on first use and never
/// stopped. `None` if the worker thread could not be spawned.
pub(crate) fn background_context() -> Option<AffinityContext> {
    static BACKGROUND: OnceLock<Option<WorkQueueDispatcher>> = OnceLock::new();

    BACKGROUND
        .get_or_init(|| {
            Builder::new()
                .thread_name("tether-continuations")
                .on_panic(OnPanic::LogAndContinue)
                .try_build(CancellationToken::new())
                .inspect_err(|e| warn!(error = %e, "failed to spawn continuation dispatcher"))
                .ok()
        })
        .as_ref()
        .map(WorkQueueDispatcher::context)
}
