use crate::dispatch::worker::spawn_worker_thread;
use crate::dispatch::{
    AffinityContext, Builder, DispatchError, DispatcherConfig, Post, TaskScheduler, WorkItem,
};
use anyhow::Result;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroU64;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// An opaque ID that uniquely identifies a dispatcher within the process.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct DispatcherId(NonZeroU64);

impl DispatcherId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique dispatcher ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// State shared between the dispatcher, its contexts and its worker thread.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) id: DispatcherId,

    pub(crate) cfg: DispatcherConfig,

    /// Unbounded MPMC queue, only ever popped by the worker.
    pub(crate) queue: SegQueue<WorkItem>,

    /// Child of the token the dispatcher was created with: cancelling the
    /// parent stops us, `request_stop` never cancels the parent.
    pub(crate) cancel: CancellationToken,

    /// Worker thread, used to unpark it. Set right after spawning.
    pub(crate) worker: OnceLock<Thread>,

    /// A work item panicked and `OnPanic::Stop` ended the worker.
    pub(crate) panicked: AtomicBool,
}

impl Shared {
    pub(crate) fn new(cfg: DispatcherConfig, cancel: &CancellationToken) -> Self {
        Self {
            id: DispatcherId::next(),
            cfg,
            queue: SegQueue::new(),
            cancel: cancel.child_token(),
            worker: OnceLock::new(),
            panicked: AtomicBool::new(false),
        }
    }

    pub(crate) fn enqueue(&self, item: WorkItem) {
        // Stopped dispatchers accept and drop.
        if self.is_stopped() {
            trace!(dispatcher = %self.id, "dropping work item posted after stop");
            return;
        }

        self.queue.push(item);
        // Pairs with the fence in `abandon_queued`: either we see the stop or
        // the sweep sees this item.
        atomic::fence(Ordering::SeqCst);

        // A stop that landed between the check and the push may have let the
        // worker run its final sweep already. Nothing queued after a stop ever
        // runs, so whoever notices drops the leftovers.
        if self.is_stopped() {
            self.abandon_queued();
            return;
        }

        self.unpark_worker();
    }

    /// Drops every queued item on the calling thread. Returns how many were
    /// dropped.
    pub(crate) fn abandon_queued(&self) -> usize {
        atomic::fence(Ordering::SeqCst);
        let mut abandoned = 0;

        while let Some(item) = self.queue.pop() {
            // A drop guard inside an item may itself panic, it must not take
            // the other abandoned items down with it.
            if panic::catch_unwind(AssertUnwindSafe(|| drop(item))).is_err() {
                error!(dispatcher = %self.id, "panic while dropping an abandoned work item");
            }
            abandoned += 1;
        }

        abandoned
    }

    pub(crate) fn request_stop(&self) {
        self.cancel.cancel();
        self.unpark_worker();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn is_worker_thread(&self) -> bool {
        self.worker
            .get()
            .is_some_and(|worker| worker.id() == thread::current().id())
    }

    fn unpark_worker(&self) {
        if let Some(worker) = self.worker.get() {
            worker.unpark();
        }
    }
}

/// A queue of work items drained by one dedicated worker thread.
///
/// Any thread may [`enqueue`](Self::enqueue); items from the same producer run
/// in submission order and no two items ever run concurrently. The worker keeps
/// going until the cancellation token given at construction (or
/// [`request_stop`](Self::request_stop)) fires. Items still queued at that
/// point are abandoned.
///
/// Dropping the dispatcher requests a stop and joins the worker. The
/// [`AffinityContext`]s handed out keep accepting posts afterwards, which are
/// silently dropped.
///
/// ```
/// use tether::{CancellationToken, WorkItem, WorkQueueDispatcher};
/// use std::sync::mpsc;
///
/// # fn main() -> anyhow::Result<()> {
/// let dispatcher = WorkQueueDispatcher::new(CancellationToken::new())?;
/// let (tx, rx) = mpsc::channel();
///
/// for i in 1..=3 {
///     let tx = tx.clone();
///     dispatcher.enqueue(WorkItem::new(move |_ctx| tx.send(i).unwrap()));
/// }
///
/// let seen: Vec<i32> = rx.iter().take(3).collect();
/// assert_eq!(seen, vec![1, 2, 3]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WorkQueueDispatcher {
    shared: Arc<Shared>,

    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueueDispatcher {
    /// Spawns a dispatcher with the default configuration.
    pub fn new(cancel: CancellationToken) -> Result<Self> {
        Builder::new().try_build(cancel)
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn with_config(cfg: DispatcherConfig, cancel: CancellationToken) -> Result<Self> {
        let shared = Arc::new(Shared::new(cfg, &cancel));
        let handle = spawn_worker_thread(Arc::clone(&shared))?;

        // Nothing can be enqueued before we return, so the worker can't miss
        // an unpark.
        let _ = shared.worker.set(handle.thread().clone());

        debug!(dispatcher = %shared.id, thread = ?handle.thread().name(), "dispatcher started");

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> DispatcherId {
        self.shared.id
    }

    /// Queues a work item. Never blocks and never fails: after a stop the
    /// item is accepted and dropped without running.
    pub fn enqueue(&self, item: WorkItem) {
        self.shared.enqueue(item);
    }

    /// Signals the worker to stop after its current item. Idempotent. Does not
    /// run the remaining items and does not wait for the worker.
    pub fn request_stop(&self) {
        self.shared.request_stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Number of items waiting to be executed. Racy by nature, for
    /// introspection only.
    pub fn queued_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// The posting façade for this dispatcher.
    pub fn context(&self) -> AffinityContext {
        AffinityContext::new(Arc::clone(&self.shared))
    }

    /// A task scheduler running everything it is given on this dispatcher.
    pub fn task_scheduler(&self) -> TaskScheduler<AffinityContext> {
        TaskScheduler::new(self.context())
    }

    /// Waits for the worker thread to exit. Call [`request_stop`](Self::request_stop)
    /// first (or cancel the token), otherwise this blocks until someone does.
    pub fn join(self) -> Result<(), DispatchError> {
        self.join_inner()
    }

    fn join_inner(&self) -> Result<(), DispatchError> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };

        let exited_cleanly = handle.join().is_ok();

        if exited_cleanly && !self.shared.panicked.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DispatchError::WorkerPanicked { id: self.shared.id })
        }
    }
}

impl Post for WorkQueueDispatcher {
    fn post(&self, item: WorkItem) {
        self.enqueue(item);
    }
}

impl Drop for WorkQueueDispatcher {
    fn drop(&mut self) {
        self.shared.request_stop();

        // A work item may own the last reference to its dispatcher, the worker
        // can't wait for itself.
        if self.shared.is_worker_thread() {
            return;
        }

        if let Err(e) = self.join_inner() {
            debug!(dispatcher = %self.shared.id, error = %e, "dispatcher dropped after worker failure");
        }
    }
}
