use crate::dispatch::{AffinityContext, DispatcherId};
use std::cell::Cell;
use std::fmt;

type Callback = Box<dyn FnOnce(&WorkerContext) + Send + 'static>;

/// One unit of work submitted to a dispatcher.
///
/// A work item is owned by the queue until the worker dequeues it, runs
/// exactly once on the worker thread, and is dropped right after. Items still
/// queued when the dispatcher stops are dropped without running.
pub struct WorkItem {
    callback: Callback,
}

impl WorkItem {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        Self {
            callback: Box::new(f),
        }
    }

    /// Pairs a callback with a state payload that is handed over by value
    /// when the item runs.
    pub fn with_state<S, F>(state: S, f: F) -> Self
    where
        S: Send + 'static,
        F: FnOnce(&WorkerContext, S) + Send + 'static,
    {
        Self::new(move |ctx| f(ctx, state))
    }

    pub(crate) fn run(self, ctx: &WorkerContext) {
        (self.callback)(ctx)
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem").finish_non_exhaustive()
    }
}

/// The execution context handed to every work item.
///
/// This is how code finds out where it is running: instead of consulting
/// thread-local markers, a work item receives the context of the worker that
/// executes it, including an [`AffinityContext`] to post follow-up work onto
/// the same thread.
#[derive(Debug)]
pub struct WorkerContext {
    context: AffinityContext,

    thread_name: Option<String>,

    /// Items run by this worker before the current one.
    executed: Cell<u64>,
}

impl WorkerContext {
    pub(crate) fn new(context: AffinityContext, thread_name: Option<String>) -> Self {
        Self {
            context,
            thread_name,
            executed: Cell::new(0),
        }
    }

    pub fn dispatcher_id(&self) -> DispatcherId {
        self.context.dispatcher_id()
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// Number of work items this worker ran before the current one.
    pub fn executed(&self) -> u64 {
        self.executed.get()
    }

    /// Posts to the dispatcher this worker belongs to.
    pub fn context(&self) -> &AffinityContext {
        &self.context
    }

    pub(crate) fn record_executed(&self) {
        self.executed.set(self.executed.get() + 1);
    }
}
