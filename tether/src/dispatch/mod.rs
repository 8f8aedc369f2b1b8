//! Single-consumer work dispatching.
//!
//! A [`WorkQueueDispatcher`] owns one dedicated worker thread that drains an
//! unbounded queue of [`WorkItem`]s in FIFO order. Any number of threads may
//! enqueue concurrently; items never run concurrently with each other.
//!
//! Two façades are derived from the same queue through the [`Post`] trait:
//!
//! - [`AffinityContext`]: "resume on this thread". Holding one guarantees a
//!   posted continuation runs on the dispatcher's worker.
//! - [`TaskScheduler`]: "run this there and give me a handle". Closures and
//!   futures are executed on the worker and their outcome is delivered through
//!   a [`FutureHandle`](crate::FutureHandle).

// Public API
pub mod builder;
pub use builder::{Builder, IdleStrategy, OnPanic};

pub mod context;
pub use context::AffinityContext;

pub mod dispatcher;
pub use dispatcher::{DispatcherId, WorkQueueDispatcher};

pub mod errors;
pub use errors::DispatchError;

pub mod item;
pub use item::{WorkItem, WorkerContext};

pub mod scheduler;
pub use scheduler::TaskScheduler;

// Exports
pub(crate) use builder::DispatcherConfig;
pub(crate) use context::background_context;
pub(crate) use dispatcher::Shared;

mod worker;


/// Anything that accepts work items on behalf of a single worker thread.
///
/// Implementations must execute every accepted item on the same thread and
/// must preserve the submission order of each individual producer. They may
/// silently drop items once they have been stopped.
pub trait Post: Send + Sync + 'static {
    /// Hand a work item over to the worker. Never blocks.
    fn post(&self, item: WorkItem);
}

impl<P: Post> Post for std::sync::Arc<P> {
    fn post(&self, item: WorkItem) {
        (**self).post(item)
    }
}
