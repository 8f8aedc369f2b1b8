use crate::dispatch::{
    AffinityContext, DispatchError, IdleStrategy, OnPanic, Shared, WorkItem, WorkerContext,
};
use crate::utils::panic_message;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

pub(super) fn spawn_worker_thread(shared: Arc<Shared>) -> Result<JoinHandle<()>, DispatchError> {
    let name = shared.cfg.thread_name.0();
    if name.contains('\0') {
        return Err(DispatchError::InvalidThreadName(name));
    }

    let mut builder = thread::Builder::new().name(name);

    if let Some(stack_size) = shared.cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let handle = builder.spawn(move || Worker::new(shared).run())?;

    Ok(handle)
}

/// The single consumer of a dispatcher's queue. Lives on, and never leaves,
/// the worker thread.
struct Worker {
    shared: Arc<Shared>,

    ctx: WorkerContext,
}

impl Worker {
    fn new(shared: Arc<Shared>) -> Self {
        let thread_name = thread::current().name().map(str::to_string);
        let ctx = WorkerContext::new(AffinityContext::new(Arc::clone(&shared)), thread_name);

        Self { shared, ctx }
    }

    fn run(self) {
        debug!(dispatcher = %self.shared.id, "worker started");

        self.event_loop();
        let abandoned = self.abandon_remaining();

        debug!(
            dispatcher = %self.shared.id,
            executed = self.ctx.executed(),
            abandoned,
            "worker stopped"
        );
    }

    fn event_loop(&self) {
        while !self.shared.cancel.is_cancelled() {
            match self.shared.queue.pop() {
                Some(item) => {
                    if self.execute(item).is_break() {
                        break;
                    }
                }
                None => self.idle(),
            }
        }
    }

    fn execute(&self, item: WorkItem) -> ControlFlow<()> {
        let res = panic::catch_unwind(AssertUnwindSafe(|| item.run(&self.ctx)));
        self.ctx.record_executed();

        let Err(payload) = res else {
            return ControlFlow::Continue(());
        };

        let reason = panic_message(&*payload);

        match self.shared.cfg.on_panic {
            OnPanic::LogAndContinue => {
                error!(dispatcher = %self.shared.id, %reason, "work item panicked, continuing");
                ControlFlow::Continue(())
            }
            OnPanic::Stop => {
                error!(dispatcher = %self.shared.id, %reason, "work item panicked, stopping worker");
                self.shared.panicked.store(true, Ordering::Release);
                self.shared.cancel.cancel();
                ControlFlow::Break(())
            }
        }
    }

    fn idle(&self) {
        match self.shared.cfg.idle_strategy {
            IdleStrategy::Yield => thread::yield_now(),
            IdleStrategy::Park => {
                trace!(dispatcher = %self.shared.id, "worker parked");
                // Enqueue unparks us. An unpark that lands before we park makes
                // this return immediately, so no wakeup is lost.
                thread::park_timeout(self.shared.cfg.idle_timeout);
            }
        }
    }

    /// Drops whatever is still queued, on this thread, so that owners of
    /// abandoned work (e.g. spawned tasks) find out now rather than whenever
    /// the last reference to the queue goes away.
    fn abandon_remaining(&self) -> usize {
        self.shared.abandon_queued()
    }
}
