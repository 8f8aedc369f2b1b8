use crate::dispatch::{Builder, WorkItem, WorkQueueDispatcher};
use anyhow::{Result, anyhow};
use std::sync::mpsc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// Exports
pub(crate) mod mocks;
pub(crate) use mocks::mock_waker;

pub(crate) mod tracker;
pub(crate) use tracker::{Event, Tracker};

pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn init_dispatcher(
    builder: Option<Builder>,
) -> Result<(WorkQueueDispatcher, CancellationToken)> {
    init_tracing();

    let cancel = CancellationToken::new();
    let dispatcher = builder
        .unwrap_or_default()
        .try_build(cancel.clone())?;

    Ok((dispatcher, cancel))
}

/// Installs a test-writer subscriber honoring `RUST_LOG`. Safe to call from
/// every test.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Blocks until every item queued before this call has run.
pub(crate) fn drain(dispatcher: &WorkQueueDispatcher) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    dispatcher.enqueue(WorkItem::new(move |_| {
        let _ = tx.send(());
    }));

    rx.recv_timeout(TEST_TIMEOUT)
        .map_err(|e| anyhow!("dispatcher did not drain: {e}"))
}

/// Id of the dispatcher's worker thread.
pub(crate) fn worker_thread_id(dispatcher: &WorkQueueDispatcher) -> Result<ThreadId> {
    let (tx, rx) = mpsc::channel();
    dispatcher.enqueue(WorkItem::new(move |_| {
        let _ = tx.send(std::thread::current().id());
    }));

    rx.recv_timeout(TEST_TIMEOUT)
        .map_err(|e| anyhow!("worker did not answer: {e}"))
}

/// Polls `cond` until it holds or [`TEST_TIMEOUT`] elapses.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;

    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    cond()
}
