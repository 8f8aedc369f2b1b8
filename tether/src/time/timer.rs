use crate::utils::panic_message;
use anyhow::Result;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Heap size under which cancelled deadlines are left for the timer thread to
/// pop.
const COMPACT_FLOOR: usize = 64;

struct State {
    /// Min-heap of deadlines. Cancelled entries stay until popped or
    /// compacted away.
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,

    /// Armed callbacks. An id missing from here was cancelled or fired.
    callbacks: HashMap<u64, Callback>,

    next_id: u64,

    shutdown: bool,
}

impl State {
    /// Drops cancelled deadlines once they outnumber the armed ones.
    fn maybe_compact(&mut self) {
        if self.deadlines.len() <= COMPACT_FLOOR.max(2 * self.callbacks.len()) {
            return;
        }

        let before = self.deadlines.len();
        let callbacks = &self.callbacks;
        self.deadlines.retain(|Reverse((_, id))| callbacks.contains_key(id));

        trace!(
            dropped = before - self.deadlines.len(),
            kept = self.deadlines.len(),
            "timer deadlines compacted"
        );
    }
}

struct Shared {
    state: Mutex<State>,

    changed: Condvar,
}

impl Shared {
    fn run(&self) {
        let mut state = self.state.lock();

        while !state.shutdown {
            let next = state.deadlines.peek().map(|Reverse(entry)| *entry);

            match next {
                None => self.changed.wait(&mut state),
                Some((deadline, id)) if deadline <= Instant::now() => {
                    state.deadlines.pop();

                    if let Some(callback) = state.callbacks.remove(&id) {
                        MutexGuard::unlocked(&mut state, || fire(id, callback));
                    }
                }
                Some((deadline, _)) => {
                    self.changed.wait_until(&mut state, deadline);
                }
            }
        }

        debug!(unfired = state.callbacks.len(), "timer stopped");
    }
}

fn fire(id: u64, callback: Callback) {
    trace!(entry = id, "timer entry fired");

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        error!(entry = id, reason = %panic_message(&*payload), "timer callback panicked");
    }
}

struct Driver {
    shared: Arc<Shared>,

    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.changed.notify_all();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        // The last handle may be owned by a callback running on the timer
        // thread, it can't wait for itself.
        if handle.thread().id() == thread::current().id() {
            return;
        }

        if handle.join().is_err() {
            warn!("timer thread panicked");
        }
    }
}

/// A deferred-trigger facility: runs callbacks on one background thread once
/// their delay elapsed.
///
/// Callbacks run one at a time, in deadline order, and must not block for
/// long. Clones share the same thread, which is stopped and joined when the
/// last clone is dropped. Callbacks that have not fired by then are dropped
/// without running.
#[derive(Clone)]
pub struct Timer {
    driver: Arc<Driver>,
}

impl Timer {
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                deadlines: BinaryHeap::new(),
                callbacks: HashMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });

        let handle = thread::Builder::new().name("tether-timer".to_string()).spawn({
            let shared = Arc::clone(&shared);
            move || shared.run()
        })?;

        Ok(Self {
            driver: Arc::new(Driver {
                shared,
                thread: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Process-wide timer, spawned on first use and never stopped. `None` if
    /// its thread could not be spawned.
    pub fn shared() -> Option<Timer> {
        static SHARED: OnceLock<Option<Timer>> = OnceLock::new();

        SHARED
            .get_or_init(|| {
                Timer::new()
                    .inspect_err(|e| warn!(error = %e, "failed to spawn shared timer"))
                    .ok()
            })
            .clone()
    }

    /// Arms `callback` to run once `after` has elapsed.
    pub fn schedule<F>(&self, after: Duration, callback: F) -> TimerEntry
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.driver.shared;
        let mut state = shared.state.lock();

        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, Box::new(callback));

        // A deadline past the representable range never fires, but can still
        // be cancelled.
        if let Some(deadline) = Instant::now().checked_add(after) {
            state.deadlines.push(Reverse((deadline, id)));
        }

        drop(state);
        shared.changed.notify_one();

        TimerEntry {
            id,
            shared: Arc::downgrade(shared),
        }
    }

    /// Number of callbacks armed and not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.driver.shared.state.lock().callbacks.len()
    }

    #[cfg(test)]
    pub(crate) fn queued_deadlines(&self) -> usize {
        self.driver.shared.state.lock().deadlines.len()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("pending", &self.pending())
            .finish()
    }
}

/// One armed callback of a [`Timer`].
///
/// Dropping the entry does not cancel it.
#[derive(Debug)]
pub struct TimerEntry {
    id: u64,

    shared: Weak<Shared>,
}

impl TimerEntry {
    /// Prevents the callback from running. Returns `false` if it already ran,
    /// is running, or its timer is gone.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };

        let callback = {
            let mut state = shared.state.lock();
            let callback = state.callbacks.remove(&self.id);
            state.maybe_compact();
            callback
        };

        // Dropped outside the lock, it may own arbitrary state.
        callback.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_TIMEOUT, wait_until};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Timer: Send, Sync, Clone);
    assert_impl_all!(TimerEntry: Send, Sync);

    #[test]
    fn test_callbacks_fire_in_deadline_order() -> Result<()> {
        let timer = Timer::new()?;
        let (tx, rx) = mpsc::channel();

        for (delay, tag) in [(30, 3), (10, 1), (20, 2)] {
            let tx = tx.clone();
            timer.schedule(Duration::from_millis(delay), move || {
                let _ = tx.send(tag);
            });
        }

        let fired = rx.iter().take(3).collect::<Vec<_>>();
        assert_eq!(fired, vec![1, 2, 3]);
        assert_eq!(timer.pending(), 0);
        Ok(())
    }

    #[test]
    fn test_cancel_prevents_callback() -> Result<()> {
        let timer = Timer::new()?;
        let fired = Arc::new(AtomicUsize::new(0));

        let entry = timer.schedule(Duration::from_millis(20), {
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert!(entry.cancel());
        assert!(!entry.cancel());

        // A later entry firing proves the cancelled one was skipped.
        let (tx, rx) = mpsc::channel();
        timer.schedule(Duration::from_millis(40), move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(TEST_TIMEOUT)?;

        assert_eq!(fired.load(Ordering::Relaxed), 0);
        Ok(())
    }

    #[test]
    fn test_cancel_after_fire_returns_false() -> Result<()> {
        let timer = Timer::new()?;
        let fired = Arc::new(AtomicUsize::new(0));

        let entry = timer.schedule(Duration::ZERO, {
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert!(wait_until(|| fired.load(Ordering::Relaxed) == 1));
        assert!(!entry.cancel());
        Ok(())
    }

    #[test]
    fn test_panicking_callback_does_not_kill_timer() -> Result<()> {
        let timer = Timer::new()?;
        timer.schedule(Duration::ZERO, || panic!("boom"));

        let (tx, rx) = mpsc::channel();
        timer.schedule(Duration::from_millis(5), move || {
            let _ = tx.send(());
        });

        rx.recv_timeout(TEST_TIMEOUT)?;
        Ok(())
    }

    #[test]
    fn test_drop_discards_unfired_callbacks() -> Result<()> {
        let timer = Timer::new()?;
        let fired = Arc::new(AtomicUsize::new(0));

        let entry = timer.schedule(Duration::from_secs(60), {
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::Relaxed);
            }
        });

        drop(timer);

        assert!(!entry.cancel());
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        Ok(())
    }

    #[test]
    fn test_cancelled_deadlines_do_not_accumulate() -> Result<()> {
        let timer = Timer::new()?;

        let armed = (0..10)
            .map(|_| timer.schedule(Duration::from_secs(3600), || {}))
            .collect::<Vec<_>>();

        for _ in 0..100_000 {
            let entry = timer.schedule(Duration::from_secs(3600), || {});
            assert!(entry.cancel());

            assert!(timer.queued_deadlines() <= COMPACT_FLOOR.max(2 * timer.pending()) + 1);
        }

        assert_eq!(timer.pending(), armed.len());

        // Compaction keeps the live deadlines.
        assert!(timer.queued_deadlines() >= armed.len());
        assert!(armed.iter().all(TimerEntry::cancel));
        Ok(())
    }

    #[test]
    fn test_compaction_keeps_live_entries_firing() -> Result<()> {
        let timer = Timer::new()?;
        let (tx, rx) = mpsc::channel();

        timer.schedule(Duration::from_millis(20), move || {
            let _ = tx.send(());
        });

        for _ in 0..(4 * COMPACT_FLOOR) {
            assert!(timer.schedule(Duration::from_secs(3600), || {}).cancel());
        }
        assert!(timer.queued_deadlines() <= COMPACT_FLOOR);

        rx.recv_timeout(TEST_TIMEOUT)?;
        assert_eq!(timer.pending(), 0);
        Ok(())
    }

    #[test]
    fn test_shared_timer_is_reused() {
        let (Some(a), Some(b)) = (Timer::shared(), Timer::shared()) else {
            panic!("shared timer unavailable");
        };
        assert!(Arc::ptr_eq(&a.driver, &b.driver));
    }
}
