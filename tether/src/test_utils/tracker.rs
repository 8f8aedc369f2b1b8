use dashmap::DashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Event {
    /// A work item or task body ran.
    Run,
    /// A continuation resumed after an await.
    Resume,
    /// A completion source was completed.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub thread: ThreadId,
    pub tag: u64,
}

/// Records which thread observed what, from any number of threads.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Event, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        map.insert(Event::Run, Vec::new());
        map.insert(Event::Resume, Vec::new());
        map.insert(Event::Complete, Vec::new());

        Self {
            calls: Arc::new(map),
        }
    }

    pub(crate) fn record(&self, event: Event, tag: u64) {
        self.calls
            .get_mut(&event)
            .expect("event not found")
            .push(Call {
                thread: thread::current().id(),
                tag,
            })
    }

    pub(crate) fn get_calls(&self, event: &Event) -> Vec<Call> {
        self.calls
            .get(event)
            .expect("event not found")
            .value()
            .clone()
    }

    pub(crate) fn num_calls(&self, event: &Event) -> usize {
        self.calls.get(event).map_or(0, |calls| calls.len())
    }

    pub(crate) fn tags(&self, event: &Event) -> Vec<u64> {
        self.get_calls(event).into_iter().map(|c| c.tag).collect()
    }

    /// Whether every recorded call of `event` happened on `thread`.
    pub(crate) fn all_on(&self, event: &Event, thread: ThreadId) -> bool {
        self.get_calls(event).iter().all(|c| c.thread == thread)
    }
}
