use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
pub(crate) struct WakerData {
    pub wake_count: AtomicUsize,

    /// Thread of the most recent wake-up.
    pub last_thread: Mutex<Option<ThreadId>>,
}

impl WakerData {
    pub(crate) fn get_count(&self) -> usize {
        self.wake_count.load(Ordering::Acquire)
    }

    pub(crate) fn last_thread(&self) -> Option<ThreadId> {
        *self.last_thread.lock()
    }
}

impl Wake for WakerData {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        *self.last_thread.lock() = Some(thread::current().id());
        self.wake_count.fetch_add(1, Ordering::Release);
    }
}

// Mocking where the Waker will increment the atomic everytime it is woken up.
pub(crate) fn mock_waker() -> (Waker, Arc<WakerData>) {
    let data = Arc::new(WakerData::default());
    (Waker::from(Arc::clone(&data)), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_waker() {
        let (waker1, waker_data) = mock_waker();
        waker1.wake_by_ref();
        assert_eq!(waker_data.get_count(), 1);
        assert_eq!(waker_data.last_thread(), Some(thread::current().id()));

        let waker2 = waker1.clone();
        waker2.wake();
        assert_eq!(waker_data.get_count(), 2);

        drop(waker1);
        assert_eq!(waker_data.get_count(), 2);
    }
}
