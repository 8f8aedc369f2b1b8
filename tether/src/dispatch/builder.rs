use crate::dispatch::WorkQueueDispatcher;
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a parked worker sleeps before re-checking its cancellation signal.
/// Enqueues and `request_stop` unpark the worker right away, this only bounds
/// the latency of a token cancelled from the outside.
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Smallest stack we accept for the worker thread.
const MIN_THREAD_STACK_SIZE: usize = 64 * 1024;

/// What the worker does when the queue is empty.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    /// Busy-poll the queue, yielding the processor between attempts. Lowest
    /// latency, burns a core while idle.
    Yield,

    /// Park the worker until an enqueue (or stop request) unparks it, waking up
    /// at least every `idle_timeout` to observe external cancellation.
    #[default]
    Park,
}

/// What the worker does when a work item panics.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnPanic {
    /// The panic is fatal for the dispatcher: the worker logs it and exits,
    /// every remaining item is abandoned and [`WorkQueueDispatcher::join`]
    /// reports [`DispatchError::WorkerPanicked`](crate::DispatchError::WorkerPanicked).
    /// A new dispatcher has to be created to resume processing.
    #[default]
    Stop,

    /// Log the panic and keep draining the queue.
    LogAndContinue,
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    // Shared by all dispatchers so that worker names are unique per process.
    static WORKER_COUNT: AtomicUsize = AtomicUsize::new(0);

    ThreadNameFn(Arc::new(|| {
        let id = WORKER_COUNT.fetch_add(1, Ordering::Relaxed);
        format!("tether-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and spawns a [`WorkQueueDispatcher`].
///
/// ```
/// use std::time::Duration;
/// use tether::{Builder, CancellationToken, IdleStrategy, OnPanic};
///
/// # fn main() -> anyhow::Result<()> {
/// let dispatcher = Builder::new()
///     .thread_name("ui-thread")
///     .idle_strategy(IdleStrategy::Park)
///     .idle_timeout(Duration::from_millis(20))
///     .on_panic(OnPanic::LogAndContinue)
///     .try_build(CancellationToken::new())?;
///
/// dispatcher.request_stop();
/// dispatcher.join()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Name fn used for the worker thread.
    thread_name: ThreadNameFn,

    /// Stack size used for the worker thread.
    thread_stack_size: Option<usize>,

    /// Behavior of the worker when the queue is empty.
    idle_strategy: IdleStrategy,

    /// Upper bound on how long a parked worker sleeps.
    idle_timeout: Duration,

    /// Behavior of the worker when a work item panics.
    on_panic: OnPanic,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            idle_strategy: IdleStrategy::default(),
            idle_timeout: IDLE_TIMEOUT,
            on_panic: OnPanic::default(),
        }
    }

    /// Sets the name of the worker thread.
    ///
    /// The default name is "tether-{id}", where id is monotonically increasing
    /// across all dispatchers of the process.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of the worker thread.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for the worker thread.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    pub fn idle_strategy(mut self, val: IdleStrategy) -> Self {
        self.idle_strategy = val;
        self
    }

    /// Only relevant with [`IdleStrategy::Park`].
    #[track_caller]
    pub fn idle_timeout(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "idle_timeout must be greater than 0");
        self.idle_timeout = val;
        self
    }

    pub fn on_panic(mut self, val: OnPanic) -> Self {
        self.on_panic = val;
        self
    }

    /// Creates the configured dispatcher. The worker thread is running when
    /// this returns, and stops once `cancel` (or the dispatcher's own
    /// [`request_stop`](WorkQueueDispatcher::request_stop)) fires.
    pub fn try_build(self, cancel: CancellationToken) -> Result<WorkQueueDispatcher> {
        let cfg = DispatcherConfig::try_from(self)?;
        WorkQueueDispatcher::with_config(cfg, cancel)
    }
}

// Validated builder, shared with the worker thread.
#[derive(Debug, Clone)]
pub(crate) struct DispatcherConfig {
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) idle_strategy: IdleStrategy,
    pub(crate) idle_timeout: Duration,
    pub(crate) on_panic: OnPanic,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            idle_strategy: IdleStrategy::default(),
            idle_timeout: IDLE_TIMEOUT,
            on_panic: OnPanic::default(),
        }
    }
}

impl DispatcherConfig {
    fn validate(&self) -> Result<()> {
        if let Some(size) = self.thread_stack_size
            && size < MIN_THREAD_STACK_SIZE
        {
            return Err(anyhow!(
                "thread_stack_size ({}) is below the minimum of {} bytes",
                size,
                MIN_THREAD_STACK_SIZE
            ));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for DispatcherConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = DispatcherConfig {
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            idle_strategy: builder.idle_strategy,
            idle_timeout: builder.idle_timeout,
            on_panic: builder.on_panic,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
