use crate::runtime::Scheduler;
use anyhow::{Context, Result, anyhow};
use std::convert::TryFrom;
use std::env;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Environment variable overriding the default number of worker threads.
pub const WORKER_THREADS_ENV: &str = "SPINDLE_WORKER_THREADS";

/// Default capacity of each worker's run queue.
const RUN_QUEUE_CAPACITY: usize = 64 * 1024;

/// How many ticks before a worker looks at the shared queue, even if its own
/// queue still has work.
const SHARED_QUEUE_INTERVAL: u32 = 31;

/// How often `idledown` checks whether the scheduler went idle.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How the scheduler picks a run queue for tasks without affinity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Cycle through the workers.
    #[default]
    RoundRobin,

    /// Sample two workers at random and pick the one with the shorter queue.
    LeastLoaded,

    /// Push to a queue shared by every worker. Tasks with affinity still go to
    /// their worker's own queue.
    Shared,
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("spindle-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Builds a [`Scheduler`] with custom settings.
///
/// ```no_run
/// use spindle::runtime::{Builder, Dispatch};
///
/// let scheduler = Builder::new()
///     .worker_threads(4)
///     .dispatch(Dispatch::LeastLoaded)
///     .thread_name("my-pool")
///     .try_build()?;
///
/// scheduler.block_on(async {
///     spindle::spawn(async { 1 + 1 }).await
/// })?;
///
/// scheduler.shutdown()?;
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Number of worker threads. Defaults to one less than the number of
    /// cores, with at least one worker.
    worker_threads: Option<usize>,

    /// Capacity of each worker's bounded run queue.
    run_queue_capacity: usize,

    /// Queue selection for tasks without affinity.
    dispatch: Dispatch,

    /// Name fn used for threads spawned by the scheduler.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the scheduler.
    thread_stack_size: Option<usize>,

    /// How many ticks before pulling a task from the shared queue.
    shared_queue_interval: u32,

    /// Polling period of `idledown`.
    idle_poll_interval: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Returns a new builder with default settings.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new() -> Builder {
        Self {
            worker_threads: None,
            run_queue_capacity: RUN_QUEUE_CAPACITY,
            dispatch: Dispatch::default(),
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            shared_queue_interval: SHARED_QUEUE_INTERVAL,
            idle_poll_interval: IDLE_POLL_INTERVAL,
        }
    }

    /// The number of worker threads.
    ///
    /// Defaults to `max(1, cores - 1)`, leaving a core for the timer thread
    /// and the thread calling `block_on`. The `SPINDLE_WORKER_THREADS`
    /// environment variable overrides the default, and this setting overrides
    /// both.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Capacity of each worker's run queue. A full queue makes the thread
    /// scheduling onto it wait, tasks are never dropped.
    #[track_caller]
    pub fn run_queue_capacity(mut self, val: usize) -> Self {
        assert!(val > 0, "run_queue_capacity must be greater than 0");
        self.run_queue_capacity = val;
        self
    }

    pub fn dispatch(mut self, val: Dispatch) -> Self {
        self.dispatch = val;
        self
    }

    /// Sets name of threads spawned by the scheduler's thread pool.
    ///
    /// The default name is "spindle-{id}", where id is monotonically
    /// increasing.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// scheduler's thread pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
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

    /// Sets the number of worker ticks after which a worker polls the shared
    /// queue before its own.
    ///
    /// A tick roughly corresponds to one step of one task. Smaller values get
    /// new work from the shared queue started sooner, at the cost of more
    /// contention on it.
    #[track_caller]
    pub fn shared_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "shared_queue_interval must be greater than 0");
        self.shared_queue_interval = val;
        self
    }

    /// How often [`Scheduler::idledown`] checks for idleness.
    #[track_caller]
    pub fn idle_poll_interval(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "idle_poll_interval must be greater than 0");
        self.idle_poll_interval = val;
        self
    }

    /// Creates the configured [`Scheduler`].
    ///
    /// Worker threads and the timer thread are running when this returns.
    pub fn try_build(self) -> Result<Scheduler> {
        let cfg = RuntimeConfig::try_from(self)?;
        Scheduler::start(cfg)
    }
}

// Export runtime builder as a RuntimeConfig object consumed by the scheduler
// and its workers.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) run_queue_capacity: usize,
    pub(crate) dispatch: Dispatch,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) shared_queue_interval: u32,
    pub(crate) idle_poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: 1,
            run_queue_capacity: RUN_QUEUE_CAPACITY,
            dispatch: Dispatch::default(),
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            shared_queue_interval: SHARED_QUEUE_INTERVAL,
            idle_poll_interval: IDLE_POLL_INTERVAL,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(anyhow!("worker_threads must be greater than 0"));
        }

        if self.run_queue_capacity == 0 {
            return Err(anyhow!("run_queue_capacity must be greater than 0"));
        }

        Ok(())
    }
}

/// One worker per core, minus one, never less than one. The environment
/// variable takes precedence.
fn default_worker_threads() -> Result<usize> {
    let cores = thread::available_parallelism()?.get();
    resolve_worker_threads(env::var(WORKER_THREADS_ENV), cores)
}

fn resolve_worker_threads(var: Result<String, env::VarError>, cores: usize) -> Result<usize> {
    match var {
        Ok(val) => val
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid {WORKER_THREADS_ENV}={val:?}")),
        Err(env::VarError::NotPresent) => Ok(std::cmp::max(1, cores.saturating_sub(1))),
        Err(e) => Err(anyhow!("cannot read {WORKER_THREADS_ENV}: {e}")),
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => default_worker_threads()?,
        };

        let cfg = RuntimeConfig {
            worker_threads,
            run_queue_capacity: builder.run_queue_capacity,
            dispatch: builder.dispatch,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            shared_queue_interval: builder.shared_queue_interval,
            idle_poll_interval: builder.idle_poll_interval,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
