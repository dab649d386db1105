use crate::context;
use crate::runtime::pool::WorkerPool;
use crate::runtime::{OwnedTasks, RuntimeConfig, Schedule, SpawnBuilder, SpawnError, SpawnOpts};
use crate::task::{JoinHandle, Task, new_task};
use crate::time::TimerService;
use crate::utils::ThreadNotify;
use anyhow::{Result, anyhow};
use crossbeam_utils::CachePadded;
use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

const SHUTDOWN_THREAD_NAME: &str = "spindle-shutdown";

/// Handle to a running scheduler: a pool of worker threads, their run queues,
/// a timer service and the registry of live tasks.
///
/// The handle is cheap to clone. Worker threads keep running until
/// [`Scheduler::shutdown`] is called, dropping handles does not stop them.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

/// State shared by the scheduler handles and the worker threads.
pub(crate) struct Shared {
    pub(crate) cfg: RuntimeConfig,

    pub(crate) pool: WorkerPool,

    timers: Arc<TimerService>,

    tasks: OwnedTasks,

    /// Tasks queued or running. Zero together with an empty timer heap means
    /// nothing can make progress anymore.
    active: CachePadded<AtomicUsize>,

    shutdown: AtomicBool,
}

/// What a task holds on to its scheduler. A weak reference, so that a task
/// parked on a forgotten mailbox does not keep the scheduler alive.
struct WeakHandle(Weak<Shared>);

impl Schedule for WeakHandle {
    fn schedule(&self, task: Arc<Task>) {
        match self.0.upgrade() {
            Some(shared) => shared.schedule(task),
            None => tracing::trace!(task.id = %task.id(), "wakeup after scheduler was dropped"),
        }
    }

    fn release(&self, task: &Task) {
        if let Some(shared) = self.0.upgrade() {
            shared.tasks.remove(&task.id());
        }
    }
}

impl Scheduler {
    pub(crate) fn start(cfg: RuntimeConfig) -> Result<Scheduler> {
        let timers = Arc::new(TimerService::start()?);

        let scheduler = Scheduler {
            shared: Arc::new(Shared {
                pool: WorkerPool::new(&cfg),
                cfg,
                timers,
                tasks: OwnedTasks::new(),
                active: CachePadded::new(AtomicUsize::new(0)),
                shutdown: AtomicBool::new(false),
            }),
        };

        if let Err(e) = scheduler.shared.pool.start(&scheduler) {
            let _ = scheduler.shared.timers.shutdown();
            return Err(e);
        }

        tracing::debug!(
            workers = scheduler.num_workers(),
            dispatch = ?scheduler.shared.cfg.dispatch,
            "scheduler started"
        );

        Ok(scheduler)
    }

    /// Returns `true` if both handles point to the same scheduler.
    pub(crate) fn is(&self, shared: &Shared) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.shared), shared)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn timer_service(&self) -> Arc<TimerService> {
        Arc::clone(&self.shared.timers)
    }

    /// Spawns a task on this scheduler.
    ///
    /// A refused task gets a handle that resolves right away to
    /// [`JoinError::Rejected`](crate::task::JoinError::Rejected).
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_builder().spawn(future)
    }

    /// Spawns a task on this scheduler, failing if it is shut down.
    pub fn try_spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.try_spawn_with(future, SpawnOpts::default())
    }

    /// Spawns a task with explicit options.
    pub fn try_spawn_with<F>(
        &self,
        future: F,
        opts: SpawnOpts,
    ) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let shared = &self.shared;

        if shared.is_shutdown() {
            return Err(SpawnError::Shutdown);
        }

        if let Some(index) = opts.affinity
            && index >= shared.pool.len()
        {
            return Err(SpawnError::InvalidAffinity {
                index,
                num_workers: shared.pool.len(),
            });
        }

        let handle = Arc::new(WeakHandle(Arc::downgrade(shared)));
        let (task, join) = new_task(future, opts, handle);

        if !shared.tasks.insert(Arc::clone(&task)) {
            task.cancel();
            return Err(SpawnError::Shutdown);
        }

        tracing::trace!(task.id = %task.id(), task.name = task.name(), "spawned");
        shared.schedule(task);

        Ok(join)
    }

    /// Creates a [`SpawnBuilder`] bound to this scheduler.
    pub fn spawn_builder(&self) -> SpawnBuilder {
        SpawnBuilder::on(self.clone())
    }

    /// Drives `future` to completion on the current thread.
    ///
    /// Spawns from inside the future go to this scheduler. The current thread
    /// sleeps between polls, so it must not be one of the worker threads.
    ///
    /// # Panics
    ///
    /// Panics when called from a worker thread.
    #[track_caller]
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        assert!(
            !context::is_worker_thread(),
            "cannot block a worker thread, spawn the future instead"
        );

        let _enter = context::enter_scheduler(self.clone(), None);

        let notify = ThreadNotify::current();
        let waker = notify.waker();
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
            notify.park();
        }
    }

    /// Waits until no task is queued or running and no timer is pending, then
    /// shuts down.
    ///
    /// Tasks paused on a mailbox that nobody will touch again do not count as
    /// active and get cancelled by the shutdown.
    pub fn idledown(&self) -> Result<()> {
        while !self.is_idle() {
            thread::sleep(self.shared.cfg.idle_poll_interval);
        }

        self.shutdown()
    }

    /// Like [`Scheduler::idledown`], but shuts down anyway once `timeout`
    /// elapses. Returns `Ok(true)` if the scheduler went idle in time.
    pub fn idledown_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;

        let idle = loop {
            if self.is_idle() {
                break true;
            }

            let now = Instant::now();
            if now >= deadline {
                break false;
            }

            thread::sleep(std::cmp::min(
                self.shared.cfg.idle_poll_interval,
                deadline - now,
            ));
        };

        if !idle {
            tracing::debug!(
                active = self.shared.active.load(Ordering::Acquire),
                timers = self.shared.timers.len(),
                "scheduler not idle after {timeout:?}, shutting down"
            );
        }

        self.shutdown()?;
        Ok(idle)
    }

    /// Stops the worker threads and the timer service.
    ///
    /// Tasks that did not finish are cancelled: their join handles resolve to
    /// [`JoinError::Cancelled`](crate::task::JoinError::Cancelled). Calling
    /// this again is a no-op.
    ///
    /// A worker thread cannot join itself. Called from a task, the shutdown
    /// runs on a helper thread and this returns right away.
    pub fn shutdown(&self) -> Result<()> {
        if context::current_worker_of(&self.shared).is_some() {
            let scheduler = self.clone();

            thread::Builder::new()
                .name(SHUTDOWN_THREAD_NAME.to_string())
                .spawn(move || {
                    if let Err(e) = scheduler.shutdown() {
                        tracing::error!("scheduler shutdown failed: {e:#}");
                    }
                })
                .map_err(|e| anyhow!("failed to spawn {SHUTDOWN_THREAD_NAME} thread: {e}"))?;

            return Ok(());
        }

        let shared = &self.shared;
        if !shared.mark_shutdown() {
            return Ok(());
        }

        shared.pool.unpark_all();
        let joined = shared.pool.join_all();

        let cancelled = shared.tasks.shutdown_all();
        let dropped = shared.pool.drain();
        shared.active.store(0, Ordering::Release);
        let timers = shared.timers.shutdown();

        tracing::debug!(cancelled, dropped, "scheduler shut down");

        joined.and(timers)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    pub fn num_workers(&self) -> usize {
        self.shared.pool.len()
    }

    /// Returns `true` when no task is queued or running and no timer is
    /// pending.
    pub fn is_idle(&self) -> bool {
        self.shared.active.load(Ordering::Acquire) == 0 && self.shared.timers.is_empty()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.num_workers())
            .field("dispatch", &self.shared.cfg.dispatch)
            .field("tasks", &self.shared.tasks.len())
            .field("active", &self.shared.active.load(Ordering::Relaxed))
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Shared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Sets the shutdown flag. Returns `false` if it was already set.
    pub(crate) fn mark_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::SeqCst)
    }

    /// Queues a runnable task.
    pub(crate) fn schedule(&self, task: Arc<Task>) {
        if self.is_shutdown() {
            // The registry cancels the task.
            tracing::trace!(task.id = %task.id(), "dropping wakeup after shutdown");
            return;
        }

        self.active.fetch_add(1, Ordering::AcqRel);

        let target = match task.affinity() {
            Some(index) => Some(index),
            None => self.pool.pick(self.cfg.dispatch),
        };

        let current = context::current_worker_of(self);
        let id = task.id();
        if !self.pool.push(target, task, current, || self.is_shutdown()) {
            // The registry cancels the task.
            tracing::trace!(task.id = %id, "run queue full at shutdown, dropping task");
            self.task_finished_step();
        } else if self.is_shutdown() {
            // Raced with shutdown, the queues may already have been drained.
            let dropped = self.pool.drain();
            let _ = self
                .active
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(dropped))
                });
        }
    }

    /// Puts a task back at the end of worker `index`'s queue. Must be called
    /// from that worker's thread.
    pub(crate) fn requeue(&self, index: usize, task: Arc<Task>) {
        if self.is_shutdown() {
            return;
        }

        self.active.fetch_add(1, Ordering::AcqRel);
        self.pool.workers[index].push_local(task);
    }

    /// Called by a worker after each step it ran.
    pub(crate) fn task_finished_step(&self) {
        // Shutdown resets the counter, it must not wrap around below zero.
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("cfg", &self.cfg)
            .field("tasks", &self.tasks.len())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}
