use crate::context;
use crate::runtime::worker::{self, Worker};
use crate::runtime::{Dispatch, RuntimeConfig, Scheduler};
use crate::task::Task;
use anyhow::{Result, anyhow};
use crossbeam_queue::{ArrayQueue, SegQueue};
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering, fence};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

/// The worker threads of a scheduler and their run queues.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    pub(crate) workers: Box<[Worker]>,

    /// Used with [`Dispatch::Shared`], any worker pops from it.
    shared_queue: ArrayQueue<Arc<Task>>,

    /// Spill of the shared queue for workers pushing into it while it is full.
    shared_overflow: SegQueue<Arc<Task>>,

    next_worker: CachePadded<AtomicUsize>,

    /// LIFO collection of parked workers. We unpark in LIFO order as the
    /// latest parked worker is the one where the CPU cache is the hottest.
    parked: Mutex<VecDeque<usize>>,
    num_parked: AtomicUsize,

    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(cfg: &RuntimeConfig) -> Self {
        Self {
            workers: (0..cfg.worker_threads)
                .map(|_| Worker::new(cfg.run_queue_capacity))
                .collect(),
            shared_queue: ArrayQueue::new(cfg.run_queue_capacity),
            shared_overflow: SegQueue::new(),
            next_worker: CachePadded::new(AtomicUsize::new(0)),
            parked: Mutex::new(VecDeque::with_capacity(cfg.worker_threads)),
            num_parked: AtomicUsize::new(0),
            handles: Mutex::new(Vec::with_capacity(cfg.worker_threads)),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Spawns one thread per worker. Returns once every thread is running.
    pub(crate) fn start(&self, scheduler: &Scheduler) -> Result<()> {
        let cfg = &scheduler.shared().cfg;
        let (started_tx, started_rx) = mpsc::channel();
        let mut handles = self.handles.lock();

        for index in 0..self.len() {
            let mut builder = thread::Builder::new().name(cfg.thread_name.0());
            if let Some(stack_size) = cfg.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let worker_scheduler = scheduler.clone();
            let started_tx = started_tx.clone();

            let spawned = builder.spawn(move || {
                let shared = Arc::clone(worker_scheduler.shared());
                let _enter = context::enter_scheduler(worker_scheduler, Some(index));
                shared.pool.workers[index].bind_current_thread();
                let _ = started_tx.send(());
                drop(started_tx);

                worker::run(&shared, index);
            });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Workers already running exit on the shutdown flag.
                    drop(handles);
                    scheduler.shared().mark_shutdown();
                    self.unpark_all();
                    let _ = self.join_all();
                    return Err(anyhow!("failed to spawn worker thread {index}: {e}"));
                }
            }
        }

        drop(handles);
        drop(started_tx);

        // Spawning threads is async, wait for all threads to be started...
        for _ in 0..self.len() {
            started_rx
                .recv()
                .map_err(|_| anyhow!("worker thread exited before starting"))?;
        }

        Ok(())
    }

    /// Picks a worker for a task without affinity, or `None` for the shared
    /// queue.
    pub(crate) fn pick(&self, dispatch: Dispatch) -> Option<usize> {
        let n = self.len();

        match dispatch {
            Dispatch::RoundRobin => Some(self.next_worker.fetch_add(1, Ordering::Relaxed) % n),
            Dispatch::LeastLoaded if n > 1 => {
                // Power of two choices.
                let a = fastrand::usize(0..n);
                let b = (a + fastrand::usize(1..n)) % n;
                if self.workers[a].len() <= self.workers[b].len() {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            Dispatch::LeastLoaded => Some(0),
            Dispatch::Shared => None,
        }
    }

    /// Queues `task` on worker `index`, or on the shared queue.
    ///
    /// A full queue makes the caller wait for a slot. A worker thread only
    /// waits a bounded time before spilling into the overflow queue, two
    /// workers waiting on each other's full queue would never make progress.
    ///
    /// `current` is the index of the calling worker, if the caller is one of
    /// this pool's workers. Returns `false` if the caller gave up waiting
    /// because `is_shutdown` turned true, the task is dropped then.
    pub(crate) fn push(
        &self,
        target: Option<usize>,
        task: Arc<Task>,
        current: Option<usize>,
        is_shutdown: impl Fn() -> bool,
    ) -> bool {
        match target {
            Some(index) => {
                let worker = &self.workers[index];

                if current == Some(index) {
                    worker.push_local(task);
                    return true;
                }

                let queued = self.push_with_backoff(
                    &worker.local,
                    &worker.overflow,
                    task,
                    current.is_some(),
                    || self.unpark(index),
                    &is_shutdown,
                );
                self.unpark(index);
                queued
            }
            None => {
                let queued = self.push_with_backoff(
                    &self.shared_queue,
                    &self.shared_overflow,
                    task,
                    current.is_some(),
                    || self.unpark_one(),
                    &is_shutdown,
                );
                self.unpark_one();
                queued
            }
        }
    }

    fn push_with_backoff(
        &self,
        queue: &ArrayQueue<Arc<Task>>,
        overflow: &SegQueue<Arc<Task>>,
        mut task: Arc<Task>,
        may_spill: bool,
        wake_consumer: impl Fn() -> bool,
        is_shutdown: impl Fn() -> bool,
    ) -> bool {
        let backoff = Backoff::new();

        loop {
            match queue.push(task) {
                Ok(()) => return true,
                Err(rejected) => task = rejected,
            }

            if may_spill && backoff.is_completed() {
                tracing::trace!(task.id = %task.id(), "run queue full, spilling to overflow");
                overflow.push(task);
                return true;
            }

            // Workers no longer pop, the slot we wait for may never free up.
            if is_shutdown() {
                return false;
            }

            wake_consumer();
            backoff.snooze();
        }
    }

    /// Finds the next task for worker `index`.
    pub(crate) fn find_task(&self, index: usize, pop_shared_first: bool) -> Option<Arc<Task>> {
        let worker = &self.workers[index];

        // Enforce fairness by force-checking the shared and overflow queues
        // with frequency `shared_queue_interval`.
        if pop_shared_first && let Some(task) = self.pop_shared().or_else(|| worker.overflow.pop())
        {
            return Some(task);
        }

        worker
            .pop_local()
            .or_else(|| self.pop_shared())
    }

    fn pop_shared(&self) -> Option<Arc<Task>> {
        self.shared_queue
            .pop()
            .or_else(|| self.shared_overflow.pop())
    }

    fn has_shared_work(&self) -> bool {
        !self.shared_queue.is_empty() || !self.shared_overflow.is_empty()
    }

    /// Parks worker `index` until there is work for it or the scheduler shuts
    /// down. Must be called from that worker's thread.
    pub(crate) fn park(&self, index: usize, is_shutdown: impl Fn() -> bool) {
        let worker = &self.workers[index];

        {
            let mut parked = self.parked.lock();

            worker.set_sleeping(true);
            self.num_parked.fetch_add(1, Ordering::SeqCst);

            // Pairs with the fence in `unpark`: either we see the new task, or
            // the pusher sees us sleeping.
            fence(Ordering::SeqCst);

            // We need to check these signals *while holding the lock* to avoid
            // race conditions with `unpark`.
            if worker.has_work() || self.has_shared_work() || is_shutdown() {
                worker.set_sleeping(false);
                self.num_parked.fetch_sub(1, Ordering::SeqCst);
                return;
            }

            worker.reset_unpark();
            parked.push_back(index);
        }

        tracing::trace!(worker = index, "parking");
        worker.wait_for_unpark();
    }

    /// Unparks worker `index` if it is parked.
    pub(crate) fn unpark(&self, index: usize) -> bool {
        fence(Ordering::SeqCst);

        let worker = &self.workers[index];
        if !worker.is_sleeping() {
            return false;
        }

        let mut parked = self.parked.lock();
        let Some(pos) = parked.iter().position(|i| *i == index) else {
            return false;
        };

        parked.remove(pos);
        self.wake(index);
        true
    }

    /// Unparks the most recently parked worker.
    pub(crate) fn unpark_one(&self) -> bool {
        fence(Ordering::SeqCst);

        if self.num_parked.load(Ordering::SeqCst) == 0 {
            return false;
        }

        match self.parked.lock().pop_back() {
            Some(index) => {
                self.wake(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn unpark_all(&self) -> usize {
        let mut parked = self.parked.lock();
        let mut num_unparked = 0;

        while let Some(index) = parked.pop_back() {
            self.wake(index);
            num_unparked += 1;
        }

        num_unparked
    }

    /// Caller holds the `parked` lock and removed `index` from the list.
    fn wake(&self, index: usize) {
        self.num_parked.fetch_sub(1, Ordering::SeqCst);
        self.workers[index].unpark();
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.num_parked.load(Ordering::SeqCst)
    }

    pub(crate) fn join_all(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock());

        let errors = handles
            .into_iter()
            .filter_map(|handle| {
                let name = handle.thread().name().map(str::to_string);
                handle.join().err().map(|_| name)
            })
            .collect::<Vec<_>>();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked: {:?}", errors.len(), errors))
        }
    }

    /// Empties every queue. Returns how many tasks were dropped.
    pub(crate) fn drain(&self) -> usize {
        let mut dropped = 0;

        while self.pop_shared().is_some() {
            dropped += 1;
        }

        for worker in self.workers.iter() {
            while worker.pop_local().is_some() {
                dropped += 1;
            }
        }

        dropped
    }

    #[cfg(test)]
    pub(crate) fn handles(&self) -> Vec<Option<String>> {
        self.handles
            .lock()
            .iter()
            .map(|h| h.thread().name().map(str::to_string))
            .collect()
    }
}
