use crate::runtime::{RuntimeConfig, Shared, Ticker, TickerData, TickerEvents};
use crate::task::{Step, Task};
use crossbeam_queue::{ArrayQueue, SegQueue};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

/// Run queues and parking state of one worker thread.
#[derive(Debug)]
pub(crate) struct Worker {
    /// Bounded run queue, filled by every thread scheduling onto this worker.
    pub(super) local: ArrayQueue<Arc<Task>>,

    /// Unbounded spill for pushes that cannot wait on a full `local`, such as
    /// a worker re-queueing its own task.
    pub(super) overflow: SegQueue<Arc<Task>>,

    /// Set while the worker is parked, or about to park.
    sleeping: AtomicBool,

    /// Set by the thread unparking this worker. Guards against spurious
    /// wakeups from `thread::park`.
    should_unpark: AtomicBool,

    thread: OnceLock<thread::Thread>,
}

impl Worker {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            local: ArrayQueue::new(capacity),
            overflow: SegQueue::new(),
            sleeping: AtomicBool::new(false),
            should_unpark: AtomicBool::new(false),
            thread: OnceLock::new(),
        }
    }

    pub(super) fn bind_current_thread(&self) {
        let _ = self.thread.set(thread::current());
    }

    /// Number of queued tasks.
    pub(crate) fn len(&self) -> usize {
        self.local.len() + self.overflow.len()
    }

    pub(super) fn has_work(&self) -> bool {
        !self.local.is_empty() || !self.overflow.is_empty()
    }

    /// Push from the worker's own thread, which must never wait on itself.
    pub(super) fn push_local(&self, task: Arc<Task>) {
        if let Err(task) = self.local.push(task) {
            self.overflow.push(task);
        }
    }

    pub(super) fn pop_local(&self) -> Option<Arc<Task>> {
        self.local.pop().or_else(|| self.overflow.pop())
    }

    pub(super) fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::SeqCst)
    }

    pub(super) fn set_sleeping(&self, val: bool) {
        self.sleeping.store(val, Ordering::SeqCst);
    }

    pub(super) fn reset_unpark(&self) {
        self.should_unpark.store(false, Ordering::SeqCst);
    }

    pub(super) fn wait_for_unpark(&self) {
        while !self.should_unpark.load(Ordering::Acquire) {
            thread::park();
        }
    }

    pub(super) fn unpark(&self) {
        self.set_sleeping(false);
        self.should_unpark.store(true, Ordering::Release);

        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

/// Worker event loop. Returns when the scheduler shuts down.
pub(super) fn run(shared: &Arc<Shared>, index: usize) {
    let mut ticker = Ticker::new();
    let mut cfg = EventLoopConfig::from(&shared.cfg);
    let mut pop_shared_first = false;

    tracing::debug!(worker = index, "worker started");

    'event_loop: loop {
        match shared.pool.find_task(index, pop_shared_first) {
            Some(task) => {
                pop_shared_first = false;
                run_task(shared, index, task);
            }
            None => shared.pool.park(index, || shared.is_shutdown()),
        }

        let events = ticker.tick(shared, &mut cfg);
        match process_ticker_events(events, &mut pop_shared_first) {
            ControlFlow::Break(()) => break 'event_loop,
            ControlFlow::Continue(()) => {}
        }
    }

    tracing::debug!(worker = index, "worker stopped");
}

fn process_ticker_events(events: TickerEvents, pop_shared_first: &mut bool) -> ControlFlow<()> {
    if events.contains(TickerEvents::SHUTDOWN) {
        return ControlFlow::Break(());
    }

    // Enforce fairness for tasks waiting in the shared and overflow queues.
    if events.contains(TickerEvents::POP_SHARED_QUEUE) {
        *pop_shared_first = true;
    }

    ControlFlow::Continue(())
}

fn run_task(shared: &Shared, index: usize, task: Arc<Task>) {
    match task.run() {
        Step::Done | Step::Skipped => {}
        Step::Failed(err) => {
            tracing::error!(
                task.id = %task.id(),
                task.name = task.name(),
                worker = index,
                "task failed: {err}"
            );
        }
        Step::Notified => {
            // Woken during its own step, back of the line.
            shared.requeue(index, task);
        }
        Step::Paused => {
            // The resource may have changed between the last check of the
            // future and the pause being recorded.
            if let Some(pause) = task.pause_reason()
                && !pause.is_valid()
            {
                task.resume();
            }
        }
    }

    shared.task_finished_step();
}

#[derive(Debug, Clone)]
struct EventLoopConfig {
    shared_queue_interval: u32,
}

impl EventLoopConfig {
    #[inline(always)]
    fn should_pop_shared_queue(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.shared_queue_interval)
    }
}

impl From<&RuntimeConfig> for EventLoopConfig {
    fn from(cfg: &RuntimeConfig) -> EventLoopConfig {
        EventLoopConfig {
            shared_queue_interval: cfg.shared_queue_interval,
        }
    }
}

impl TickerData for EventLoopConfig {
    type Context = Arc<Shared>;

    #[inline(always)]
    fn update_and_check(&mut self, shared: &Self::Context, tick: u32) -> TickerEvents {
        // Fast-path to enforce shutdown
        if shared.is_shutdown() {
            return TickerEvents::SHUTDOWN;
        }

        let mut events = TickerEvents::empty();
        events.set(
            TickerEvents::POP_SHARED_QUEUE,
            self.should_pop_shared_queue(tick),
        );
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_task;

    #[test]
    fn test_push_local_spills_when_full() {
        let worker = Worker::new(2);
        let tasks = (0..4)
            .map(|_| mock_task(async {}).0)
            .collect::<Vec<_>>();

        for task in &tasks {
            worker.push_local(Arc::clone(task));
        }

        assert_eq!(worker.local.len(), 2);
        assert_eq!(worker.overflow.len(), 2);
        assert_eq!(worker.len(), 4);

        // Bounded queue first, then the spill, each in FIFO order.
        let popped = std::iter::from_fn(|| worker.pop_local())
            .map(|t| t.id())
            .collect::<Vec<_>>();
        let expected = tasks.iter().map(|t| t.id()).collect::<Vec<_>>();
        assert_eq!(popped, expected);
        assert!(!worker.has_work());
    }

    #[test]
    fn test_unpark_before_wait_does_not_block() {
        let worker = Worker::new(1);
        worker.bind_current_thread();

        worker.set_sleeping(true);
        worker.reset_unpark();
        worker.unpark();

        assert!(!worker.is_sleeping());
        worker.wait_for_unpark();
    }

    #[test]
    fn test_shared_queue_interval_events() {
        let cfg = EventLoopConfig {
            shared_queue_interval: 4,
        };
        assert!(cfg.should_pop_shared_queue(8));
        assert!(!cfg.should_pop_shared_queue(9));

        let mut pop = false;
        let events = TickerEvents::POP_SHARED_QUEUE;
        assert!(process_ticker_events(events, &mut pop).is_continue());
        assert!(pop);

        assert!(process_ticker_events(TickerEvents::SHUTDOWN, &mut pop).is_break());
    }
}
