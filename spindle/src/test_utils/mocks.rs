use crate::runtime::{Schedule, SpawnOpts};
use crate::task::{JoinHandle, Task};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};

/// Records every task handed to it instead of running anything.
#[derive(Debug, Default)]
pub(crate) struct DummyScheduler {
    scheduled: Mutex<Vec<Arc<Task>>>,
    released: AtomicUsize,
}

impl DummyScheduler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn pop(&self) -> Option<Arc<Task>> {
        let mut scheduled = self.scheduled.lock();
        if scheduled.is_empty() {
            None
        } else {
            Some(scheduled.remove(0))
        }
    }

    pub(crate) fn num_scheduled(&self) -> usize {
        self.scheduled.lock().len()
    }

    pub(crate) fn num_released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }
}

impl Schedule for DummyScheduler {
    fn schedule(&self, task: Arc<Task>) {
        self.scheduled.lock().push(task);
    }

    fn release(&self, _task: &Task) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Creates a task bound to a fresh [`DummyScheduler`]. The task starts in the
/// scheduled state but is not queued anywhere.
pub(crate) fn mock_task<F>(future: F) -> (Arc<Task>, JoinHandle<F::Output>, Arc<DummyScheduler>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let scheduler = DummyScheduler::new();
    let (task, join) =
        crate::task::new_task(future, SpawnOpts::default(), scheduler.clone());
    (task, join, scheduler)
}

#[derive(Debug, Default)]
pub(crate) struct WakerData {
    pub wake_count: AtomicUsize,
}

impl WakerData {
    pub(crate) fn get_count(&self) -> usize {
        self.wake_count.load(Ordering::Relaxed)
    }
}

impl Wake for WakerData {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// A waker that counts how many times it was woken.
pub(crate) fn mock_waker() -> (Waker, Arc<WakerData>) {
    let data = Arc::new(WakerData::default());
    (Waker::from(Arc::clone(&data)), data)
}

struct FnWaker<F>(F);

impl<F: Fn() + Send + Sync + 'static> Wake for FnWaker<F> {
    fn wake(self: Arc<Self>) {
        (self.0)();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        (self.0)();
    }
}

/// A waker that runs `f` every time it is woken.
pub(crate) fn fn_waker<F>(f: F) -> Waker
where
    F: Fn() + Send + Sync + 'static,
{
    Waker::from(Arc::new(FnWaker(f)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_waker_counts() {
        let (waker1, waker_data) = mock_waker();
        waker1.wake_by_ref();
        assert_eq!(waker_data.get_count(), 1);

        let waker2 = waker1.clone();
        waker2.wake();
        assert_eq!(waker_data.get_count(), 2);

        drop(waker1);
        assert_eq!(waker_data.get_count(), 2);
    }
}
