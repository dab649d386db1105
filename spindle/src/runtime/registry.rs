use crate::task::{Id, Task};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// Every live task owned by a scheduler.
//
// Run queues and wakers hold the task only while it is runnable or paused on
// a resource. The registry holds it for its whole life, which is what lets
// shutdown find and cancel tasks that are paused on a mailbox nobody will ever
// touch again.
#[derive(Debug)]
pub(crate) struct OwnedTasks {
    tasks: DashMap<Id, Arc<Task>>,

    // Keep track of size separately because DashMap impl for len iterates over
    // all shards.
    size: AtomicUsize,

    // Closed on shutdown, so no task is added after the final sweep.
    closed: AtomicBool,
}

impl OwnedTasks {
    pub(crate) fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            size: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Adds a new task. Returns `false` if the registry is closed, in which
    /// case the caller owns cancelling the task.
    pub(crate) fn insert(&self, task: Arc<Task>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        if self.tasks.insert(task.id(), task).is_none() {
            self.size.fetch_add(1, Ordering::Relaxed);
        }

        // Shutdown may have swept the shards between the check and the insert.
        if self.closed.load(Ordering::Acquire) {
            self.shutdown_all();
        }

        true
    }

    pub(crate) fn remove(&self, id: &Id) -> Option<Arc<Task>> {
        self.tasks.remove(id).map(|(_id, task)| {
            self.size.fetch_sub(1, Ordering::Relaxed);
            task
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the registry and cancels every task still in it. Returns how
    /// many tasks were cancelled.
    pub(crate) fn shutdown_all(&self) -> usize {
        self.closed.store(true, Ordering::Release);

        // Leverage dashmap `raw-api` for more efficient locking and draining.
        let tasks = self
            .tasks
            .shards()
            .iter()
            .fold(Vec::new(), |mut acc, shard| {
                acc.extend(shard.write().drain());
                acc
            });

        self.size.fetch_sub(tasks.len(), Ordering::Relaxed);

        // Cancel outside the shard locks: dropping a future may touch mailboxes
        // and timers.
        tasks
            .into_iter()
            .filter(|(_id, task)| task.get().cancel())
            .count()
    }
}
