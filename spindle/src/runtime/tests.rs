use super::*;
use crate as spindle;
use crate::context;
use crate::mailbox::Mailbox;
use crate::task::{JoinError, JoinHandle, Lifecycle};
use crate::test_utils::{init_scheduler, wait_until};
use crate::time::{sleep, yield_now};
use crate::utils::thread::get_current_thread_name;
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

assert_impl_all!(Scheduler: Send, Sync, Clone);
assert_impl_all!(SpawnBuilder: Send);

/// Index of the worker running the current task.
fn current_worker() -> Option<usize> {
    context::scheduler().and_then(|s| context::current_worker_of(s.shared()))
}

#[test]
fn test_worker_thread_names() -> Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));
    let scheduler = {
        let counter = Arc::clone(&counter);
        Builder::new()
            .worker_threads(3)
            .thread_name_fn(move || format!("pool-{}", counter.fetch_add(1, Ordering::Relaxed)))
            .try_build()?
    };

    let names = scheduler.shared().pool.handles();
    assert_eq!(
        names,
        vec![
            Some("pool-0".to_string()),
            Some("pool-1".to_string()),
            Some("pool-2".to_string())
        ]
    );

    let os_name = scheduler
        .spawn_builder()
        .affinity(1)
        .spawn(async { get_current_thread_name() })
        .join()??;
    assert_eq!(os_name, "pool-1");

    scheduler.shutdown()
}

#[rstest]
#[case::round_robin(Dispatch::RoundRobin)]
#[case::least_loaded(Dispatch::LeastLoaded)]
#[case::shared(Dispatch::Shared)]
fn test_dispatch_runs_every_task(#[case] dispatch: Dispatch) -> Result<()> {
    let scheduler = Builder::new()
        .worker_threads(4)
        .dispatch(dispatch)
        .try_build()?;

    let counter = Arc::new(AtomicUsize::new(0));
    let handles = (0..1000)
        .map(|i| {
            let counter = Arc::clone(&counter);
            scheduler.spawn(async move {
                yield_now().await;
                counter.fetch_add(1, Ordering::Relaxed);
                i
            })
        })
        .collect::<Vec<_>>();

    let sum = handles
        .into_iter()
        .map(JoinHandle::join)
        .sum::<Result<usize, JoinError>>()?;

    assert_eq!(sum, (0..1000).sum());
    assert_eq!(counter.load(Ordering::Relaxed), 1000);

    scheduler.shutdown()
}

#[test]
fn test_round_robin_uses_every_worker() -> Result<()> {
    let scheduler = init_scheduler(3)?;

    let workers = (0..30)
        .map(|_| scheduler.spawn(async { current_worker() }))
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join())
        .collect::<Result<HashSet<_>, _>>()?;

    assert_eq!(workers, HashSet::from([Some(0), Some(1), Some(2)]));
    scheduler.shutdown()
}

#[spindle::test(worker_threads = 4)]
async fn test_affinity_survives_pauses() -> Result<()> {
    let handles = (0..4)
        .map(|index| {
            spindle::spawn_builder().affinity(index).spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..10 {
                    seen.push(current_worker());
                    yield_now().await;
                    sleep(Duration::from_millis(1))?.await?;
                }
                Ok::<_, anyhow::Error>((index, seen))
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        let (index, seen) = handle.await??;
        assert!(seen.iter().all(|w| *w == Some(index)), "{index}: {seen:?}");
    }

    Ok(())
}

#[test]
fn test_invalid_affinity_is_rejected() -> Result<()> {
    let scheduler = init_scheduler(2)?;

    let res = scheduler.spawn_builder().affinity(2).try_spawn(async {});
    assert_eq!(
        res.err(),
        Some(SpawnError::InvalidAffinity {
            index: 2,
            num_workers: 2
        })
    );

    let handle = scheduler.spawn_builder().affinity(5).spawn(async {});
    assert!(handle.join().is_err_and(|e| e.is_rejected()));

    scheduler.shutdown()
}

#[spindle::test(worker_threads = 2)]
async fn test_failure_is_isolated() {
    let failing = spindle::spawn(async {
        yield_now().await;
        let fail = true;
        assert!(!fail, "task blew up");
        0
    });
    let healthy = spindle::spawn(async {
        yield_now().await;
        "still fine"
    });

    let err = failing.await.unwrap_err();
    assert!(err.is_failed());
    assert!(err.to_string().contains("task blew up"));

    assert_eq!(healthy.await, Ok("still fine"));

    // The worker that caught the panic keeps serving tasks.
    let after = spindle::spawn_builder().affinity(0).spawn(async { 1 });
    assert_eq!(after.await, Ok(1));
}

#[spindle::test(worker_threads = 3, dispatch = "least_loaded")]
async fn test_entry_attribute_configures_scheduler() {
    let scheduler = context::scheduler().expect("block_on enters the scheduler");
    assert_eq!(scheduler.num_workers(), 3);
    assert_eq!(scheduler.shared().cfg.dispatch, Dispatch::LeastLoaded);

    let handle = spindle::spawn(async { current_worker() });
    assert!(handle.await.is_ok_and(|w| w.is_some_and(|w| w < 3)));
}

#[spindle::test(worker_threads = 2)]
async fn test_task_id_matches_handle() {
    let handle = spindle::spawn(async { crate::task::id() });
    let id = handle.id();
    assert_eq!(handle.await, Ok(id));
    assert!(crate::task::try_id().is_none());
}

#[test]
fn test_spawn_after_shutdown() -> Result<()> {
    let scheduler = init_scheduler(1)?;
    scheduler.shutdown()?;
    assert!(scheduler.is_shutdown());

    assert_eq!(
        scheduler.try_spawn(async {}).err(),
        Some(SpawnError::Shutdown)
    );

    let handle = scheduler.spawn(async { 1 });
    assert_eq!(handle.lifecycle(), Lifecycle::Cancelled);
    assert!(handle.join().is_err_and(|e| e.is_rejected()));

    // Idempotent.
    scheduler.shutdown()
}

#[test]
fn test_shutdown_cancels_paused_tasks() -> Result<()> {
    let scheduler = init_scheduler(2)?;
    let mailbox = Mailbox::<u32>::new(4);

    let consumer = {
        let mailbox = mailbox.clone();
        scheduler.spawn(async move { mailbox.get().await })
    };

    assert!(wait_until(
        || consumer.lifecycle() == Lifecycle::Paused,
        Duration::from_secs(5)
    ));

    scheduler.shutdown()?;

    assert_eq!(consumer.lifecycle(), Lifecycle::Cancelled);
    assert!(consumer.join().is_err_and(|e| e.is_cancelled()));

    // The mailbox outlives its cancelled consumer.
    assert!(mailbox.try_put(1).is_ok());
    assert_eq!(mailbox.try_get(), Some(1));
    Ok(())
}

#[test]
fn test_shutdown_from_task() -> Result<()> {
    let scheduler = init_scheduler(2)?;

    let handle = scheduler.spawn(async {
        context::scheduler().map(|s| s.shutdown().is_ok())
    });

    assert_eq!(handle.join(), Ok(Some(true)));
    assert!(wait_until(|| scheduler.is_shutdown(), Duration::from_secs(5)));

    // Already shutting down on the helper thread.
    scheduler.shutdown()
}

#[test]
fn test_idle_workers_park_and_wake() -> Result<()> {
    let scheduler = init_scheduler(3)?;
    let pool = &scheduler.shared().pool;

    assert!(wait_until(|| pool.num_parked() == 3, Duration::from_secs(5)));
    assert!(scheduler.is_idle());

    let handle = scheduler.spawn_builder().affinity(2).spawn(async { 7 });
    assert_eq!(handle.join(), Ok(7));

    assert!(wait_until(|| pool.num_parked() == 3, Duration::from_secs(5)));
    scheduler.shutdown()
}

#[test]
fn test_idledown_waits_for_sleepers() -> Result<()> {
    let scheduler = init_scheduler(2)?;
    let done = Arc::new(AtomicUsize::new(0));

    for i in 1..=5 {
        let done = Arc::clone(&done);
        scheduler.spawn(async move {
            sleep(Duration::from_millis(10 * i))?.await?;
            done.fetch_add(1, Ordering::Relaxed);
            Ok::<_, anyhow::Error>(())
        });
    }

    scheduler.idledown()?;

    assert!(scheduler.is_shutdown());
    assert_eq!(done.load(Ordering::Relaxed), 5);
    Ok(())
}

#[test]
fn test_idledown_ignores_forgotten_mailboxes() -> Result<()> {
    let scheduler = init_scheduler(1)?;
    let mailbox = Mailbox::<()>::new(1);

    let stuck = {
        let mailbox = mailbox.clone();
        scheduler.spawn(async move { mailbox.get().await })
    };

    assert!(scheduler.idledown_timeout(Duration::from_secs(5))?);
    assert!(stuck.join().is_err_and(|e| e.is_cancelled()));
    Ok(())
}

#[test]
fn test_idledown_timeout_expires() -> Result<()> {
    let scheduler = init_scheduler(1)?;

    let sleeper = scheduler.spawn(async {
        sleep(Duration::from_secs(60))?.await?;
        Ok::<_, anyhow::Error>(())
    });

    assert!(!scheduler.idledown_timeout(Duration::from_millis(50))?);
    assert!(scheduler.is_shutdown());
    assert!(scheduler.timer_service().is_shutdown());
    assert!(sleeper.join().is_err_and(|e| e.is_cancelled()));
    Ok(())
}

#[test]
fn test_block_on_from_worker_panics() -> Result<()> {
    let scheduler = init_scheduler(1)?;

    let handle = {
        let inner = scheduler.clone();
        scheduler.spawn(async move { inner.block_on(async { 1 }) })
    };

    let err = handle.join().unwrap_err();
    assert!(err.is_failed());
    assert!(err.to_string().contains("cannot block a worker thread"));

    scheduler.shutdown()
}

#[test]
fn test_block_on_talks_to_tasks() -> Result<()> {
    let scheduler = init_scheduler(2)?;
    let requests = Mailbox::<u64>::new(2);
    let replies = Mailbox::<u64>::new(2);

    let server = {
        let (requests, replies) = (requests.clone(), replies.clone());
        scheduler.spawn(async move {
            for _ in 0..100 {
                let n = requests.get().await;
                replies.put(n * 2).await;
            }
        })
    };

    let total = scheduler.block_on(async {
        let mut total = 0;
        for n in 0..100 {
            requests.put(n).await;
            total += replies.get().await;
        }
        total
    });

    assert_eq!(total, 2 * (0..100).sum::<u64>());
    assert_eq!(server.join(), Ok(()));
    scheduler.shutdown()
}

#[rstest]
#[case::round_robin(Dispatch::RoundRobin)]
#[case::shared(Dispatch::Shared)]
fn test_full_run_queues_apply_backpressure(#[case] dispatch: Dispatch) -> Result<()> {
    let scheduler = Builder::new()
        .worker_threads(2)
        .run_queue_capacity(2)
        .dispatch(dispatch)
        .try_build()?;

    let counter = Arc::new(AtomicUsize::new(0));

    // Workers fan out onto each other's full queues while the main thread
    // keeps pushing.
    let parents = (0..50)
        .map(|_| {
            let counter = Arc::clone(&counter);
            scheduler.spawn(async move {
                let children = (0..20)
                    .map(|_| {
                        let counter = Arc::clone(&counter);
                        spindle::spawn(async move {
                            yield_now().await;
                            counter.fetch_add(1, Ordering::Relaxed);
                        })
                    })
                    .collect::<Vec<_>>();

                for child in children {
                    child.await?;
                }
                Ok::<_, JoinError>(())
            })
        })
        .collect::<Vec<_>>();

    for parent in parents {
        parent.join()??;
    }

    assert_eq!(counter.load(Ordering::Relaxed), 50 * 20);
    scheduler.shutdown()
}

#[test]
fn test_spawners_blocked_on_full_queue_return_at_shutdown() -> Result<()> {
    let scheduler = Builder::new()
        .worker_threads(1)
        .run_queue_capacity(1)
        .try_build()?;

    // Keep the only worker busy so its queue stays full.
    let busy = Arc::new(AtomicUsize::new(0));
    let blocker = {
        let busy = Arc::clone(&busy);
        scheduler.spawn(async move {
            busy.store(1, Ordering::Release);
            std::thread::sleep(Duration::from_millis(200));
        })
    };
    assert!(wait_until(
        || busy.load(Ordering::Acquire) == 1,
        Duration::from_secs(3)
    ));

    let (tx, rx) = std::sync::mpsc::channel();
    let spawners = (0..4)
        .map(|_| {
            let scheduler = scheduler.clone();
            let tx = tx.clone();
            std::thread::spawn(move || {
                let handle = scheduler.spawn(async {});
                let _ = tx.send(handle.join());
            })
        })
        .collect::<Vec<_>>();
    drop(tx);

    std::thread::sleep(Duration::from_millis(20));
    scheduler.shutdown()?;

    for _ in 0..4 {
        match rx.recv_timeout(Duration::from_secs(3)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => assert!(e.is_cancelled() || e.is_rejected(), "{e}"),
            Err(e) => panic!("spawner stuck after shutdown: {e}"),
        }
    }

    for spawner in spawners {
        spawner.join().unwrap();
    }
    assert!(blocker.is_finished());
    assert!(scheduler.is_idle());
    Ok(())
}

#[test]
fn test_default_scheduler_lifecycle() -> Result<()> {
    default::shutdown()?;

    // Not on a scheduler thread: falls back to the default one.
    assert_eq!(spindle::spawn(async { 5 }).join(), Ok(5));

    let first = default::get()?;
    assert!(default::get()?.is(first.shared()));

    let custom = init_scheduler(1)?;
    let previous = default::set(custom.clone());
    assert!(previous.is_some_and(|p| p.is(first.shared())));
    assert!(default::get()?.is(custom.shared()));
    first.shutdown()?;

    default::shutdown()?;
    assert!(custom.is_shutdown());

    // A shut down default is replaced on next use.
    let rebuilt = default::get()?;
    assert!(!rebuilt.is(custom.shared()));
    assert!(!rebuilt.is_shutdown());
    default::shutdown()
}
