use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskpool::{Event, Invokable, JobId, PoolError, SubmitMode, ThreadPool, INFINITE_TIMEOUT};

#[test]
fn every_submitted_job_completes() {
    let pool = ThreadPool::new(4);
    let counter = Arc::new(AtomicU32::new(0));

    let handles: Vec<JobId> = (0..100)
        .map(|_| {
            let counter = Arc::clone(&counter);
            pool.submit(
                Invokable::new(move |_tid| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }),
                SubmitMode::Blocking,
            )
            .unwrap()
        })
        .collect();

    for handle in handles {
        assert_eq!(pool.wait_for_job(handle, 10_000), Ok(()));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

#[test]
fn wait_on_unknown_handle_is_not_owned() {
    let pool = ThreadPool::new(1);
    let handle = pool
        .submit(Invokable::new(|_| true), SubmitMode::Blocking)
        .unwrap();
    assert_eq!(pool.wait_for_job(handle, 10_000), Ok(()));
    // Entry was consumed by the successful wait.
    assert_eq!(
        pool.wait_for_job(handle, 10_000),
        Err(PoolError::NotOwned)
    );
}

#[test]
fn wait_from_worker_thread_is_rejected() {
    let pool = Arc::new(ThreadPool::new(2));

    let sibling = pool
        .submit(
            Invokable::new(move |_| {
                std::thread::sleep(Duration::from_millis(50));
                true
            }),
            SubmitMode::Blocking,
        )
        .unwrap();

    let inner_result = Arc::new(parking_lot::Mutex::new(None));
    let worker_pool = Arc::clone(&pool);
    let worker_result = Arc::clone(&inner_result);
    let guard_probe = pool
        .submit(
            Invokable::new(move |_| {
                *worker_result.lock() =
                    Some(worker_pool.wait_for_job(sibling, INFINITE_TIMEOUT));
                true
            }),
            SubmitMode::Blocking,
        )
        .unwrap();

    assert_eq!(pool.wait_for_job(guard_probe, 10_000), Ok(()));
    assert_eq!(*inner_result.lock(), Some(Err(PoolError::DeadlockGuard)));
    assert_eq!(pool.wait_for_job(sibling, 10_000), Ok(()));
}

#[test]
fn group_event_fires_when_last_member_completes() {
    let pool = ThreadPool::new(4);
    let counter = Arc::new(AtomicU32::new(0));

    let members: Vec<Invokable> = (0..16)
        .map(|_| {
            let counter = Arc::clone(&counter);
            Invokable::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
        })
        .collect();

    let group = pool.submit_group(members, SubmitMode::Blocking).unwrap();
    assert_eq!(pool.wait_for_group(group, 10_000), Ok(()));
    assert_eq!(counter.load(Ordering::SeqCst), 16);
}

#[test]
fn nonblocking_submit_on_full_queue_is_busy() {
    // One worker stalled on a gate plus a one-slot queue: the second submit
    // lands in the queue, the third must report Busy.
    let pool = ThreadPool::with_queue_capacity(1, 1);
    let gate = Arc::new(Event::new());

    let stalled = {
        let gate = Arc::clone(&gate);
        pool.submit(
            Invokable::new(move |_| {
                gate.wait(INFINITE_TIMEOUT).is_ok()
            }),
            SubmitMode::Blocking,
        )
        .unwrap()
    };

    // Give the worker time to pick up the stalled job so the queue is empty.
    std::thread::sleep(Duration::from_millis(50));
    let queued = pool
        .submit(Invokable::new(|_| true), SubmitMode::NonBlocking)
        .unwrap();
    assert_eq!(
        pool.submit(Invokable::new(|_| true), SubmitMode::NonBlocking)
            .unwrap_err(),
        PoolError::Busy
    );

    gate.set();
    assert_eq!(pool.wait_for_job(stalled, 10_000), Ok(()));
    assert_eq!(pool.wait_for_job(queued, 10_000), Ok(()));
}

#[test]
fn blocking_submit_eventually_succeeds_once_drained() {
    let pool = ThreadPool::with_queue_capacity(1, 1);
    let gate = Arc::new(Event::new());

    let stalled = {
        let gate = Arc::clone(&gate);
        pool.submit(
            Invokable::new(move |_| gate.wait(INFINITE_TIMEOUT).is_ok()),
            SubmitMode::Blocking,
        )
        .unwrap()
    };
    std::thread::sleep(Duration::from_millis(50));
    let queued = pool
        .submit(Invokable::new(|_| true), SubmitMode::NonBlocking)
        .unwrap();

    // The queue is now full; a blocking submit must park until the stalled
    // worker drains it.
    let opened = {
        let gate = Arc::clone(&gate);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            gate.set();
        })
    };
    let late = pool
        .submit(Invokable::new(|_| true), SubmitMode::Blocking)
        .unwrap();

    opened.join().unwrap();
    for handle in [stalled, queued, late] {
        assert_eq!(pool.wait_for_job(handle, 10_000), Ok(()));
    }
}

#[test]
fn wait_with_zero_timeout_returns_immediately() {
    let pool = ThreadPool::new(1);
    let gate = Arc::new(Event::new());
    let handle = {
        let gate = Arc::clone(&gate);
        pool.submit(
            Invokable::new(move |_| gate.wait(INFINITE_TIMEOUT).is_ok()),
            SubmitMode::Blocking,
        )
        .unwrap()
    };

    assert_eq!(pool.wait_for_job(handle, 0), Err(PoolError::Timeout));

    // The timeout kept the entry alive; a later wait still completes.
    gate.set();
    assert_eq!(pool.wait_for_job(handle, 10_000), Ok(()));
}

#[test]
fn with_context_invokable_runs() {
    struct Ctx {
        hits: AtomicU32,
    }
    fn body(ctx: &Ctx, _tid: u32) -> bool {
        ctx.hits.fetch_add(1, Ordering::SeqCst);
        true
    }

    let pool = ThreadPool::new(2);
    let ctx = Arc::new(Ctx {
        hits: AtomicU32::new(0),
    });
    let handle = pool
        .submit(Invokable::with_context(Arc::clone(&ctx), body), SubmitMode::Blocking)
        .unwrap();
    assert_eq!(pool.wait_for_job(handle, 10_000), Ok(()));
    assert_eq!(ctx.hits.load(Ordering::SeqCst), 1);
}

#[test]
fn drop_joins_workers_with_jobs_in_flight() {
    let counter = Arc::new(AtomicU32::new(0));
    {
        let pool = ThreadPool::new(2);
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.submit(
                Invokable::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }),
                SubmitMode::Blocking,
            )
            .unwrap();
        }
        // Dropped with work possibly still queued; drop must not hang.
    }
    // No assertion on the exact count: jobs received before the exit flag ran,
    // the rest were intentionally dropped during shutdown.
    assert!(counter.load(Ordering::SeqCst) <= 8);
}
