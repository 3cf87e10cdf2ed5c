// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! End-to-end scenarios exercising the coordination primitives together
//! with the executor and its timer service, with wall-clock assertions.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::{Duration, Instant},
};

use fiber_sync::{
    spawn_local,
    sync::{CountDownLatch, KeyedMap, ReadWriteLock, Semaphore},
    timer::sleep,
    yield_now, LocalExecutor, SyncError,
};

fn assert_in_window(elapsed: Duration, low: u64, high: u64) {
    assert!(
        elapsed >= Duration::from_millis(low),
        "completed too early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(high),
        "completed too late: {elapsed:?}"
    );
}

#[test]
fn semaphore_single_flight_release() {
    LocalExecutor::new().run(async {
        let sem = Rc::new(Semaphore::new(0).unwrap());
        let start = Instant::now();

        for delay in [20, 50] {
            let sem = sem.clone();
            let _ = spawn_local(async move {
                sleep(Duration::from_millis(delay)).await;
                sem.release(1).unwrap();
            });
        }

        sem.acquire(2).await.unwrap();
        // Two permits only exist after the second release at t=50.
        assert_in_window(start.elapsed(), 50, 150);
        assert_eq!(sem.available_permits(), 0);
        assert_eq!(sem.waiter_count(), 0);
    });
}

#[test]
fn semaphore_drain_with_queue() {
    LocalExecutor::new().run(async {
        let sem = Rc::new(Semaphore::new(0).unwrap());

        let first = spawn_local({
            let sem = sem.clone();
            async move { sem.acquire(3).await.unwrap() }
        });
        yield_now().await;
        let second = spawn_local({
            let sem = sem.clone();
            async move { sem.acquire(3).await.unwrap() }
        });
        yield_now().await;
        assert_eq!(sem.waiter_count(), 2);

        sem.release(5).unwrap();
        first.await;
        assert_eq!(sem.available_permits(), 2);
        assert_eq!(sem.waiter_count(), 1);

        sem.release(1).unwrap();
        second.await;
        assert_eq!(sem.available_permits(), 0);
        assert_eq!(sem.waiter_count(), 0);
    });
}

#[test]
fn latch_timeout_semantics() {
    LocalExecutor::new().run(async {
        let latch = CountDownLatch::new(1).unwrap();

        // A zero timeout on a closed latch fails without waiting.
        let start = Instant::now();
        assert!(matches!(
            latch.wait_timeout(Duration::ZERO).await,
            Err(SyncError::TimedOut)
        ));
        assert!(start.elapsed() < Duration::from_millis(20));

        let start = Instant::now();
        let err = latch
            .wait_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Timeout expired");
        assert_in_window(start.elapsed(), 50, 150);

        latch.count_down();
        latch.wait().await;
        latch.wait_timeout(Duration::ZERO).await.unwrap();
    });
}

#[test]
fn read_write_fair_starvation_prevention() {
    LocalExecutor::new().run(async {
        let lock = Rc::new(ReadWriteLock::new());
        let start = Instant::now();

        let first = lock.read().await;

        let writer = spawn_local({
            let lock = lock.clone();
            async move {
                let mut w = lock.write().await;
                sleep(Duration::from_millis(50)).await;
                w.release().unwrap();
            }
        });
        yield_now().await;
        assert_eq!(lock.waiting_writers(), 1);

        let held = Rc::new(RefCell::new(Vec::new()));
        let mut readers = Vec::new();
        for _ in 0..10 {
            let lock = lock.clone();
            let held = held.clone();
            readers.push(spawn_local(async move {
                let handle = lock.read().await;
                held.borrow_mut().push(handle);
            }));
        }
        yield_now().await;
        // Fair mode: all ten queue up behind the writer.
        assert_eq!(lock.waiting_readers(), 10);

        drop(first);
        for reader in readers {
            reader.await;
        }
        writer.await;

        assert_in_window(start.elapsed(), 50, 150);
        assert_eq!(lock.read_count(), 10);
        assert_eq!(lock.waiting_writers(), 0);
        held.borrow_mut().clear();
    });
}

#[test]
fn read_write_non_fair_read_bypass() {
    LocalExecutor::new().run(async {
        let lock = Rc::new(ReadWriteLock::with_fairness(false));

        let first = lock.read().await;
        let _ = spawn_local({
            let lock = lock.clone();
            async move {
                let _w = lock.write().await;
            }
        });
        yield_now().await;
        assert_eq!(lock.waiting_writers(), 1);

        let start = Instant::now();
        let mut bypassers = Vec::new();
        for _ in 0..10 {
            bypassers.push(lock.read().await);
        }
        // The reads never suspended.
        assert!(start.elapsed() < Duration::from_millis(20));
        assert_eq!(lock.read_count(), 11);
        assert_eq!(lock.waiting_writers(), 1);

        drop(first);
        drop(bypassers);
    });
}

#[test]
fn map_single_flight_compute() {
    LocalExecutor::new().run(async {
        let map: KeyedMap<i32, String> = KeyedMap::new();
        let invocations = Rc::new(Cell::new(0));

        let mut calls = Vec::new();
        for _ in 0..2 {
            let map = map.clone();
            let invocations = invocations.clone();
            calls.push(spawn_local(async move {
                map.compute_if_absent(1, move |k| {
                    invocations.set(invocations.get() + 1);
                    async move {
                        sleep(Duration::from_millis(5)).await;
                        Ok(Some(k.to_string()))
                    }
                })
                .await
                .unwrap()
            }));
        }

        for call in calls {
            assert_eq!(call.await.as_deref(), Some("1"));
        }
        assert_eq!(invocations.get(), 1);
    });
}

#[test]
fn map_ordering_under_delay() {
    LocalExecutor::new().run(async {
        let map: KeyedMap<i32, i32> = KeyedMap::new();
        for k in 0..5 {
            let _ = map.insert(k, k * 2).await;
        }

        let mut updates = Vec::new();
        for k in 0..5 {
            let map = map.clone();
            updates.push(spawn_local(async move {
                map.compute(k, move |key, _old| async move {
                    sleep(Duration::from_millis(20)).await;
                    Ok(Some(key + 10))
                })
                .await
                .unwrap();
            }));
        }
        yield_now().await;

        // The computes are still sleeping; snapshots show the old values.
        for k in 0..5 {
            assert_eq!(map.get(&k), Some(k * 2));
        }

        for update in updates {
            update.await;
        }
        for k in 0..5 {
            assert_eq!(map.get(&k), Some(k + 10));
        }
        assert_eq!(map.len(), 5);
    });
}

#[test]
fn map_clear_with_pending() {
    LocalExecutor::new().run(async {
        let map: KeyedMap<i32, i32> = KeyedMap::new();
        for k in 0..5 {
            let _ = map.insert(k, k * 2).await;
        }

        let finished = Rc::new(Cell::new(0));
        let mut updates = Vec::new();
        for k in 0..5 {
            let map = map.clone();
            let finished = finished.clone();
            updates.push(spawn_local(async move {
                map.compute(k, move |key, _old| async move {
                    sleep(Duration::from_millis(10)).await;
                    Ok(Some(key + 10))
                })
                .await
                .unwrap();
                finished.set(finished.get() + 1);
            }));
        }
        yield_now().await;

        let done = map.clear();
        assert_eq!(map.len(), 0);

        done.await;
        // The clear completion waited for every pending compute.
        assert_eq!(finished.get(), 5);
        for update in updates {
            update.await;
        }
        assert_eq!(map.len(), 0);
        assert!(map.entries().is_empty());
    });
}
