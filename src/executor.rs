// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! Single-threaded cooperative executor.
//!
//! [`LocalExecutor`] drives fibers to completion on the thread that created
//! it. There is no preemption: a fiber runs until it returns `Pending`, and
//! every state transition in the `sync` primitives happens between
//! suspension points. Wakers never run fibers inline; they enqueue them on
//! the run queue so the woken fiber observes state changes only after the
//! current callback has returned.
//!
//! The executor also owns the timer service consumed by
//! [`Timer`](crate::timer::Timer): an ordered map of deadlines that is
//! polled on every scheduler iteration and slept on when nothing is
//! runnable.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use ahash::AHashMap;
use log::trace;
use scoped_tls::scoped_thread_local;

use crate::task::{waker_fn::waker_fn, JoinHandle, RunQueue, Task};

scoped_thread_local!(static LOCAL_EX: LocalExecutor);

/// An ordered map of registered timers.
///
/// Timers are kept in the order in which they fire. The `u64` in the key is
/// a timer id used to distinguish timers that fire at the same time; the
/// [`Waker`] represents the fiber awaiting the timer.
pub(crate) struct Timers {
    timer_id: u64,
    timers_by_id: AHashMap<u64, Instant>,
    timers: BTreeMap<(Instant, u64), Waker>,
}

impl Timers {
    fn new() -> Timers {
        Timers {
            timer_id: 0,
            timers_by_id: AHashMap::new(),
            timers: BTreeMap::new(),
        }
    }

    pub(crate) fn new_id(&mut self) -> u64 {
        self.timer_id += 1;
        self.timer_id
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<Waker> {
        if let Some(when) = self.timers_by_id.remove(&id) {
            return self.timers.remove(&(when, id));
        }
        None
    }

    pub(crate) fn insert(&mut self, id: u64, when: Instant, waker: Waker) {
        if let Some(when) = self.timers_by_id.get(&id) {
            self.timers.remove(&(*when, id));
        }
        self.timers_by_id.insert(id, when);
        self.timers.insert((when, id), waker);
    }

    /// Wakes every timer that is due and returns the duration until the next
    /// deadline together with the number of timers woken.
    fn process(&mut self, now: Instant) -> (Option<Duration>, usize) {
        // Split timers into ready and pending timers.
        let pending = self.timers.split_off(&(now, u64::MAX));
        let ready = std::mem::replace(&mut self.timers, pending);
        let woke = ready.len();
        for ((_, id), waker) in ready {
            self.timers_by_id.remove(&id);
            waker.wake();
        }

        let next = self
            .timers
            .keys()
            .next()
            .map(|(when, _)| when.saturating_duration_since(now));
        (next, woke)
    }
}

/// A single-threaded executor driving fibers and timers.
///
/// # Examples
///
/// ```
/// use fiber_sync::LocalExecutor;
///
/// let ex = LocalExecutor::new();
/// let value = ex.run(async { 40 + 2 });
/// assert_eq!(value, 42);
/// ```
pub struct LocalExecutor {
    queue: Rc<RunQueue>,
    timers: Rc<RefCell<Timers>>,
}

impl LocalExecutor {
    /// Creates a new executor.
    pub fn new() -> LocalExecutor {
        LocalExecutor {
            queue: Rc::new(RunQueue::default()),
            timers: Rc::new(RefCell::new(Timers::new())),
        }
    }

    /// Spawns a fiber onto this executor.
    ///
    /// Prefer the free function [`spawn_local`] from inside a running
    /// executor.
    pub fn spawn<T: 'static>(&self, future: impl Future<Output = T> + 'static) -> JoinHandle<T> {
        let (handle, wrapper) = JoinHandle::wrap(future);
        let task = Task::new(&self.queue, wrapper);
        task.schedule();
        handle
    }

    /// Runs the executor until the given future completes, processing
    /// spawned fibers and timers along the way.
    ///
    /// # Panics
    ///
    /// Panics when invoked from inside another running executor, or when
    /// every fiber is suspended with no timer left to wake any of them (a
    /// guaranteed deadlock in a cooperative single-threaded runtime).
    pub fn run<T>(&self, future: impl Future<Output = T>) -> T {
        assert!(
            !LOCAL_EX.is_set(),
            "cannot run a LocalExecutor inside another running executor"
        );

        LOCAL_EX.set(self, || {
            futures_lite::pin!(future);

            let notified = Rc::new(Cell::new(true));
            let waker = {
                let notified = notified.clone();
                waker_fn(move || notified.set(true))
            };
            let mut cx = Context::from_waker(&waker);

            loop {
                if notified.replace(false) {
                    if let Poll::Ready(value) = future.as_mut().poll(&mut cx) {
                        return value;
                    }
                }

                let (next_timer, fired) = self.timers.borrow_mut().process(Instant::now());
                let ran = self.run_task_batch();
                if ran || fired > 0 || notified.get() {
                    continue;
                }

                match next_timer {
                    Some(duration) => {
                        trace!("all fibers suspended, parking for {:?}", duration);
                        std::thread::sleep(duration);
                    }
                    None => panic!(
                        "executor cannot make progress: every fiber is suspended and no \
                         timer is registered"
                    ),
                }
            }
        })
    }

    /// Runs the tasks that are currently queued, but not the ones they wake
    /// along the way; those run on the next scheduler iteration, after
    /// timers get another look.
    fn run_task_batch(&self) -> bool {
        let queued = self.queue.runnable.borrow().len();
        for _ in 0..queued {
            let task = self.queue.runnable.borrow_mut().pop_front();
            match task {
                Some(task) => task.run(),
                None => break,
            }
        }
        queued > 0
    }

    pub(crate) fn timer_service(&self) -> Rc<RefCell<Timers>> {
        self.timers.clone()
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("runnable", &self.queue.runnable.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Spawns a fiber onto the executor running on the current thread.
///
/// # Panics
///
/// Panics if called outside [`LocalExecutor::run`].
///
/// # Examples
///
/// ```
/// use fiber_sync::{spawn_local, LocalExecutor};
///
/// let ex = LocalExecutor::new();
/// ex.run(async {
///     let answer = spawn_local(async { 42 }).await;
///     assert_eq!(answer, 42);
/// });
/// ```
pub fn spawn_local<T: 'static>(future: impl Future<Output = T> + 'static) -> JoinHandle<T> {
    LOCAL_EX.with(|ex| ex.spawn(future))
}

/// Returns the timer service of the executor running on the current thread.
///
/// # Panics
///
/// Panics if no executor is running on this thread.
pub(crate) fn current_timers() -> Rc<RefCell<Timers>> {
    assert!(
        LOCAL_EX.is_set(),
        "this API can only be used inside LocalExecutor::run"
    );
    LOCAL_EX.with(|ex| ex.timer_service())
}

/// Suspends the current fiber and reschedules it behind every other
/// currently runnable fiber, giving them a chance to run.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    YieldNow { yielded: false }.await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_returns_value() {
        let ex = LocalExecutor::new();
        assert_eq!(ex.run(async { 7 }), 7);
    }

    #[test]
    fn spawned_fibers_run_to_completion() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let counter = Rc::new(Cell::new(0));
            let mut handles = Vec::new();
            for _ in 0..10 {
                let counter = counter.clone();
                handles.push(spawn_local(async move {
                    counter.set(counter.get() + 1);
                }));
            }
            for handle in handles {
                handle.await;
            }
            assert_eq!(counter.get(), 10);
        });
    }

    #[test]
    fn dropped_handle_detaches() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let flag = Rc::new(Cell::new(false));
            let flag2 = flag.clone();
            drop(spawn_local(async move {
                flag2.set(true);
            }));
            // The detached fiber still runs.
            while !flag.get() {
                yield_now().await;
            }
        });
    }

    #[test]
    fn yield_now_lets_other_fibers_in() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let order = Rc::new(RefCell::new(Vec::new()));
            let o1 = order.clone();
            let o2 = order.clone();
            let t1 = spawn_local(async move {
                o1.borrow_mut().push(1);
                yield_now().await;
                o1.borrow_mut().push(3);
            });
            let t2 = spawn_local(async move {
                o2.borrow_mut().push(2);
            });
            t1.await;
            t2.await;
            assert_eq!(*order.borrow(), vec![1, 2, 3]);
        });
    }

    #[test]
    #[should_panic(expected = "cannot make progress")]
    fn deadlock_panics() {
        let ex = LocalExecutor::new();
        ex.run(async {
            futures_lite::future::pending::<()>().await;
        });
    }
}
