// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! A one-shot countdown latch.
//!
//! A latch starts with a count and lets fibers wait until `count_down` has
//! been called that many times. Once the count reaches zero every waiter is
//! woken in the order it arrived and the latch stays open forever; it is not
//! reusable.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::error::{check_non_negative, Result};
use crate::timer::timeout;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
struct WaiterId(u64);

#[derive(Debug)]
struct LatchState {
    initial: u64,
    count: u64,
    id_gen: u64,
    // Arrival order; ids whose entry is gone from the map are dead waiters
    // (timed out) and are skipped.
    waiters: VecDeque<WaiterId>,
    waiters_map: AHashMap<WaiterId, Waker>,
}

impl LatchState {
    fn open_and_take_wakers(&mut self) -> SmallVec<[Waker; 4]> {
        let mut wakers = SmallVec::new();
        while let Some(id) = self.waiters.pop_front() {
            if let Some(waker) = self.waiters_map.remove(&id) {
                wakers.push(waker);
            }
        }
        wakers
    }
}

/// A one-shot latch that opens after a fixed number of countdowns.
///
/// Clones share the same underlying count, so a latch can be handed to the
/// fibers that count it down and the fibers that wait on it.
///
/// # Examples
///
/// ```
/// use fiber_sync::{spawn_local, sync::CountDownLatch, LocalExecutor};
///
/// let ex = LocalExecutor::new();
/// ex.run(async {
///     let latch = CountDownLatch::new(2).unwrap();
///     let waiter = spawn_local({
///         let latch = latch.clone();
///         async move { latch.wait().await }
///     });
///     latch.count_down();
///     latch.count_down();
///     waiter.await;
///     assert_eq!(latch.count(), 0);
/// });
/// ```
#[derive(Clone)]
pub struct CountDownLatch {
    state: Rc<RefCell<LatchState>>,
}

impl CountDownLatch {
    /// Creates a latch that opens after `count` countdowns. A latch created
    /// with a zero count is already open.
    ///
    /// # Errors
    ///
    /// Fails with the `"<n> < 0"` message when `count` is negative.
    pub fn new(count: i64) -> Result<CountDownLatch> {
        let count = check_non_negative(count)?;
        Ok(CountDownLatch {
            state: Rc::new(RefCell::new(LatchState {
                initial: count,
                count,
                id_gen: 0,
                waiters: VecDeque::new(),
                waiters_map: AHashMap::new(),
            })),
        })
    }

    /// Decrements the count, waking every waiter once it reaches zero.
    /// Counting down an open latch is a no-op.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::sync::CountDownLatch;
    ///
    /// let latch = CountDownLatch::new(2).unwrap();
    /// latch.count_down();
    /// assert_eq!(latch.count(), 1);
    /// latch.count_down();
    /// latch.count_down(); // no-op, the latch is already open
    /// assert_eq!(latch.count(), 0);
    /// ```
    pub fn count_down(&self) {
        let wakers = {
            let mut state = self.state.borrow_mut();
            if state.count == 0 {
                return;
            }
            state.count -= 1;
            if state.count > 0 {
                return;
            }
            state.open_and_take_wakers()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Suspends until the count reaches zero. Returns immediately if the
    /// latch is already open.
    pub async fn wait(&self) {
        LatchWaiter {
            state: self.state.clone(),
            id: None,
        }
        .await
    }

    /// Suspends until the count reaches zero, failing with
    /// [`SyncError::TimedOut`] if the deadline passes first.
    ///
    /// An open latch succeeds regardless of the timeout; a zero timeout on a
    /// latch that is still counting fails immediately.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::CountDownLatch, LocalExecutor};
    /// use std::time::Duration;
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let latch = CountDownLatch::new(1).unwrap();
    ///     assert!(latch.wait_timeout(Duration::ZERO).await.is_err());
    ///
    ///     latch.count_down();
    ///     latch.wait_timeout(Duration::ZERO).await.unwrap();
    /// });
    /// ```
    ///
    /// [`SyncError::TimedOut`]: crate::SyncError::TimedOut
    pub async fn wait_timeout(&self, dur: Duration) -> Result<()> {
        timeout(dur, self.wait()).await
    }

    /// The count this latch was created with.
    pub fn initial_count(&self) -> u64 {
        self.state.borrow().initial
    }

    /// The current count.
    pub fn count(&self) -> u64 {
        self.state.borrow().count
    }
}

impl fmt::Display for CountDownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountDownLatch[count={}]", self.count())
    }
}

impl fmt::Debug for CountDownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("CountDownLatch")
            .field("initial", &state.initial)
            .field("count", &state.count)
            .field("waiters", &state.waiters_map.len())
            .finish()
    }
}

struct LatchWaiter {
    state: Rc<RefCell<LatchState>>,
    id: Option<WaiterId>,
}

impl Future for LatchWaiter {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        let mut state = this.state.borrow_mut();
        if state.count == 0 {
            if let Some(id) = this.id.take() {
                state.waiters_map.remove(&id);
            }
            return Poll::Ready(());
        }
        match this.id {
            Some(id) => {
                state.waiters_map.insert(id, cx.waker().clone());
            }
            None => {
                let id = WaiterId(state.id_gen);
                state.id_gen += 1;
                state.waiters.push_back(id);
                state.waiters_map.insert(id, cx.waker().clone());
                this.id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for LatchWaiter {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            // A timed-out waiter leaves the queue before its caller sees the
            // failure; the id left in the deque is skipped when the latch
            // opens.
            self.state.borrow_mut().waiters_map.remove(&id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::SyncError;
    use crate::executor::{spawn_local, yield_now, LocalExecutor};
    use crate::timer::sleep;
    use std::cell::Cell;
    use std::time::Instant;

    #[test]
    fn negative_count_is_rejected() {
        let err = CountDownLatch::new(-1).unwrap_err();
        assert_eq!(err.to_string(), "-1 < 0");
    }

    #[test]
    fn zero_latch_is_already_open() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let latch = CountDownLatch::new(0).unwrap();
            latch.wait().await;
            assert_eq!(latch.count(), 0);
            assert_eq!(latch.initial_count(), 0);
        });
    }

    #[test]
    fn counting_down_an_open_latch_is_a_noop() {
        let latch = CountDownLatch::new(1).unwrap();
        latch.count_down();
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
        assert_eq!(latch.initial_count(), 1);
    }

    #[test]
    fn waiters_wake_when_count_reaches_zero() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let latch = CountDownLatch::new(2).unwrap();
            let released = Rc::new(Cell::new(0));

            let mut waiters = Vec::new();
            for _ in 0..3 {
                let latch = latch.clone();
                let released = released.clone();
                waiters.push(spawn_local(async move {
                    latch.wait().await;
                    released.set(released.get() + 1);
                }));
            }

            yield_now().await;
            latch.count_down();
            yield_now().await;
            assert_eq!(released.get(), 0);

            latch.count_down();
            for waiter in waiters {
                waiter.await;
            }
            assert_eq!(released.get(), 3);
        });
    }

    #[test]
    fn zero_timeout_fails_while_counting() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let latch = CountDownLatch::new(1).unwrap();
            let err = latch.wait_timeout(Duration::ZERO).await.unwrap_err();
            assert!(matches!(err, SyncError::TimedOut));
        });
    }

    #[test]
    fn zero_timeout_succeeds_on_open_latch() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let latch = CountDownLatch::new(0).unwrap();
            latch.wait_timeout(Duration::ZERO).await.unwrap();
        });
    }

    #[test]
    fn timed_wait_expires_and_leaves_no_waiter() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let latch = CountDownLatch::new(1).unwrap();
            let start = Instant::now();
            let err = latch
                .wait_timeout(Duration::from_millis(50))
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::TimedOut));
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(50));
            assert!(elapsed < Duration::from_millis(150), "{elapsed:?}");
            assert!(latch.state.borrow().waiters_map.is_empty());

            // The latch still opens for fresh waiters.
            latch.count_down();
            latch.wait().await;
        });
    }

    #[test]
    fn countdown_from_a_timer_releases_waiter() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let latch = CountDownLatch::new(1).unwrap();
            let _ = spawn_local({
                let latch = latch.clone();
                async move {
                    sleep(Duration::from_millis(10)).await;
                    latch.count_down();
                }
            });
            latch.wait().await;
            assert_eq!(latch.count(), 0);
        });
    }

    #[test]
    fn display_form() {
        let latch = CountDownLatch::new(3).unwrap();
        assert_eq!(latch.to_string(), "CountDownLatch[count=3]");
        latch.count_down();
        assert_eq!(latch.to_string(), "CountDownLatch[count=2]");
    }
}
