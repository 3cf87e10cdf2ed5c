// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use crate::error::{Result, SyncError};
use crate::executor::{current_timers, Timers};
use pin_project_lite::pin_project;
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

/// A timer that expires after a duration of time.
///
/// Timers are futures that output the [`Instant`] at which they fired. They
/// register themselves with the running executor's timer service on first
/// poll and deregister on drop, so dropping a pending timer cancels it.
///
/// # Examples
///
/// ```
/// use fiber_sync::{timer::Timer, LocalExecutor};
/// use std::time::Duration;
///
/// let ex = LocalExecutor::new();
/// ex.run(async {
///     Timer::new(Duration::from_millis(5)).await;
/// });
/// ```
pub struct Timer {
    id: u64,
    when: Instant,
    registered: bool,
    timers: Rc<RefCell<Timers>>,
}

impl Timer {
    /// Creates a timer that expires after the given duration of time.
    ///
    /// The deadline is computed here, at the call site; queueing delays
    /// elsewhere are not deducted from it.
    ///
    /// # Panics
    ///
    /// Panics if called outside a running [`LocalExecutor`].
    ///
    /// [`LocalExecutor`]: crate::LocalExecutor
    pub fn new(dur: Duration) -> Timer {
        let timers = current_timers();
        let id = timers.borrow_mut().new_id();
        Timer {
            id,
            when: Instant::now() + dur,
            registered: false,
            timers,
        }
    }

    /// Resets the timer to expire after the new duration of time, keeping
    /// the waker of any fiber already polling it.
    pub fn reset(&mut self, dur: Duration) {
        let when = Instant::now() + dur;
        if self.registered {
            let mut timers = self.timers.borrow_mut();
            if let Some(waker) = timers.remove(self.id) {
                timers.insert(self.id, when, waker);
            }
        }
        self.when = when;
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if self.registered {
            self.timers.borrow_mut().remove(self.id);
        }
    }
}

impl Future for Timer {
    type Output = Instant;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.when {
            if self.registered {
                self.timers.borrow_mut().remove(self.id);
                self.registered = false;
            }
            Poll::Ready(self.when)
        } else {
            self.timers
                .borrow_mut()
                .insert(self.id, self.when, cx.waker().clone());
            self.registered = true;
            Poll::Pending
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("when", &self.when)
            .field("registered", &self.registered)
            .finish()
    }
}

pin_project! {
    /// Future returned by [`timeout`].
    pub struct Timeout<F> {
        #[pin]
        future: F,
        timer: Timer,
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        // The wrapped future is polled first so that a result that is ready
        // by the deadline wins over a timer that fired on the same
        // scheduler iteration, and so that a zero timeout still grants
        // whatever is immediately available.
        if let Poll::Ready(value) = this.future.poll(cx) {
            return Poll::Ready(Ok(value));
        }

        match Pin::new(this.timer).poll(cx) {
            Poll::Ready(_) => Poll::Ready(Err(SyncError::TimedOut)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<F> fmt::Debug for Timeout<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

/// Awaits a future, failing with [`SyncError::TimedOut`] if it does not
/// complete within `dur`.
///
/// Dropping the returned future cancels both the timer and the wrapped
/// future; for the waiter futures in [`sync`](crate::sync) that cancellation
/// removes the waiter from its queue.
///
/// # Examples
///
/// ```
/// use fiber_sync::{timer::{sleep, timeout}, LocalExecutor, SyncError};
/// use std::time::Duration;
///
/// let ex = LocalExecutor::new();
/// ex.run(async {
///     let err = timeout(Duration::from_millis(1), sleep(Duration::from_secs(1)))
///         .await
///         .unwrap_err();
///     assert!(matches!(err, SyncError::TimedOut));
/// });
/// ```
pub fn timeout<F: Future>(dur: Duration, future: F) -> Timeout<F> {
    Timeout {
        future,
        timer: Timer::new(dur),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::LocalExecutor;

    #[test]
    fn timer_fires_within_slack() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let start = Instant::now();
            Timer::new(Duration::from_millis(50)).await;
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(50));
            assert!(elapsed < Duration::from_millis(150), "{elapsed:?}");
        });
    }

    #[test]
    fn zero_timer_is_immediately_ready() {
        let ex = LocalExecutor::new();
        ex.run(async {
            Timer::new(Duration::ZERO).await;
        });
    }

    #[test]
    fn timeout_returns_inner_value() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let value = timeout(Duration::from_secs(1), async { 42 }).await.unwrap();
            assert_eq!(value, 42);
        });
    }

    #[test]
    fn timeout_expires() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let start = Instant::now();
            let result = timeout(
                Duration::from_millis(50),
                super::super::sleep(Duration::from_secs(10)),
            )
            .await;
            assert!(matches!(result, Err(SyncError::TimedOut)));
            assert!(start.elapsed() < Duration::from_secs(1));
        });
    }

    #[test]
    fn zero_timeout_still_polls_inner_future_once() {
        let ex = LocalExecutor::new();
        ex.run(async {
            let value = timeout(Duration::ZERO, async { "ready" }).await.unwrap();
            assert_eq!(value, "ready");
        });
    }
}
