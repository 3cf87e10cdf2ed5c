// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! A counting semaphore with batched acquisition.

use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
    time::Duration,
};

use intrusive_collections::{
    container_of, linked_list::LinkOps, offset_of, Adapter, LinkedList, LinkedListLink, PointerOps,
};
use smallvec::SmallVec;
use std::{marker::PhantomPinned, ptr::NonNull};

use crate::error::{check_non_negative, Result, SyncError};
use crate::timer::timeout;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum WaitState {
    /// Still queued (or about to be queued) for permits.
    Waiting,
    /// Permits were transferred by the drain protocol but the waiter has not
    /// observed them yet.
    Granted,
    /// The waiter observed its grant.
    Done,
}

#[derive(Debug)]
struct Waiter<'a> {
    node: WaiterNode,
    semaphore: &'a Semaphore,
}

#[derive(Debug)]
struct WaiterNode {
    link: LinkedListLink,
    units: u64,
    waker: RefCell<Option<Waker>>,
    state: Cell<WaitState>,

    // Waiter node can not be `Unpin` so its pointer could be used inside
    // intrusive collections, it also can not outlive the container which is
    // guaranteed by the Waiter lifetime bound to the Semaphore which is
    // container of all Waiters.
    _p: PhantomPinned,
}

struct WaiterPointerOps;

unsafe impl PointerOps for WaiterPointerOps {
    type Value = WaiterNode;
    type Pointer = NonNull<WaiterNode>;

    unsafe fn from_raw(&self, value: *const Self::Value) -> Self::Pointer {
        NonNull::new(value as *mut Self::Value).expect("Passed in Pointer can not be null")
    }

    fn into_raw(&self, ptr: Self::Pointer) -> *const Self::Value {
        ptr.as_ptr() as *const Self::Value
    }
}

struct WaiterAdapter {
    pointers_ops: WaiterPointerOps,
    link_ops: LinkOps,
}

impl WaiterAdapter {
    fn new() -> Self {
        WaiterAdapter {
            pointers_ops: WaiterPointerOps,
            link_ops: LinkOps,
        }
    }
}

unsafe impl Adapter for WaiterAdapter {
    type LinkOps = LinkOps;
    type PointerOps = WaiterPointerOps;

    unsafe fn get_value(
        &self,
        link: <Self::LinkOps as intrusive_collections::LinkOps>::LinkPtr,
    ) -> *const <Self::PointerOps as PointerOps>::Value {
        container_of!(link.as_ptr(), WaiterNode, link)
    }

    unsafe fn get_link(
        &self,
        value: *const <Self::PointerOps as PointerOps>::Value,
    ) -> <Self::LinkOps as intrusive_collections::LinkOps>::LinkPtr {
        if value.is_null() {
            panic!("Passed in pointer to the value can not be null");
        }

        let ptr = (value as *const u8).add(offset_of!(WaiterNode, link));
        // We call unchecked method because of safety check above
        core::ptr::NonNull::new_unchecked(ptr as *mut _)
    }

    fn link_ops(&self) -> &Self::LinkOps {
        &self.link_ops
    }

    fn link_ops_mut(&mut self) -> &mut Self::LinkOps {
        &mut self.link_ops
    }

    fn pointer_ops(&self) -> &Self::PointerOps {
        &self.pointers_ops
    }
}

impl<'a> Waiter<'a> {
    fn new(units: u64, semaphore: &'a Semaphore) -> Waiter<'a> {
        Waiter {
            node: WaiterNode {
                link: LinkedListLink::new(),
                units,
                waker: RefCell::new(None),
                state: Cell::new(WaitState::Waiting),
                _p: PhantomPinned,
            },
            semaphore,
        }
    }

    fn remove_from_waiting_queue(waiter_node: Pin<&mut WaiterNode>, state: &mut SemaphoreState) {
        if waiter_node.link.is_linked() {
            let mut cursor = unsafe {
                state
                    .waiters_list
                    .cursor_mut_from_ptr(Pin::into_inner_unchecked(waiter_node) as *const _)
            };

            if cursor.remove().is_none() {
                panic!("Waiter has to be linked into the list of waiting futures");
            }
        }
    }

    fn register_in_waiting_queue(
        waiter_node: Pin<&mut WaiterNode>,
        state: &mut SemaphoreState,
        waker: Waker,
    ) {
        *waiter_node.waker.borrow_mut() = Some(waker);

        if waiter_node.link.is_linked() {
            return;
        }

        state.waiters_list.push_back(unsafe {
            // It is safe to use unchecked call here because we convert passed
            // in reference which can not be null
            NonNull::new_unchecked(Pin::into_inner_unchecked(waiter_node) as *mut _)
        });
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.node.state.get() == WaitState::Granted {
            // The grant was never observed (a racing timeout dropped this
            // waiter first); pass the permits on.
            self.node.state.set(WaitState::Done);
            process_wakes(self.semaphore, self.node.units);
            return;
        }

        if self.node.link.is_linked() {
            // If node is linked it is for sure pinned so it is safe to make
            // it pinned directly
            let waiter_node = unsafe { Pin::new_unchecked(&mut self.node) };
            Self::remove_from_waiting_queue(waiter_node, &mut self.semaphore.state.borrow_mut())
        }
    }
}

impl Future for Waiter<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut sem_state = self.semaphore.state.borrow_mut();
        let future_mut = unsafe { self.get_unchecked_mut() };
        let waiter_node = unsafe { Pin::new_unchecked(&mut future_mut.node) };

        match waiter_node.state.get() {
            WaitState::Granted | WaitState::Done => {
                waiter_node.state.set(WaitState::Done);
                Poll::Ready(())
            }
            WaitState::Waiting => {
                // On the first poll there can be permits again: the enclosing
                // step may have released some between the failed fast path
                // and here.
                if !waiter_node.link.is_linked()
                    && sem_state.avail >= waiter_node.units as i64
                {
                    sem_state.avail -= waiter_node.units as i64;
                    waiter_node.state.set(WaitState::Done);
                    return Poll::Ready(());
                }
                Self::register_in_waiting_queue(waiter_node, &mut sem_state, cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[derive(Debug)]
struct SemaphoreState {
    avail: i64,
    waiters_list: LinkedList<WaiterAdapter>,
}

impl fmt::Debug for WaiterAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WaiterAdapter")
    }
}

/// Adds `units` to the semaphore, then walks the waiter queue in FIFO order
/// transferring permits to every waiter whose request fits. A waiter with a
/// large request parked at the front does not stop a smaller one behind it
/// from being served.
fn process_wakes(sem: &Semaphore, units: u64) {
    let mut wakers = SmallVec::<[Waker; 4]>::new();
    {
        let mut guard = sem.state.borrow_mut();
        let state = &mut *guard;
        state.avail += units as i64;

        let avail = &mut state.avail;
        let mut cursor = state.waiters_list.front_mut();

        // Single pass per release; only waiters which can proceed are woken.
        while *avail > 0 {
            let mut waker = None;
            if let Some(node) = cursor.get() {
                if node.units as i64 <= *avail {
                    *avail -= node.units as i64;
                    node.state.set(WaitState::Granted);

                    let w = node.waker.borrow_mut().take();
                    if w.is_some() {
                        waker = w;
                    } else {
                        panic!("Future was linked into the waiting list without a waker");
                    }
                }
            } else {
                break;
            }

            if let Some(waker) = waker {
                wakers.push(waker);
                cursor.remove();
            } else {
                cursor.move_next();
            }
        }
    }
    for waker in wakers {
        waker.wake();
    }
}

/// A counting semaphore that doesn't use helper threads or condition
/// variables and is friendly to single-threaded execution.
///
/// Permit accounting is exact: a release transfers permits to the waiters it
/// satisfies before returning, so [`available_permits`] reflects every
/// completed acquisition at all times.
///
/// [`available_permits`]: Semaphore::available_permits
#[derive(Debug)]
pub struct Semaphore {
    state: RefCell<SemaphoreState>,
}

impl Semaphore {
    /// Creates a new semaphore with the specified amount of permits.
    ///
    /// # Errors
    ///
    /// Fails with the `"<n> < 0"` message when `permits` is negative.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::sync::Semaphore;
    ///
    /// let sem = Semaphore::new(1).unwrap();
    /// assert_eq!(sem.available_permits(), 1);
    /// ```
    pub fn new(permits: i64) -> Result<Semaphore> {
        let permits = check_non_negative(permits)?;
        Ok(Semaphore {
            state: RefCell::new(SemaphoreState {
                avail: permits as i64,
                waiters_list: LinkedList::new(WaiterAdapter::new()),
            }),
        })
    }

    /// Returns the amount of permits currently available in this semaphore.
    pub fn available_permits(&self) -> i64 {
        self.state.borrow().avail
    }

    /// Acquires the specified amount of permits, suspending while not enough
    /// are available. The caller is then responsible to release them;
    /// whenever possible, prefer [`acquire_permit`].
    ///
    /// # Errors
    ///
    /// Fails with the `"<n> < 0"` message when `permits` is negative; once
    /// validated the wait itself cannot fail.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::Semaphore, LocalExecutor};
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let sem = Semaphore::new(1).unwrap();
    ///     sem.acquire(1).await.unwrap();
    ///     sem.release(1).unwrap();
    /// });
    /// ```
    ///
    /// [`acquire_permit`]: Semaphore::acquire_permit
    pub async fn acquire(&self, permits: i64) -> Result<()> {
        let units = check_non_negative(permits)?;
        self.acquire_units(units).await;
        Ok(())
    }

    async fn acquire_units(&self, units: u64) {
        let waiter = {
            let mut state = self.state.borrow_mut();
            if state.avail >= units as i64 {
                state.avail -= units as i64;
                return;
            }
            Waiter::new(units, self)
        };

        waiter.await
    }

    /// Acquires the given number of permits if they are available, returning
    /// `true` and reducing the available amount, or returns `false` leaving
    /// the semaphore unchanged. This method does not suspend.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::sync::Semaphore;
    ///
    /// let sem = Semaphore::new(42).unwrap();
    /// assert!(sem.try_acquire(24).unwrap());
    /// assert!(!sem.try_acquire(24).unwrap());
    /// ```
    pub fn try_acquire(&self, permits: i64) -> Result<bool> {
        let units = check_non_negative(permits)?;
        let mut state = self.state.borrow_mut();
        if state.avail >= units as i64 {
            state.avail -= units as i64;
            return Ok(true);
        }
        Ok(false)
    }

    /// Like [`acquire`], but gives up after `dur`, resolving with `false`.
    ///
    /// A request that can be satisfied immediately resolves with `true`
    /// whatever the timeout; a zero timeout otherwise resolves with `false`
    /// without queueing. On timeout the waiter leaves the queue and its
    /// timer is dropped before the caller observes the result.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::Semaphore, LocalExecutor};
    /// use std::time::Duration;
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let sem = Semaphore::new(1).unwrap();
    ///     assert!(sem.try_acquire_timeout(1, Duration::from_millis(5)).await.unwrap());
    ///     assert!(!sem.try_acquire_timeout(1, Duration::from_millis(5)).await.unwrap());
    /// });
    /// ```
    ///
    /// [`acquire`]: Semaphore::acquire
    pub async fn try_acquire_timeout(&self, permits: i64, dur: Duration) -> Result<bool> {
        let units = check_non_negative(permits)?;
        {
            let mut state = self.state.borrow_mut();
            if state.avail >= units as i64 {
                state.avail -= units as i64;
                return Ok(true);
            }
        }
        if dur == Duration::ZERO {
            return Ok(false);
        }
        match timeout(dur, self.acquire_units(units)).await {
            Ok(()) => Ok(true),
            Err(SyncError::TimedOut) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Releases the specified amount of permits and serves as many queued
    /// waiters as now fit, in FIFO order.
    ///
    /// This needs to be paired with a call to [`acquire`]; permits acquired
    /// through [`acquire_permit`] are released by the permit itself.
    ///
    /// # Errors
    ///
    /// Fails with the `"<n> < 0"` message when `permits` is negative.
    ///
    /// [`acquire`]: Semaphore::acquire
    /// [`acquire_permit`]: Semaphore::acquire_permit
    pub fn release(&self, permits: i64) -> Result<()> {
        let units = check_non_negative(permits)?;
        process_wakes(self, units);
        Ok(())
    }

    /// Acquires and returns all permits that are immediately available,
    /// leaving the semaphore at zero. Waiters are not affected: none of them
    /// could have been satisfied by the drained amount, or the drain
    /// protocol would already have served them.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::sync::Semaphore;
    ///
    /// let sem = Semaphore::new(3).unwrap();
    /// assert_eq!(sem.drain_permits(), 3);
    /// assert_eq!(sem.available_permits(), 0);
    /// assert_eq!(sem.drain_permits(), 0);
    /// ```
    pub fn drain_permits(&self) -> i64 {
        let mut state = self.state.borrow_mut();
        std::mem::replace(&mut state.avail, 0)
    }

    /// Whether any fiber is queued waiting for permits.
    pub fn has_waiters(&self) -> bool {
        !self.state.borrow().waiters_list.is_empty()
    }

    /// The number of fibers queued waiting for permits.
    pub fn waiter_count(&self) -> usize {
        self.state.borrow().waiters_list.iter().count()
    }

    /// Suspends until a permit can be acquired with the specified amount of
    /// units, which are held while the returned [`Permit`] is alive and
    /// released when it is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::Semaphore, LocalExecutor};
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let sem = Semaphore::new(1).unwrap();
    ///     {
    ///         let _permit = sem.acquire_permit(1).await.unwrap();
    ///         // released when the permit goes out of scope
    ///     }
    ///     let _permit = sem.acquire_permit(1).await.unwrap();
    /// });
    /// ```
    pub async fn acquire_permit(&self, permits: i64) -> Result<Permit<'_>> {
        let units = check_non_negative(permits)?;
        self.acquire_units(units).await;
        Ok(Permit::new(units, self))
    }

    /// Acquires a [`Permit`] without suspending, or returns `None` when not
    /// enough permits are available.
    pub fn try_acquire_permit(&self, permits: i64) -> Result<Option<Permit<'_>>> {
        if self.try_acquire(permits)? {
            Ok(Some(Permit::new(permits as u64, self)))
        } else {
            Ok(None)
        }
    }
}

impl fmt::Display for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Semaphore[permits={}]", self.available_permits())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        assert!(self.state.borrow().waiters_list.is_empty());
    }
}

/// A RAII-friendly way to hold semaphore permits.
///
/// Permits are held while the `Permit` is alive and released when it is
/// dropped.
#[derive(Debug)]
#[must_use = "permits are only held while the permit is alive; an unused permit releases them \
              immediately"]
pub struct Permit<'a> {
    units: u64,
    sem: &'a Semaphore,
}

impl<'a> Permit<'a> {
    fn new(units: u64, sem: &'a Semaphore) -> Permit<'a> {
        Permit { units, sem }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        process_wakes(self.sem, self.units);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::enclose;
    use crate::executor::{spawn_local, yield_now, LocalExecutor};
    use crate::timer::sleep;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Instant;

    #[test]
    fn negative_arguments_are_rejected() {
        assert!(Semaphore::new(-1).is_err());
        let ex = LocalExecutor::new();
        ex.run(async {
            let sem = Semaphore::new(0).unwrap();
            assert!(sem.acquire(-1).await.is_err());
            assert!(sem.try_acquire(-2).is_err());
            assert!(sem.release(-3).is_err());
            assert_eq!(sem.release(-3).unwrap_err().to_string(), "-3 < 0");
        });
    }

    #[test]
    fn semaphore_acquisition_for_zero_permits_works() {
        make_shared_var!(Semaphore::new(1).unwrap(), sem1);

        test_executor!(async move {
            sem1.acquire(0).await.unwrap();
        });
    }

    #[test]
    fn explicit_release_unblocks_waiting_semaphore() {
        make_shared_var!(Semaphore::new(0).unwrap(), sem1, sem2);
        make_shared_var_mut!(0, exec1, exec2);

        test_executor!(
            async move {
                wait_on_cond!(exec1, 1);
                let _g = sem1.acquire_permit(1).await.unwrap();
                update_cond!(exec1, 2);
            },
            async move {
                update_cond!(exec2, 1);
                sem2.release(1).unwrap();
                wait_on_cond!(exec2, 2, 1);
            }
        );
    }

    #[test]
    fn explicit_release_unblocks_many_wakers() {
        make_shared_var!(Semaphore::new(0).unwrap(), sem1, sem2, sem3);

        test_executor!(
            async move {
                sem1.acquire(1).await.unwrap();
            },
            async move {
                sem2.acquire(1).await.unwrap();
            },
            async move {
                sem3.release(2).unwrap();
            }
        );
    }

    #[test]
    fn permit_raii_works() {
        test_executor!(async move {
            let sem = Rc::new(Semaphore::new(0).unwrap());
            let exec = Rc::new(Cell::new(0));

            let t1 = spawn_local(enclose! { (sem, exec) async move {
                exec.set(exec.get() + 1);
                let _g = sem.acquire_permit(1).await.unwrap();
            }});
            let t2 = spawn_local(enclose! { (sem, exec) async move {
                exec.set(exec.get() + 1);
                let _g = sem.acquire_permit(1).await.unwrap();
            }});

            while exec.get() != 2 {
                yield_now().await;
            }
            sem.release(1).unwrap();

            t1.await;
            t2.await;
            assert_eq!(sem.available_permits(), 1);
        });
    }

    #[test]
    fn try_acquire_sufficient_permits() {
        let sem = Semaphore::new(42).unwrap();
        assert!(sem.try_acquire(24).unwrap());
        assert_eq!(sem.available_permits(), 18);
    }

    #[test]
    fn try_acquire_insufficient_permits() {
        let sem = Semaphore::new(42).unwrap();
        assert!(!sem.try_acquire(62).unwrap());
        assert_eq!(sem.available_permits(), 42);
    }

    #[test]
    fn try_acquire_permit_roundtrip() {
        let sem = Semaphore::new(2).unwrap();
        {
            let permit = sem.try_acquire_permit(2).unwrap();
            assert!(permit.is_some());
            assert_eq!(sem.available_permits(), 0);
            assert!(sem.try_acquire_permit(1).unwrap().is_none());
        }
        assert_eq!(sem.available_permits(), 2);
    }

    #[test]
    fn drain_returns_prior_value_and_keeps_waiters() {
        test_executor!(async move {
            let sem = Rc::new(Semaphore::new(3).unwrap());

            let waiter = spawn_local(enclose! { (sem) async move {
                sem.acquire(5).await.unwrap();
            }});
            yield_now().await;
            assert_eq!(sem.waiter_count(), 1);

            assert_eq!(sem.drain_permits(), 3);
            assert_eq!(sem.available_permits(), 0);
            assert_eq!(sem.drain_permits(), 0);
            assert!(sem.has_waiters());

            sem.release(5).unwrap();
            waiter.await;
            assert_eq!(sem.available_permits(), 0);
            assert!(!sem.has_waiters());
        });
    }

    #[test]
    fn drain_protocol_is_first_fit() {
        test_executor!(async move {
            let sem = Rc::new(Semaphore::new(0).unwrap());
            let order = Rc::new(RefCell::new(Vec::new()));

            // Queue a large request ahead of a small one.
            let big = spawn_local(enclose! { (sem, order) async move {
                sem.acquire(3).await.unwrap();
                order.borrow_mut().push("big");
            }});
            yield_now().await;
            let small = spawn_local(enclose! { (sem, order) async move {
                sem.acquire(1).await.unwrap();
                order.borrow_mut().push("small");
            }});
            yield_now().await;
            assert_eq!(sem.waiter_count(), 2);

            // One permit fits only the small request; the big one keeps its
            // place at the head.
            sem.release(1).unwrap();
            small.await;
            assert_eq!(sem.waiter_count(), 1);
            assert_eq!(sem.available_permits(), 0);

            sem.release(3).unwrap();
            big.await;
            assert_eq!(*order.borrow(), vec!["small", "big"]);
        });
    }

    #[test]
    fn permits_are_committed_when_release_returns() {
        test_executor!(async move {
            let sem = Rc::new(Semaphore::new(0).unwrap());

            let waiter = spawn_local(enclose! { (sem) async move {
                sem.acquire(2).await.unwrap();
            }});
            yield_now().await;

            sem.release(5).unwrap();
            // The waiter has not run yet, but its permits are already gone.
            assert_eq!(sem.available_permits(), 3);
            waiter.await;
            assert_eq!(sem.available_permits(), 3);
        });
    }

    #[test]
    fn timed_acquire_times_out() {
        test_executor!(async move {
            let sem = Semaphore::new(0).unwrap();
            let start = Instant::now();
            let acquired = sem
                .try_acquire_timeout(1, Duration::from_millis(50))
                .await
                .unwrap();
            assert!(!acquired);
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(50));
            assert!(elapsed < Duration::from_millis(150), "{elapsed:?}");
            assert_eq!(sem.waiter_count(), 0);
        });
    }

    #[test]
    fn timed_acquire_zero_timeout_is_immediate() {
        test_executor!(async move {
            let sem = Semaphore::new(1).unwrap();
            assert!(sem
                .try_acquire_timeout(1, Duration::ZERO)
                .await
                .unwrap());
            assert!(!sem
                .try_acquire_timeout(1, Duration::ZERO)
                .await
                .unwrap());
        });
    }

    #[test]
    fn timed_acquire_succeeds_before_deadline() {
        test_executor!(async move {
            let sem = Rc::new(Semaphore::new(0).unwrap());
            let _ = spawn_local(enclose! { (sem) async move {
                sleep(Duration::from_millis(10)).await;
                sem.release(1).unwrap();
            }});
            assert!(sem
                .try_acquire_timeout(1, Duration::from_secs(5))
                .await
                .unwrap());
            assert_eq!(sem.available_permits(), 0);
        });
    }

    #[test]
    fn semaphore_ensure_execution_order() {
        test_executor!(async move {
            let sem = Rc::new(Semaphore::new(0).unwrap());
            let state = Rc::new(RefCell::new(0));

            let t1 = spawn_local(enclose! { (sem, state) async move {
                *state.borrow_mut() = 1;
                let _g = sem.acquire_permit(1).await.unwrap();
                assert_eq!(*state.borrow(), 3);
                *state.borrow_mut() = 4;
            }});

            let t2 = spawn_local(enclose! { (sem, state) async move {
                while *state.borrow() != 1 {
                    yield_now().await;
                }
                *state.borrow_mut() = 2;
                let _g = sem.acquire_permit(1).await.unwrap();
                assert_eq!(*state.borrow(), 4);
                *state.borrow_mut() = 5;
            }});

            let t3 = spawn_local(enclose! { (sem, state) async move {
                while *state.borrow() != 2 {
                    yield_now().await;
                }
                *state.borrow_mut() = 3;
                let _g = sem.acquire_permit(1).await.unwrap();
                assert_eq!(*state.borrow(), 5);
            }});

            let _ = spawn_local(enclose! { (sem, state) async move {
                while *state.borrow() != 3 {
                    yield_now().await;
                }
                sem.release(1).unwrap();
            }});

            t1.await;
            t2.await;
            t3.await;
        });
    }

    #[test]
    fn display_form() {
        let sem = Semaphore::new(7).unwrap();
        assert_eq!(sem.to_string(), "Semaphore[permits=7]");
    }
}
