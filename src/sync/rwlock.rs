// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! A multi-reader single-writer lock with explicit handles.
//!
//! Unlike [`std::sync::RwLock`] this lock does not protect a value; it hands
//! out [`ReadLock`] and [`WriteLock`] handles whose `held` flag is the
//! source of truth for release validation. Access is granted in FIFO order
//! among waiters of the same class, with a fairness policy deciding whether
//! new readers may overtake queued writers:
//!
//! * **fair** (the default): a new reader enqueues behind any queued waiter,
//!   so a waiting writer is never starved by a stream of readers.
//! * **non-fair**: while at least one read lock is held and no writer holds
//!   the lock, new readers are admitted immediately, even past queued
//!   writers.
//!
//! A held read handle can be upgraded to a write handle and a write handle
//! can be downgraded to a read handle, see [`ReadLock::upgrade`] and
//! [`WriteLock::downgrade`].

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

use crate::error::{LockKind, Result, SyncError};
use crate::timer::timeout;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
struct WaiterId(u64);

type WakeList = SmallVec<[Waker; 4]>;

#[derive(Debug)]
struct WaiterEntry {
    kind: LockKind,
    waker: Option<Waker>,
    /// Set when the wake protocol transfers the lock to this waiter; the
    /// matching count is already incremented at that point.
    granted: bool,
}

#[derive(Debug)]
struct State {
    fair: bool,
    id_gen: u64,

    // number of granted read accesses
    readers: u32,
    // number of granted write accesses, either zero or one
    writers: u32,

    queued_readers: u32,
    queued_writers: u32,

    // Arrival order. Ids with no entry left in the map belong to cancelled
    // waiters and are skipped (and discarded) by the wake passes.
    waiters: VecDeque<WaiterId>,
    waiters_map: AHashMap<WaiterId, WaiterEntry>,
}

impl State {
    fn new(fair: bool) -> Self {
        State {
            fair,
            id_gen: 0,
            readers: 0,
            writers: 0,
            queued_readers: 0,
            queued_writers: 0,
            waiters: VecDeque::new(),
            waiters_map: AHashMap::new(),
        }
    }

    fn queued(&self) -> u32 {
        self.queued_readers + self.queued_writers
    }

    fn try_grant(&mut self, kind: LockKind) -> bool {
        debug_assert!(!(self.readers > 0 && self.writers > 0));
        match kind {
            LockKind::Read => {
                if self.writers > 0 {
                    return false;
                }
                if self.fair && self.queued() > 0 {
                    return false;
                }
                if !self.fair && self.readers > 0 {
                    self.readers += 1;
                    return true;
                }
                if self.queued() > 0 {
                    return false;
                }
                self.readers += 1;
                true
            }
            LockKind::Write => {
                if self.readers == 0 && self.writers == 0 {
                    self.writers = 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Transfers the lock to the waiter with the given id: increments the
    /// matching count, marks the entry granted and collects its waker.
    fn grant(&mut self, id: WaiterId, wakers: &mut WakeList) {
        let entry = self
            .waiters_map
            .get_mut(&id)
            .expect("granting a waiter that is no longer queued");
        entry.granted = true;
        let kind = entry.kind;
        if let Some(waker) = entry.waker.take() {
            wakers.push(waker);
        }
        match kind {
            LockKind::Read => {
                self.readers += 1;
                self.queued_readers -= 1;
            }
            LockKind::Write => {
                debug_assert_eq!(self.writers, 0);
                self.writers = 1;
                self.queued_writers -= 1;
            }
        }
    }

    /// Activates the head of the waiter queue after the lock became free. A
    /// write head takes the lock alone; a read head pulls further readers in
    /// according to the fairness policy.
    fn wake_next(&mut self, wakers: &mut WakeList) {
        loop {
            let Some(&id) = self.waiters.front() else {
                return;
            };
            let Some(kind) = self.waiters_map.get(&id).map(|entry| entry.kind) else {
                // dead id left behind by a cancelled waiter
                self.waiters.pop_front();
                continue;
            };
            match kind {
                LockKind::Write => {
                    self.waiters.pop_front();
                    self.grant(id, wakers);
                }
                LockKind::Read => self.wake_readers(wakers),
            }
            return;
        }
    }

    /// Activates queued readers according to the fairness policy: in fair
    /// mode the consecutive readers at the head of the queue, up to the
    /// first writer; in non-fair mode every queued reader, leaving writers
    /// in their original order.
    fn wake_readers(&mut self, wakers: &mut WakeList) {
        if self.fair {
            loop {
                let Some(&id) = self.waiters.front() else {
                    return;
                };
                match self.waiters_map.get(&id).map(|entry| entry.kind) {
                    None => {
                        self.waiters.pop_front();
                    }
                    Some(LockKind::Read) => {
                        self.waiters.pop_front();
                        self.grant(id, wakers);
                    }
                    Some(LockKind::Write) => return,
                }
            }
        } else {
            let ids: Vec<WaiterId> = self.waiters.drain(..).collect();
            for id in ids {
                match self.waiters_map.get(&id).map(|entry| entry.kind) {
                    None => {}
                    Some(LockKind::Read) => self.grant(id, wakers),
                    Some(LockKind::Write) => self.waiters.push_back(id),
                }
            }
        }
    }

    fn release_read(&mut self, wakers: &mut WakeList) {
        debug_assert!(self.readers > 0);
        self.readers -= 1;
        if self.readers == 0 && self.writers == 0 {
            self.wake_next(wakers);
        }
    }

    fn release_write(&mut self, wakers: &mut WakeList) {
        debug_assert_eq!(self.writers, 1);
        debug_assert_eq!(self.readers, 0);
        self.writers = 0;
        self.wake_next(wakers);
    }
}

fn unlock(state: &Rc<RefCell<State>>, kind: LockKind) {
    let mut wakers = WakeList::new();
    {
        let mut state = state.borrow_mut();
        match kind {
            LockKind::Read => state.release_read(&mut wakers),
            LockKind::Write => state.release_write(&mut wakers),
        }
    }
    for waker in wakers {
        waker.wake();
    }
}

struct LockWaiter {
    state: Rc<RefCell<State>>,
    kind: LockKind,
    id: Option<WaiterId>,
    done: bool,
}

impl LockWaiter {
    fn new(state: Rc<RefCell<State>>, kind: LockKind) -> LockWaiter {
        LockWaiter {
            state,
            kind,
            id: None,
            done: false,
        }
    }
}

impl Future for LockWaiter {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        let mut state = this.state.borrow_mut();
        match this.id {
            None => {
                if state.try_grant(this.kind) {
                    this.done = true;
                    return Poll::Ready(());
                }
                let id = WaiterId(state.id_gen);
                state.id_gen += 1;
                state.waiters.push_back(id);
                state.waiters_map.insert(
                    id,
                    WaiterEntry {
                        kind: this.kind,
                        waker: Some(cx.waker().clone()),
                        granted: false,
                    },
                );
                match this.kind {
                    LockKind::Read => state.queued_readers += 1,
                    LockKind::Write => state.queued_writers += 1,
                }
                this.id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                let entry = state
                    .waiters_map
                    .get_mut(&id)
                    .expect("lock waiter entry disappeared while the waiter is alive");
                if entry.granted {
                    state.waiters_map.remove(&id);
                    this.done = true;
                    Poll::Ready(())
                } else {
                    entry.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for LockWaiter {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(id) = self.id else {
            return;
        };
        let mut wakers = WakeList::new();
        {
            let mut state = self.state.borrow_mut();
            let Some(entry) = state.waiters_map.remove(&id) else {
                return;
            };
            if entry.granted {
                // The lock was transferred but never observed (a racing
                // timeout dropped the waiter first); release it so it moves
                // on to the next waiter.
                match entry.kind {
                    LockKind::Read => state.release_read(&mut wakers),
                    LockKind::Write => state.release_write(&mut wakers),
                }
            } else {
                match entry.kind {
                    LockKind::Read => state.queued_readers -= 1,
                    LockKind::Write => state.queued_writers -= 1,
                }
            }
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

/// A reader-writer lock for fibers.
///
/// Any number of read handles can be held at once, or a single write
/// handle. See the [module documentation](self) for the fairness policy.
///
/// # Examples
///
/// ```
/// use fiber_sync::{sync::ReadWriteLock, LocalExecutor};
///
/// let ex = LocalExecutor::new();
/// ex.run(async {
///     let lock = ReadWriteLock::new();
///
///     let r1 = lock.read().await;
///     let r2 = lock.read().await;
///     assert_eq!(lock.read_count(), 2);
///     drop((r1, r2));
///
///     let w = lock.write().await;
///     assert!(lock.is_write_locked());
///     drop(w);
/// });
/// ```
pub struct ReadWriteLock {
    state: Rc<RefCell<State>>,
}

impl ReadWriteLock {
    /// Creates a fair lock: readers arriving while writers are queued wait
    /// their turn.
    pub fn new() -> ReadWriteLock {
        Self::with_fairness(true)
    }

    /// Creates a lock with an explicit fairness policy.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::sync::ReadWriteLock;
    ///
    /// let lock = ReadWriteLock::with_fairness(false);
    /// assert!(!lock.is_read_locked());
    /// ```
    pub fn with_fairness(fair: bool) -> ReadWriteLock {
        ReadWriteLock {
            state: Rc::new(RefCell::new(State::new(fair))),
        }
    }

    /// Acquires a read lock, suspending while a writer holds the lock (or,
    /// in fair mode, while any waiter is queued).
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::ReadWriteLock, LocalExecutor};
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let lock = ReadWriteLock::new();
    ///     let r1 = lock.read().await;
    ///     let r2 = lock.read().await;
    ///     assert_eq!(lock.read_count(), 2);
    ///     drop((r1, r2));
    /// });
    /// ```
    pub async fn read(&self) -> ReadLock {
        LockWaiter::new(self.state.clone(), LockKind::Read).await;
        ReadLock {
            state: self.state.clone(),
            held: true,
        }
    }

    /// Like [`read`], but fails with [`SyncError::TimedOut`] when the lock
    /// cannot be granted within `dur`. A zero duration fails immediately
    /// unless the lock is immediately grantable.
    ///
    /// [`read`]: ReadWriteLock::read
    pub async fn read_timeout(&self, dur: Duration) -> Result<ReadLock> {
        timeout(dur, self.read()).await
    }

    /// Acquires the write lock, suspending while any lock is held.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::ReadWriteLock, LocalExecutor};
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let lock = ReadWriteLock::new();
    ///     let mut w = lock.write().await;
    ///     assert!(lock.try_read().is_none());
    ///     w.release().unwrap();
    /// });
    /// ```
    pub async fn write(&self) -> WriteLock {
        LockWaiter::new(self.state.clone(), LockKind::Write).await;
        WriteLock {
            state: self.state.clone(),
            held: true,
        }
    }

    /// Like [`write`], but fails with [`SyncError::TimedOut`] when the lock
    /// cannot be granted within `dur`.
    ///
    /// [`write`]: ReadWriteLock::write
    pub async fn write_timeout(&self, dur: Duration) -> Result<WriteLock> {
        timeout(dur, self.write()).await
    }

    /// Acquires a read lock only if that is possible without suspending.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::sync::ReadWriteLock;
    ///
    /// let lock = ReadWriteLock::new();
    /// let r = lock.try_read().unwrap();
    /// assert!(lock.try_write().is_none());
    /// drop(r);
    /// ```
    pub fn try_read(&self) -> Option<ReadLock> {
        if self.state.borrow_mut().try_grant(LockKind::Read) {
            Some(ReadLock {
                state: self.state.clone(),
                held: true,
            })
        } else {
            None
        }
    }

    /// Acquires the write lock only if that is possible without suspending.
    pub fn try_write(&self) -> Option<WriteLock> {
        if self.state.borrow_mut().try_grant(LockKind::Write) {
            Some(WriteLock {
                state: self.state.clone(),
                held: true,
            })
        } else {
            None
        }
    }

    /// Whether at least one read lock is currently held.
    pub fn is_read_locked(&self) -> bool {
        self.state.borrow().readers > 0
    }

    /// Whether the write lock is currently held.
    pub fn is_write_locked(&self) -> bool {
        self.state.borrow().writers > 0
    }

    /// The number of read locks currently held.
    pub fn read_count(&self) -> u32 {
        self.state.borrow().readers
    }

    /// The number of fibers queued for a read lock.
    pub fn waiting_readers(&self) -> u32 {
        self.state.borrow().queued_readers
    }

    /// The number of fibers queued for the write lock.
    pub fn waiting_writers(&self) -> u32 {
        self.state.borrow().queued_writers
    }
}

impl Default for ReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReadWriteLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        write!(
            f,
            "ReadWriteLock[write lock={}, read locks={}]",
            state.writers > 0,
            state.readers
        )
    }
}

impl fmt::Debug for ReadWriteLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ReadWriteLock")
            .field("fair", &state.fair)
            .field("readers", &state.readers)
            .field("writers", &state.writers)
            .field("queued_readers", &state.queued_readers)
            .field("queued_writers", &state.queued_writers)
            .finish()
    }
}

/// A handle representing one granted read access.
///
/// The handle must stay with its acquirer: its `held` flag is what release
/// validation checks. Dropping a handle that is still held releases the
/// lock.
#[must_use = "the read lock is released when the handle is dropped"]
pub struct ReadLock {
    state: Rc<RefCell<State>>,
    held: bool,
}

impl ReadLock {
    /// Releases the read lock.
    ///
    /// # Errors
    ///
    /// Fails with `"Read lock is no longer held"` if the handle was already
    /// released.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::ReadWriteLock, LocalExecutor};
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let lock = ReadWriteLock::new();
    ///     let mut r = lock.read().await;
    ///     r.release().unwrap();
    ///     assert!(r.release().is_err());
    /// });
    /// ```
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Err(SyncError::not_held(LockKind::Read));
        }
        self.held = false;
        unlock(&self.state, LockKind::Read);
        Ok(())
    }

    /// Whether this handle still holds its read lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Trades this read lock for the write lock.
    ///
    /// The read lock is released first and the write lock is then acquired
    /// like any other write request, so other writers (including concurrent
    /// upgrades) may get the lock in between; callers must re-validate any
    /// state they read under the read lock.
    ///
    /// # Errors
    ///
    /// Fails with `"Read lock is no longer held"` if the handle was already
    /// released.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::ReadWriteLock, LocalExecutor};
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let lock = ReadWriteLock::new();
    ///     let r = lock.read().await;
    ///     let w = r.upgrade().await.unwrap();
    ///     assert!(lock.is_write_locked());
    ///     drop(w);
    /// });
    /// ```
    pub async fn upgrade(mut self) -> Result<WriteLock> {
        let state = self.begin_upgrade()?;
        LockWaiter::new(state.clone(), LockKind::Write).await;
        Ok(WriteLock { state, held: true })
    }

    /// Like [`upgrade`], but gives up after `dur` with
    /// [`SyncError::TimedOut`]. The read lock is released as part of the
    /// upgrade attempt and is **not** restored on timeout.
    ///
    /// [`upgrade`]: ReadLock::upgrade
    pub async fn upgrade_timeout(mut self, dur: Duration) -> Result<WriteLock> {
        let state = self.begin_upgrade()?;
        timeout(dur, LockWaiter::new(state.clone(), LockKind::Write)).await?;
        Ok(WriteLock { state, held: true })
    }

    /// Releases the held read lock and hands back the shared state for the
    /// write acquisition.
    fn begin_upgrade(&mut self) -> Result<Rc<RefCell<State>>> {
        if !self.held {
            return Err(SyncError::not_held(LockKind::Read));
        }
        self.held = false;
        unlock(&self.state, LockKind::Read);
        Ok(self.state.clone())
    }
}

impl Drop for ReadLock {
    fn drop(&mut self) {
        if self.held {
            self.held = false;
            unlock(&self.state, LockKind::Read);
        }
    }
}

impl fmt::Display for ReadLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadLock[held={}]", self.held)
    }
}

impl fmt::Debug for ReadLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadLock").field("held", &self.held).finish()
    }
}

/// A handle representing the granted write access.
///
/// Dropping a handle that is still held releases the lock.
#[must_use = "the write lock is released when the handle is dropped"]
pub struct WriteLock {
    state: Rc<RefCell<State>>,
    held: bool,
}

impl WriteLock {
    /// Releases the write lock.
    ///
    /// # Errors
    ///
    /// Fails with `"Write lock is no longer held"` if the handle was
    /// already released.
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Err(SyncError::not_held(LockKind::Write));
        }
        self.held = false;
        unlock(&self.state, LockKind::Write);
        Ok(())
    }

    /// Whether this handle still holds the write lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Trades the write lock for a read lock without letting another writer
    /// in: the counts are swapped in one step and queued readers are then
    /// admitted according to the fairness policy, so they proceed in
    /// parallel with the downgraded reader.
    ///
    /// # Errors
    ///
    /// Fails with `"Write lock is no longer held"` if the handle was
    /// already released.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::ReadWriteLock, LocalExecutor};
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let lock = ReadWriteLock::new();
    ///     let w = lock.write().await;
    ///     let r = w.downgrade().unwrap();
    ///     assert_eq!(lock.read_count(), 1);
    ///     assert!(!lock.is_write_locked());
    ///     drop(r);
    /// });
    /// ```
    pub fn downgrade(mut self) -> Result<ReadLock> {
        if !self.held {
            return Err(SyncError::not_held(LockKind::Write));
        }
        self.held = false;

        let mut wakers = WakeList::new();
        {
            let mut state = self.state.borrow_mut();
            debug_assert_eq!(state.writers, 1);
            debug_assert_eq!(state.readers, 0);
            state.readers = 1;
            state.writers = 0;
            state.wake_readers(&mut wakers);
        }
        for waker in wakers {
            waker.wake();
        }

        Ok(ReadLock {
            state: self.state.clone(),
            held: true,
        })
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if self.held {
            self.held = false;
            unlock(&self.state, LockKind::Write);
        }
    }
}

impl fmt::Display for WriteLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriteLock[held={}]", self.held)
    }
}

impl fmt::Debug for WriteLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteLock")
            .field("held", &self.held)
            .finish()
    }
}
