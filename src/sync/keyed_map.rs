// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! A hash map whose mutations are serialized asynchronous actions, one key
//! at a time.
//!
//! Every mutating operation on [`KeyedMap`] is an action queued behind the
//! actions already submitted for the same key, so at most one action per key
//! runs at any time and actions for the same key observe each other in FIFO
//! order. Actions for different keys proceed independently. Snapshot readers
//! ([`get`], [`len`], iteration) never wait: they see the state left behind
//! by the most recently completed action.
//!
//! The compute family of operations runs user-supplied asynchronous actions
//! while holding the key's turn, which makes the map a convenient
//! single-flight cache: concurrent [`compute_if_absent`] calls for the same
//! key invoke the supplied function once.
//!
//! [`get`]: KeyedMap::get
//! [`len`]: KeyedMap::len
//! [`compute_if_absent`]: KeyedMap::compute_if_absent

use std::{
    cell::{Cell, RefCell},
    collections::hash_map::Entry::{Occupied, Vacant},
    collections::VecDeque,
    fmt,
    future::Future,
    hash::Hash,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use ahash::AHashMap;
use scopeguard::guard;

use crate::error::Result;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum Stage {
    /// Waiting behind earlier actions for the same key.
    Queued,
    /// The key's turn was handed to this ticket.
    Active,
    /// The waiting action was dropped; skipped when the queue advances.
    Cancelled,
}

struct Ticket {
    stage: Cell<Stage>,
    waker: RefCell<Option<Waker>>,
}

impl Ticket {
    fn queued() -> Rc<Ticket> {
        Rc::new(Ticket {
            stage: Cell::new(Stage::Queued),
            waker: RefCell::new(None),
        })
    }
}

struct MapInner<K, V> {
    /// The visible snapshot, in insertion order.
    entries: AHashMap<K, V>,
    order: Vec<K>,
    /// Keys with an action in flight. An absent key is idle; a present key
    /// with an empty queue has one action running and none queued.
    pending: AHashMap<K, VecDeque<Rc<Ticket>>>,
}

impl<K: Clone + Eq + Hash, V> MapInner<K, V> {
    fn get_cloned(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: K, value: V) -> Option<V> {
        match self.entries.insert(key.clone(), value) {
            Some(old) => Some(old),
            None => {
                self.order.push(key);
                None
            }
        }
    }

    fn take(&mut self, key: &K) -> Option<V> {
        let old = self.entries.remove(key);
        if old.is_some() {
            if let Some(position) = self.order.iter().position(|k| k == key) {
                self.order.remove(position);
            }
        }
        old
    }
}

/// Hands the key's turn to the next live queued action, or marks the key
/// idle. The next action is woken through the scheduler rather than run
/// inline, so arbitrarily long queues drain without recursion.
fn advance<K: Clone + Eq + Hash, V>(inner: &Rc<RefCell<MapInner<K, V>>>, key: &K) {
    let waker = {
        let mut map = inner.borrow_mut();
        let Some(queue) = map.pending.get_mut(key) else {
            return;
        };
        loop {
            match queue.pop_front() {
                Some(ticket) => {
                    if ticket.stage.get() == Stage::Cancelled {
                        continue;
                    }
                    ticket.stage.set(Stage::Active);
                    break ticket.waker.borrow_mut().take();
                }
                None => {
                    map.pending.remove(key);
                    break None;
                }
            }
        }
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

/// Resolves when the caller may run an action for `key`: immediately if the
/// key is idle (marking it busy), otherwise once every earlier action has
/// completed. The winner must call [`advance`] when its action is done;
/// dropping the future before that releases or abandons the claim cleanly.
struct EnterFuture<K: Clone + Eq + Hash, V> {
    inner: Rc<RefCell<MapInner<K, V>>>,
    key: K,
    ticket: Option<Rc<Ticket>>,
    finished: bool,
}

impl<K: Clone + Eq + Hash, V> EnterFuture<K, V> {
    fn lazy(inner: Rc<RefCell<MapInner<K, V>>>, key: K) -> Self {
        EnterFuture {
            inner,
            key,
            ticket: None,
            finished: false,
        }
    }

    /// For tickets that were pushed onto the key's queue by the caller
    /// before this future was created (see [`KeyedMap::clear`]).
    fn enqueued(inner: Rc<RefCell<MapInner<K, V>>>, key: K, ticket: Rc<Ticket>) -> Self {
        EnterFuture {
            inner,
            key,
            ticket: Some(ticket),
            finished: false,
        }
    }
}

impl<K: Clone + Eq + Hash, V> Future for EnterFuture<K, V> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // No field is structurally pinned and nothing is moved out of self.
        let this = unsafe { self.get_unchecked_mut() };
        match &this.ticket {
            None => {
                let mut map = this.inner.borrow_mut();
                match map.pending.entry(this.key.clone()) {
                    Vacant(entry) => {
                        entry.insert(VecDeque::new());
                        drop(map);
                        this.finished = true;
                        Poll::Ready(())
                    }
                    Occupied(mut entry) => {
                        let ticket = Ticket::queued();
                        *ticket.waker.borrow_mut() = Some(cx.waker().clone());
                        entry.get_mut().push_back(ticket.clone());
                        this.ticket = Some(ticket);
                        Poll::Pending
                    }
                }
            }
            Some(ticket) => match ticket.stage.get() {
                Stage::Active => {
                    this.finished = true;
                    Poll::Ready(())
                }
                Stage::Queued => {
                    *ticket.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
                Stage::Cancelled => unreachable!("a cancelled ticket cannot be polled"),
            },
        }
    }
}

impl<K: Clone + Eq + Hash, V> Drop for EnterFuture<K, V> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(ticket) = &self.ticket {
            match ticket.stage.get() {
                // The turn was handed over but never delivered; pass it on
                // so the key does not stay busy forever.
                Stage::Active => advance(&self.inner, &self.key),
                Stage::Queued => ticket.stage.set(Stage::Cancelled),
                Stage::Cancelled => {}
            }
        }
    }
}

/// A map with per-key serialized asynchronous actions.
///
/// Clones share the same underlying map. Stored values are cloned out to
/// readers and actions, so `V` is typically cheap to clone (or wrapped in an
/// [`Rc`]).
///
/// # Examples
///
/// ```
/// use fiber_sync::{sync::KeyedMap, LocalExecutor};
///
/// let ex = LocalExecutor::new();
/// ex.run(async {
///     let map = KeyedMap::new();
///     assert_eq!(map.insert(1, "one".to_string()).await, None);
///     assert_eq!(map.get(&1).as_deref(), Some("one"));
///
///     let value = map
///         .compute_if_absent(2, |k| async move { Ok(Some(k.to_string())) })
///         .await
///         .unwrap();
///     assert_eq!(value.as_deref(), Some("2"));
/// });
/// ```
pub struct KeyedMap<K, V> {
    inner: Rc<RefCell<MapInner<K, V>>>,
}

impl<K, V> Clone for KeyedMap<K, V> {
    fn clone(&self) -> Self {
        KeyedMap {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Clone + Eq + Hash, V: Clone> KeyedMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> KeyedMap<K, V> {
        KeyedMap {
            inner: Rc::new(RefCell::new(MapInner {
                entries: AHashMap::new(),
                order: Vec::new(),
                pending: AHashMap::new(),
            })),
        }
    }

    fn enter(&self, key: K) -> EnterFuture<K, V> {
        EnterFuture::lazy(self.inner.clone(), key)
    }

    // ---- snapshot readers ------------------------------------------------

    /// The number of entries visible in the snapshot.
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value currently mapped to `key`, ignoring in-flight actions. See
    /// [`get_latest`] for a read that waits for them.
    ///
    /// [`get_latest`]: KeyedMap::get_latest
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.borrow().get_cloned(key)
    }

    /// Whether the snapshot contains `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.borrow().entries.contains_key(key)
    }

    /// The keys in insertion order.
    pub fn keys(&self) -> Vec<K> {
        self.inner.borrow().order.clone()
    }

    /// The values in key insertion order.
    pub fn values(&self) -> Vec<V> {
        let map = self.inner.borrow();
        map.order
            .iter()
            .filter_map(|key| map.entries.get(key).cloned())
            .collect()
    }

    /// The entries in key insertion order.
    pub fn entries(&self) -> Vec<(K, V)> {
        let map = self.inner.borrow();
        map.order
            .iter()
            .filter_map(|key| map.entries.get(key).map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Calls `f` for every entry of the snapshot, in insertion order. The
    /// snapshot is taken up front, so `f` may use the map itself.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for (key, value) in self.entries() {
            f(&key, &value);
        }
    }

    // ---- queued operations ----------------------------------------------

    /// Resolves with the value mapped to `key` once every action already
    /// queued for that key has completed.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::KeyedMap, LocalExecutor};
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let map = KeyedMap::new();
    ///     map.insert(1, 10).await;
    ///     assert_eq!(map.get_latest(1).await, Some(10));
    ///     assert_eq!(map.get_latest(2).await, None);
    /// });
    /// ```
    pub async fn get_latest(&self, key: K) -> Option<V> {
        self.enter(key.clone()).await;
        let turn = guard((self.inner.clone(), key), |(inner, key)| {
            advance(&inner, &key)
        });
        let value = turn.0.borrow().get_cloned(&turn.1);
        value
    }

    /// Maps `key` to `value`, resolving with the previously mapped value.
    pub async fn insert(&self, key: K, value: V) -> Option<V> {
        self.enter(key.clone()).await;
        let turn = guard((self.inner.clone(), key), |(inner, key)| {
            advance(&inner, &key)
        });
        let old = turn.0.borrow_mut().put(turn.1.clone(), value);
        old
    }

    /// Removes `key`, resolving with the value that was mapped to it.
    pub async fn remove(&self, key: K) -> Option<V> {
        self.enter(key.clone()).await;
        let turn = guard((self.inner.clone(), key), |(inner, key)| {
            advance(&inner, &key)
        });
        let old = turn.0.borrow_mut().take(&turn.1);
        old
    }

    /// Removes `key` only if it is currently mapped to `expected`, resolving
    /// with whether the removal happened.
    pub async fn remove_if(&self, key: K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        self.enter(key.clone()).await;
        let turn = guard((self.inner.clone(), key), |(inner, key)| {
            advance(&inner, &key)
        });
        let matched = {
            let map = turn.0.borrow();
            matches!(map.entries.get(&turn.1), Some(current) if current == expected)
        };
        if matched {
            turn.0.borrow_mut().take(&turn.1);
        }
        matched
    }

    /// Maps `key` to `value` only if no value is mapped yet, resolving with
    /// the previously mapped value (`None` means the insert happened).
    pub async fn insert_if_absent(&self, key: K, value: V) -> Option<V> {
        self.enter(key.clone()).await;
        let turn = guard((self.inner.clone(), key), |(inner, key)| {
            advance(&inner, &key)
        });
        let old = turn.0.borrow().get_cloned(&turn.1);
        if old.is_none() {
            turn.0.borrow_mut().put(turn.1.clone(), value);
        }
        old
    }

    /// Maps `key` to `value` only if a value is already mapped, resolving
    /// with the replaced value.
    pub async fn replace(&self, key: K, value: V) -> Option<V> {
        self.enter(key.clone()).await;
        let turn = guard((self.inner.clone(), key), |(inner, key)| {
            advance(&inner, &key)
        });
        let old = turn.0.borrow().get_cloned(&turn.1);
        if old.is_some() {
            turn.0.borrow_mut().put(turn.1.clone(), value);
        }
        old
    }

    /// Maps `key` to `value` only if it is currently mapped to `expected`,
    /// resolving with whether the replacement happened.
    pub async fn replace_if(&self, key: K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        self.enter(key.clone()).await;
        let turn = guard((self.inner.clone(), key), |(inner, key)| {
            advance(&inner, &key)
        });
        let matched = {
            let map = turn.0.borrow();
            matches!(map.entries.get(&turn.1), Some(current) if current == expected)
        };
        if matched {
            turn.0.borrow_mut().put(turn.1.clone(), value);
        }
        matched
    }

    // ---- compute actions -------------------------------------------------

    /// If `key` has no value once its turn comes, runs `f` and maps the
    /// produced value (if any). Resolves with the value mapped afterwards.
    ///
    /// Concurrent calls for the same key are serialized, so only the first
    /// one invokes `f`; the rest observe its result.
    ///
    /// # Errors
    ///
    /// An `Err` returned by `f` propagates and leaves the map unchanged.
    pub async fn compute_if_absent<F, Fut>(&self, key: K, f: F) -> Result<Option<V>>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        self.enter(key.clone()).await;
        let turn = guard((self.inner.clone(), key), |(inner, key)| {
            advance(&inner, &key)
        });
        if let Some(existing) = turn.0.borrow().get_cloned(&turn.1) {
            return Ok(Some(existing));
        }
        let computed = f(turn.1.clone()).await?;
        if let Some(value) = &computed {
            turn.0.borrow_mut().put(turn.1.clone(), value.clone());
        }
        Ok(computed)
    }

    /// If `key` has a value once its turn comes, runs `f` on it and applies
    /// the result: a new value replaces the mapping, `None` removes it.
    /// Resolves with the value mapped afterwards, or `None` when the key was
    /// absent (in which case `f` is not invoked).
    ///
    /// # Errors
    ///
    /// An `Err` returned by `f` propagates and leaves the map unchanged.
    pub async fn compute_if_present<F, Fut>(&self, key: K, f: F) -> Result<Option<V>>
    where
        F: FnOnce(K, V) -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        self.enter(key.clone()).await;
        let turn = guard((self.inner.clone(), key), |(inner, key)| {
            advance(&inner, &key)
        });
        let Some(existing) = turn.0.borrow().get_cloned(&turn.1) else {
            return Ok(None);
        };
        let computed = f(turn.1.clone(), existing).await?;
        let mut map = turn.0.borrow_mut();
        Ok(match computed {
            Some(value) => {
                map.put(turn.1.clone(), value.clone());
                Some(value)
            }
            None => {
                map.take(&turn.1);
                None
            }
        })
    }

    /// Runs `f` on the current mapping for `key` (present or not) and
    /// applies the result: a new value replaces the mapping, `None` removes
    /// it. Resolves with the value mapped afterwards.
    ///
    /// # Errors
    ///
    /// An `Err` returned by `f` propagates and leaves the map unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::KeyedMap, LocalExecutor};
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let map = KeyedMap::new();
    ///     map.insert(1, 1).await;
    ///     let doubled = map
    ///         .compute(1, |_k, old| async move { Ok(old.map(|v| v * 2)) })
    ///         .await
    ///         .unwrap();
    ///     assert_eq!(doubled, Some(2));
    /// });
    /// ```
    pub async fn compute<F, Fut>(&self, key: K, f: F) -> Result<Option<V>>
    where
        F: FnOnce(K, Option<V>) -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        self.enter(key.clone()).await;
        let turn = guard((self.inner.clone(), key), |(inner, key)| {
            advance(&inner, &key)
        });
        let old = turn.0.borrow().get_cloned(&turn.1);
        let computed = f(turn.1.clone(), old).await?;
        let mut map = turn.0.borrow_mut();
        Ok(match computed {
            Some(value) => {
                map.put(turn.1.clone(), value.clone());
                Some(value)
            }
            None => {
                map.take(&turn.1);
                None
            }
        })
    }

    /// Maps `key` to `value` if it has no value once its turn comes;
    /// otherwise runs `f(current, value)` and applies the result (`None`
    /// removes the mapping). Resolves with the value mapped afterwards.
    ///
    /// # Errors
    ///
    /// An `Err` returned by `f` propagates and leaves the map unchanged.
    ///
    /// # Examples
    ///
    /// Counting occurrences:
    ///
    /// ```
    /// use fiber_sync::{sync::KeyedMap, LocalExecutor};
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let counts = KeyedMap::new();
    ///     for word in ["a", "b", "a"] {
    ///         counts
    ///             .merge(word, 1, |old, new| async move { Ok(Some(old + new)) })
    ///             .await
    ///             .unwrap();
    ///     }
    ///     assert_eq!(counts.get(&"a"), Some(2));
    ///     assert_eq!(counts.get(&"b"), Some(1));
    /// });
    /// ```
    pub async fn merge<F, Fut>(&self, key: K, value: V, f: F) -> Result<Option<V>>
    where
        F: FnOnce(V, V) -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        self.enter(key.clone()).await;
        let turn = guard((self.inner.clone(), key), |(inner, key)| {
            advance(&inner, &key)
        });
        let old = turn.0.borrow().get_cloned(&turn.1);
        match old {
            None => {
                turn.0.borrow_mut().put(turn.1.clone(), value.clone());
                Ok(Some(value))
            }
            Some(old) => {
                let merged = f(old, value).await?;
                let mut map = turn.0.borrow_mut();
                Ok(match merged {
                    Some(value) => {
                        map.put(turn.1.clone(), value.clone());
                        Some(value)
                    }
                    None => {
                        map.take(&turn.1);
                        None
                    }
                })
            }
        }
    }

    // ---- bulk ------------------------------------------------------------

    /// Empties the map.
    ///
    /// The visible snapshot is emptied immediately, before the returned
    /// future is first polled. For every key that had an action in flight a
    /// tail delete is queued behind it, sweeping whatever those actions
    /// write later; the returned future resolves once all tails have run.
    /// Entries inserted after this call are not re-cleared.
    ///
    /// # Examples
    ///
    /// ```
    /// use fiber_sync::{sync::KeyedMap, LocalExecutor};
    ///
    /// let ex = LocalExecutor::new();
    /// ex.run(async {
    ///     let map = KeyedMap::new();
    ///     map.insert(1, "x").await;
    ///     let done = map.clear();
    ///     assert!(map.is_empty());
    ///     done.await;
    /// });
    /// ```
    pub fn clear(&self) -> impl Future<Output = ()> {
        let inner = self.inner.clone();
        let mut tails = Vec::new();
        {
            let mut map = inner.borrow_mut();
            let keys: Vec<K> = map.order.clone();
            for key in keys {
                map.take(&key);
                if let Some(queue) = map.pending.get_mut(&key) {
                    let ticket = Ticket::queued();
                    queue.push_back(ticket.clone());
                    tails.push(EnterFuture::enqueued(inner.clone(), key, ticket));
                }
            }
        }
        async move {
            for tail in tails {
                let key = tail.key.clone();
                tail.await;
                let turn = guard((inner.clone(), key), |(inner, key)| advance(&inner, &key));
                turn.0.borrow_mut().take(&turn.1);
            }
        }
    }
}

impl<K: Clone + Eq + Hash, V: Clone> Default for KeyedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for KeyedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.inner.borrow();
        f.debug_struct("KeyedMap")
            .field("len", &map.entries.len())
            .field("pending_keys", &map.pending.len())
            .finish()
    }
}
