// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! Task plumbing for the local executor.
//!
//! A [`Task`] owns a spawned future and a flag telling whether it is already
//! sitting in the executor's run queue. Wakers created for a task simply
//! re-enqueue it; the executor polls queued tasks one batch at a time so a
//! waker fired from inside a poll takes effect only after the current poll
//! returns.

pub(crate) mod waker_fn;

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use waker_fn::waker_fn;

/// The executor's run queue. Tasks push themselves here when woken.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    pub(crate) runnable: RefCell<VecDeque<Rc<Task>>>,
}

/// A spawned unit of work.
///
/// The future slot is `None` once the task has run to completion; stale
/// wake-ups of a finished task are no-ops.
pub(crate) struct Task {
    future: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    queued: Cell<bool>,
    queue: Weak<RunQueue>,
}

impl Task {
    pub(crate) fn new(
        queue: &Rc<RunQueue>,
        future: impl Future<Output = ()> + 'static,
    ) -> Rc<Task> {
        Rc::new(Task {
            future: RefCell::new(Some(Box::pin(future))),
            queued: Cell::new(false),
            queue: Rc::downgrade(queue),
        })
    }

    /// Enqueues the task unless it is already queued. Called by wakers; the
    /// task runs only after the executor gets back control.
    pub(crate) fn schedule(self: &Rc<Self>) {
        if self.queued.replace(true) {
            return;
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.runnable.borrow_mut().push_back(self.clone());
        }
    }

    /// Polls the task's future once.
    pub(crate) fn run(self: Rc<Self>) {
        self.queued.set(false);

        let future = self.future.borrow_mut().take();
        let Some(mut future) = future else {
            // Task already completed; a waker outlived it.
            return;
        };

        let task = self.clone();
        let waker = waker_fn(move || task.schedule());
        let mut cx = Context::from_waker(&waker);

        if future.as_mut().poll(&mut cx).is_pending() {
            *self.future.borrow_mut() = Some(future);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("queued", &self.queued.get())
            .finish_non_exhaustive()
    }
}

struct JoinState<T> {
    result: Option<T>,
    waker: Option<Waker>,
}

/// A handle to a spawned task that can be awaited for the task's output.
///
/// Dropping the handle detaches the task: it keeps running to completion and
/// its output is discarded.
#[must_use = "a JoinHandle does nothing unless awaited; drop it explicitly to detach"]
pub struct JoinHandle<T> {
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> JoinHandle<T> {
    /// Builds a handle together with the wrapper future that stores the
    /// spawned future's output and wakes the joiner.
    pub(crate) fn wrap(
        future: impl Future<Output = T> + 'static,
    ) -> (JoinHandle<T>, impl Future<Output = ()>)
    where
        T: 'static,
    {
        let state = Rc::new(RefCell::new(JoinState {
            result: None,
            waker: None,
        }));
        let handle = JoinHandle {
            state: state.clone(),
        };
        let wrapper = async move {
            let value = future.await;
            let mut state = state.borrow_mut();
            state.result = Some(value);
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        };
        (handle, wrapper)
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        match state.result.take() {
            Some(value) => Poll::Ready(value),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("finished", &self.state.borrow().result.is_some())
            .finish()
    }
}
