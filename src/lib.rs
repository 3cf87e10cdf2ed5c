// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! # fiber-sync - coordination primitives for single-threaded executors.
//!
//! This crate provides in-process coordination primitives for fibers driven
//! by a cooperative, single-threaded executor: a one-shot
//! [`CountDownLatch`](sync::CountDownLatch), a counting
//! [`Semaphore`](sync::Semaphore) with batched and timed acquisition, a
//! fair/non-fair [`ReadWriteLock`](sync::ReadWriteLock) with handle upgrade
//! and downgrade, and a [`KeyedMap`](sync::KeyedMap) that serializes
//! asynchronous actions per key.
//!
//! None of the primitives use helper threads, atomics or memory barriers:
//! correctness relies on the run-to-completion discipline of the executor.
//! State only changes between suspension points, and wakers never run a
//! fiber inline - a woken fiber observes the change after the current
//! callback returns. That makes the primitives unsuitable for sharing
//! across threads (nothing here is `Send`) and very cheap within one.
//!
//! Waiting is expressed through futures. An operation that cannot complete
//! immediately enqueues the calling fiber and suspends it; dropping such a
//! future (for example when a surrounding [`timeout`](timer::timeout)
//! fires) removes the waiter from its queue. Timed variants of the blocking
//! operations are provided where the underlying protocol supports
//! cancellation.
//!
//! ```
//! use fiber_sync::{spawn_local, sync::Semaphore, LocalExecutor};
//! use std::rc::Rc;
//!
//! let ex = LocalExecutor::new();
//! ex.run(async {
//!     let sem = Rc::new(Semaphore::new(0).unwrap());
//!
//!     let waiter = spawn_local({
//!         let sem = sem.clone();
//!         async move {
//!             sem.acquire(2).await.unwrap();
//!         }
//!     });
//!
//!     sem.release(2).unwrap();
//!     waiter.await;
//!     assert_eq!(sem.available_permits(), 0);
//! });
//! ```
//!
//! The crate ships the minimal runtime substrate the primitives need: the
//! [`LocalExecutor`] run loop and the [`timer`] service it drives. Programs
//! embedding a different single-threaded runtime only need to poll the
//! primitive futures and provide wake-ups; the timer-backed operations are
//! the only ones tied to this crate's executor.
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod error;
mod executor;
mod task;

#[cfg(test)]
macro_rules! test_executor {
    ($( $fut:expr ),+ ) => {{
        use futures::future::join_all;

        let local_ex = crate::executor::LocalExecutor::new();
        local_ex.run(async move {
            let mut joins = Vec::new();
            $(
                joins.push(crate::executor::spawn_local($fut));
            )*
            join_all(joins).await;
        });
    }}
}

// Wait for a variable to acquire a specific value.
// The variable is expected to be a Rc<RefCell>
//
// Alternatively it is possible to pass a timeout in seconds
// (through an Instant object)
//
// Updates to the variable gating the condition can be done (if convenient)
// through update_cond!() (below)
//
// Mostly useful for tests.
#[cfg(test)]
macro_rules! wait_on_cond {
    ($var:expr, $val:expr) => {
        loop {
            if *($var.borrow()) == $val {
                break;
            }
            crate::executor::yield_now().await;
        }
    };
    ($var:expr, $val:expr, $instantval:expr) => {
        let start = std::time::Instant::now();
        loop {
            if *($var.borrow()) == $val {
                break;
            }

            if start.elapsed().as_secs() > $instantval {
                panic!("test timed out");
            }
            crate::executor::yield_now().await;
        }
    };
}

#[cfg(test)]
macro_rules! update_cond {
    ($cond:expr, $val:expr) => {
        *($cond.borrow_mut()) = $val;
    };
}

#[cfg(test)]
macro_rules! make_shared_var {
    ($var:expr, $( $name:ident ),+ ) => {
        let local_name = std::rc::Rc::new($var);
        $( let $name = local_name.clone(); )*
    }
}

#[cfg(test)]
macro_rules! make_shared_var_mut {
    ($var:expr, $( $name:ident ),+ ) => {
        let local_name = std::rc::Rc::new(std::cell::RefCell::new($var));
        $( let $name = local_name.clone(); )*
    }
}

pub mod sync;
pub mod timer;

pub use crate::error::{LockKind, Result, SyncError};
pub use crate::executor::{spawn_local, yield_now, LocalExecutor};
pub use crate::task::JoinHandle;
pub use enclose::enclose;

/// Provides common imports that almost all fiber-sync applications will
/// need.
pub mod prelude {
    pub use crate::{spawn_local, yield_now, LocalExecutor, Result, SyncError};
}
