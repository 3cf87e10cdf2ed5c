// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! Set of synchronization primitives.
//!
//! This module provides a set of coordination primitives which are optimized
//! to be used by fibers which are driven by a single-threaded cooperative
//! executor.
//!
//! The following primitives are provided.
//!
//! 1. [`CountDownLatch`] - a one-shot barrier. Fibers calling [`wait`]
//!    suspend until [`count_down`] has been called as many times as the
//!    latch's initial count.
//!
//! 2. [`Semaphore`] - a counting semaphore maintaining a set of permits.
//!    Each call to [`acquire`] suspends the fiber if necessary until enough
//!    permits are available, and then takes them. Each call to [`release`]
//!    adds permits, potentially releasing suspended acquirers in FIFO
//!    order.
//!
//! 3. [`ReadWriteLock`] - a read-write lock handing out explicit
//!    [`ReadLock`]/[`WriteLock`] handles, with a fair or non-fair admission
//!    policy and direct upgrade/downgrade between the two access modes.
//!
//! 4. [`KeyedMap`] - a map whose mutations are asynchronous actions
//!    serialized per key, with single-flight compute operations.
//!
//! [`wait`]: CountDownLatch::wait
//! [`count_down`]: CountDownLatch::count_down
//! [`acquire`]: Semaphore::acquire
//! [`release`]: Semaphore::release

mod keyed_map;
mod latch;
mod rwlock;
mod semaphore;

pub use self::{keyed_map::*, latch::*, rwlock::*, semaphore::*};
