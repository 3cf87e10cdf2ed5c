// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! Timing related primitives: one-shot timers and a timeout combinator.
mod timer_impl;

pub use timer_impl::{timeout, Timeout, Timer};

/// Sleep for some time.
///
/// ```
/// use fiber_sync::{timer::sleep, LocalExecutor};
/// use std::time::Duration;
///
/// let ex = LocalExecutor::new();
/// ex.run(async {
///     sleep(Duration::from_millis(5)).await;
/// });
/// ```
pub async fn sleep(wait: std::time::Duration) {
    Timer::new(wait).await;
}
