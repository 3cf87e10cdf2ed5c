// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use std::fmt;
use thiserror::Error;

/// Result type alias that all fiber-sync public API functions can use.
pub type Result<T> = std::result::Result<T, SyncError>;

/// The kind of lock access a [`ReadWriteLock`] handle represents.
///
/// Used to report handle-state violations with the right wording.
///
/// [`ReadWriteLock`]: crate::sync::ReadWriteLock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared read access.
    Read,
    /// Exclusive write access.
    Write,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Read => f.write_str("Read"),
            LockKind::Write => f.write_str("Write"),
        }
    }
}

/// Composite error type to encompass all error conditions fiber-sync
/// produces.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A count or permit argument was negative. Reported synchronously at
    /// the call site.
    #[error("{value} < 0")]
    Negative {
        /// The offending argument.
        value: i64,
    },

    /// An operation was attempted on a lock handle that no longer holds the
    /// lock.
    #[error("{kind} lock is no longer held")]
    NotHeld {
        /// Whether the handle was a read or a write handle.
        kind: LockKind,
    },

    /// A timed acquisition gave up because its deadline passed before the
    /// request could be satisfied.
    #[error("Timeout expired")]
    TimedOut,

    /// A user-supplied compute action failed. The failure is delivered
    /// through the returned future and the map entry is left unchanged.
    #[error("compute action failed: {0}")]
    Compute(#[source] Box<dyn std::error::Error + 'static>),
}

impl SyncError {
    /// Wraps an arbitrary error produced by a compute action.
    pub fn compute<E: std::error::Error + 'static>(err: E) -> Self {
        SyncError::Compute(Box::new(err))
    }

    pub(crate) fn negative(value: i64) -> Self {
        SyncError::Negative { value }
    }

    pub(crate) fn not_held(kind: LockKind) -> Self {
        SyncError::NotHeld { kind }
    }
}

/// Validates a count/permit argument, converting it to the unsigned form
/// used internally.
pub(crate) fn check_non_negative(value: i64) -> Result<u64> {
    if value < 0 {
        return Err(SyncError::negative(value));
    }
    Ok(value as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negative_argument_message() {
        let err = SyncError::negative(-3);
        assert_eq!(err.to_string(), "-3 < 0");
    }

    #[test]
    fn handle_state_messages() {
        assert_eq!(
            SyncError::not_held(LockKind::Read).to_string(),
            "Read lock is no longer held"
        );
        assert_eq!(
            SyncError::not_held(LockKind::Write).to_string(),
            "Write lock is no longer held"
        );
    }

    #[test]
    fn timeout_message() {
        assert_eq!(SyncError::TimedOut.to_string(), "Timeout expired");
    }

    #[test]
    fn check_rejects_negative_only() {
        assert!(check_non_negative(-1).is_err());
        assert_eq!(check_non_negative(0).unwrap(), 0);
        assert_eq!(check_non_negative(42).unwrap(), 42);
    }
}
