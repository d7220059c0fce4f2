//! Error types for the I/O scheduler

use core::fmt;

use crate::id::BioId;

/// Result type for scheduler operations
pub type IoSchedResult<T> = Result<T, IoSchedError>;

/// Errors that can occur in scheduler operations.
///
/// An empty queue is never an error: dispatch calls return `None` for it.
/// I/O failures reported by hardware are not errors of the scheduler either;
/// they travel in the bio and in `CompletionStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoSchedError {
    /// Scheduler state could not be allocated
    AllocationFailed,

    /// Configuration rejected by validation
    InvalidConfig(&'static str),

    /// `fini` called with work still queued or in flight
    NotDrained { queued: usize, inflight: usize },

    /// Completion reported for a bio that was never dispatched
    NotDispatched(BioId),

    /// Sysctl path is not registered
    UnknownTunable(String),

    /// Sysctl node cannot be written
    ReadOnlyTunable(String),

    /// Value out of range for the sysctl node
    InvalidTunable { name: String, value: i64 },

    /// The scheduler behind a sysctl node has been torn down
    Gone,
}

impl fmt::Display for IoSchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoSchedError::AllocationFailed => write!(f, "scheduler allocation failed"),
            IoSchedError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            IoSchedError::NotDrained { queued, inflight } => write!(
                f,
                "scheduler not drained: {} queued, {} in flight",
                queued, inflight
            ),
            IoSchedError::NotDispatched(id) => {
                write!(f, "bio {} completed but was never dispatched", id)
            }
            IoSchedError::UnknownTunable(name) => write!(f, "unknown tunable {}", name),
            IoSchedError::ReadOnlyTunable(name) => write!(f, "tunable {} is read-only", name),
            IoSchedError::InvalidTunable { name, value } => {
                write!(f, "invalid value {} for tunable {}", value, name)
            }
            IoSchedError::Gone => write!(f, "scheduler is gone"),
        }
    }
}

impl std::error::Error for IoSchedError {}

impl From<std::collections::TryReserveError> for IoSchedError {
    fn from(_: std::collections::TryReserveError) -> Self {
        IoSchedError::AllocationFailed
    }
}

impl IoSchedError {
    /// Errno equivalent, for callers that speak the kernel convention.
    pub fn errno(&self) -> i32 {
        match self {
            IoSchedError::AllocationFailed => libc::ENOMEM,
            IoSchedError::InvalidConfig(_) | IoSchedError::InvalidTunable { .. } => libc::EINVAL,
            IoSchedError::NotDrained { .. } => libc::EBUSY,
            IoSchedError::NotDispatched(_) => libc::EINVAL,
            IoSchedError::UnknownTunable(_) => libc::ENOENT,
            IoSchedError::ReadOnlyTunable(_) => libc::EPERM,
            IoSchedError::Gone => libc::ENXIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = IoSchedError::NotDrained { queued: 2, inflight: 1 };
        assert_eq!(format!("{}", e), "scheduler not drained: 2 queued, 1 in flight");

        let e = IoSchedError::NotDispatched(BioId::new(9));
        assert_eq!(format!("{}", e), "bio #9 completed but was never dispatched");
    }

    #[test]
    fn test_try_reserve_conversion() {
        let mut v: Vec<u64> = Vec::new();
        let err: IoSchedError = v.try_reserve(usize::MAX).unwrap_err().into();
        assert_eq!(err, IoSchedError::AllocationFailed);
        assert_eq!(err.errno(), libc::ENOMEM);
    }
}
