//! Command control block
//!
//! The in-flight hardware command paired with a dispatched bio. Lives for one
//! transaction: issued when the driver hands the bio to the transport,
//! completed when the transport reports back.

use std::time::{Duration, Instant};

/// Transport status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcbStatus {
    /// Issued, no status yet
    InProgress,
    /// Request completed without error
    ReqCmp,
    /// Aborted by the host
    ReqAborted,
    /// Command timed out
    CmdTimeout,
    /// Device went away
    DevNotThere,
    /// Device returned an error status
    ScsiStatusError,
}

impl CcbStatus {
    /// Errno the block layer should see, `None` on success.
    pub fn errno(&self) -> Option<i32> {
        match self {
            CcbStatus::InProgress | CcbStatus::ReqCmp => None,
            CcbStatus::ReqAborted => Some(libc::ECANCELED),
            CcbStatus::CmdTimeout => Some(libc::ETIMEDOUT),
            CcbStatus::DevNotThere => Some(libc::ENXIO),
            CcbStatus::ScsiStatusError => Some(libc::EIO),
        }
    }
}

/// In-flight command record
#[derive(Debug, Clone, Copy)]
pub struct Ccb {
    status: CcbStatus,
    issued_at: Instant,
    completed_at: Option<Instant>,
}

impl Ccb {
    /// Issue a command now.
    pub fn issue() -> Self {
        Self::issued_at(Instant::now())
    }

    pub fn issued_at(at: Instant) -> Self {
        Self {
            status: CcbStatus::InProgress,
            issued_at: at,
            completed_at: None,
        }
    }

    /// Mark the command finished now.
    pub fn complete(&mut self, status: CcbStatus) {
        self.complete_at(status, Instant::now());
    }

    pub fn complete_at(&mut self, status: CcbStatus, at: Instant) {
        self.status = status;
        self.completed_at = Some(at);
    }

    #[inline]
    pub fn status(&self) -> CcbStatus {
        self.status
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Time spent in the transport. `None` until completed.
    pub fn latency(&self) -> Option<Duration> {
        self.completed_at
            .map(|done| done.saturating_duration_since(self.issued_at))
    }
}
