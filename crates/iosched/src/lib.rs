//! # iosched
//!
//! Per-peripheral block I/O scheduler.
//!
//! This crate provides:
//! - Request queue with FIFO or elevator (LBA-sorted) ordering and barriers
//! - Trim coalescing into contiguous batches
//! - Per-queue limiters (queue depth, IOPS, bandwidth) and an opening cap
//! - Latency and throughput statistics with a lock-free work-flag summary
//! - A sysctl-style tunable tree and a lock-free deferred completion queue
//!
//! # Example
//!
//! ```rust,ignore
//! use iosched::{init, IoSchedConfig};
//! use iosched_core::{Bio, Ccb, CcbStatus};
//!
//! let sched = init(periph, IoSchedConfig::from_env())?;
//! sched.queue_work(Bio::read(2048, 8));
//!
//! if let Some(mut bio) = sched.next_bio() {
//!     let mut ccb = Ccb::issue();
//!     // ... hardware ...
//!     ccb.complete(CcbStatus::ReqCmp);
//!     sched.bio_complete(&mut bio, &ccb)?;
//!     bio.done();
//! }
//! sched.fini()?;
//! ```

pub mod config;
pub mod devstat;
pub mod done_queue;
pub mod limiter;
pub mod scheduler;
pub mod stats;
pub mod sysctl;

mod queue;
mod trim;

// Re-exports
pub use config::{IoSchedConfig, LimiterConfig};
pub use devstat::DevStatCounters;
pub use done_queue::DoneQueue;
pub use limiter::LimiterKind;
pub use scheduler::{fini, init, init_with_devstat, CompletionStatus, IoScheduler, LatencyCallback};
pub use stats::{Counters, IoSchedStats, QueueStats};
pub use sysctl::SysctlCtx;
pub use trim::TrimBatch;
