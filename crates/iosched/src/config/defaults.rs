//! Compile-time defaults for `IoSchedConfig`.
//!
//! Every value here can be overridden at runtime through the matching
//! `IOS_*` environment variable or, after `init`, through sysctl.

use crate::limiter::LimiterKind;

/// Elevator sort: `None` follows `Periph::is_rotational`
pub const SORT_QUEUE: Option<bool> = None;

/// Separate write queue with read bias
pub const DYNAMIC: bool = false;

/// Reads served per write while both are waiting (dynamic mode only)
pub const READ_BIAS: u32 = 100;

/// Maximum non-trim commands in flight (transport openings)
pub const MAX_ACTIVE: usize = 32;

/// Logical block size in bytes
pub const BLOCK_SIZE: u64 = iosched_core::constants::DEFAULT_BLOCK_SIZE;

/// FIFO entries reserved at init
pub const QUEUE_CAPACITY: usize = 256;

/// Trims to accumulate before releasing a batch (0 = release immediately)
pub const TRIM_GOAL: u32 = 0;

/// Ticks a trim may wait for the goal before release (0 = wait for goal)
pub const TRIM_TICKS: u32 = 0;

/// Largest extent a batch may cover, in blocks (2 GiB at 512-byte blocks)
pub const TRIM_MAX_BLOCKS: u64 = 1 << 22;

/// Most bios merged into one batch
pub const TRIM_MAX_RANGES: usize = 64;

/// Completions slower than this are reported (0 = off)
pub const LATENCY_THRESHOLD_US: u64 = 0;

/// Latency EMA weight is `2^-ALPHA_BITS`
pub const ALPHA_BITS: u32 = 9;

pub const READ_LIMITER: LimiterKind = LimiterKind::None;
pub const WRITE_LIMITER: LimiterKind = LimiterKind::None;
pub const TRIM_LIMITER: LimiterKind = LimiterKind::None;
pub const LIMIT_MAX: u64 = 0;

/// Slots in a `DoneQueue`
pub const DONE_QUEUE_DEPTH: usize = 1024;
