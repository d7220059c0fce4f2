//! # iosched-core
//!
//! Core types and traits for the peripheral I/O scheduler.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The scheduler itself lives in `iosched`.
//!
//! ## Modules
//!
//! - `id` - Bio identifier type
//! - `bio` - Block I/O request, command and flags
//! - `ccb` - In-flight command control block
//! - `flags` - Work-pending flag word
//! - `error` - Error types
//! - `traits` - Peripheral and devstat collaborator traits
//! - `klog` - Kernel-style leveled log macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod bio;
pub mod ccb;
pub mod flags;
pub mod error;
pub mod traits;
pub mod klog;
pub mod env;

// Re-exports for convenience
pub use id::BioId;
pub use bio::{Bio, BioCmd, BioFlags, BioDone};
pub use ccb::{Ccb, CcbStatus};
pub use flags::WorkFlags;
pub use error::{IoSchedError, IoSchedResult};
pub use traits::{DevStat, Periph};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_tristate};

/// Constants shared between the scheduler and its consumers
pub mod constants {
    /// Default logical block size in bytes
    pub const DEFAULT_BLOCK_SIZE: u64 = 512;

    /// Number of latency histogram buckets
    pub const LAT_BUCKETS: usize = 20;

    /// Upper bound of the first latency bucket, in microseconds.
    /// Each following bucket doubles.
    pub const LAT_FIRST_BUCKET_US: u64 = 20;
}
