//! Scheduler configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. sysctl writes (after `init`)
//! 2. Environment variables, read by `from_env()`
//! 3. Library defaults (`defaults.rs`)
//!
//! # Example
//!
//! ```rust,ignore
//! use iosched::config::IoSchedConfig;
//!
//! let config = IoSchedConfig::from_env()
//!     .max_active(64)
//!     .trim_goal(8)
//!     .trim_ticks(4);
//! ```

pub mod defaults;

use std::fmt;
use std::time::Duration;

use iosched_core::env::{env_get, env_get_bool, env_get_tristate};
use iosched_core::IoSchedError;

use crate::limiter::LimiterKind;

/// Limiter settings for one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    pub kind: LimiterKind,
    pub max: u64,
}

impl LimiterConfig {
    pub const fn none() -> Self {
        Self { kind: LimiterKind::None, max: 0 }
    }

    pub const fn new(kind: LimiterKind, max: u64) -> Self {
        Self { kind, max }
    }
}

/// Scheduler configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct IoSchedConfig {
    /// Elevator sort; `None` follows the periph's rotational hint
    pub sort_queue: Option<bool>,
    /// Keep writes in their own queue and favor reads
    pub dynamic: bool,
    /// Reads served per write while both wait
    pub read_bias: u32,
    /// Maximum non-trim commands in flight
    pub max_active: usize,
    /// Logical block size in bytes
    pub block_size: u64,
    /// FIFO entries reserved at init
    pub queue_capacity: usize,
    /// Trims to accumulate before a batch is released
    pub trim_goal: u32,
    /// Ticks a trim may wait for the goal
    pub trim_ticks: u32,
    /// Largest batch extent in blocks
    pub trim_max_blocks: u64,
    /// Most bios per batch
    pub trim_max_ranges: usize,
    /// Report completions slower than this (zero disables)
    pub latency_threshold: Duration,
    /// Latency EMA weight exponent
    pub alpha_bits: u32,
    pub read_limiter: LimiterConfig,
    pub write_limiter: LimiterConfig,
    pub trim_limiter: LimiterConfig,
}

impl Default for IoSchedConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl IoSchedConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `IOS_SORT_QUEUE` - `1`, `0`, or `-1`/`auto`
    /// - `IOS_DYNAMIC` - separate write queue (0/1)
    /// - `IOS_READ_BIAS` - reads per write
    /// - `IOS_MAX_ACTIVE` - commands in flight
    /// - `IOS_BLOCK_SIZE` - bytes per block
    /// - `IOS_QUEUE_CAPACITY` - entries reserved at init
    /// - `IOS_TRIM_GOAL`, `IOS_TRIM_TICKS` - trim batching
    /// - `IOS_TRIM_MAX_BLOCKS`, `IOS_TRIM_MAX_RANGES` - batch limits
    /// - `IOS_LATENCY_THRESHOLD_US` - slow completion report
    /// - `IOS_ALPHA_BITS` - EMA weight
    /// - `IOS_{READ,WRITE,TRIM}_LIMITER` - `none|queue_depth|iops|bandwidth`
    /// - `IOS_{READ,WRITE,TRIM}_LIMIT` - limiter maximum
    pub fn from_env() -> Self {
        let mut config = Self::new();
        config.sort_queue = env_get_tristate("IOS_SORT_QUEUE").or(defaults::SORT_QUEUE);
        config.dynamic = env_get_bool("IOS_DYNAMIC", defaults::DYNAMIC);
        config.read_bias = env_get("IOS_READ_BIAS", defaults::READ_BIAS);
        config.max_active = env_get("IOS_MAX_ACTIVE", defaults::MAX_ACTIVE);
        config.block_size = env_get("IOS_BLOCK_SIZE", defaults::BLOCK_SIZE);
        config.queue_capacity = env_get("IOS_QUEUE_CAPACITY", defaults::QUEUE_CAPACITY);
        config.trim_goal = env_get("IOS_TRIM_GOAL", defaults::TRIM_GOAL);
        config.trim_ticks = env_get("IOS_TRIM_TICKS", defaults::TRIM_TICKS);
        config.trim_max_blocks = env_get("IOS_TRIM_MAX_BLOCKS", defaults::TRIM_MAX_BLOCKS);
        config.trim_max_ranges = env_get("IOS_TRIM_MAX_RANGES", defaults::TRIM_MAX_RANGES);
        config.latency_threshold = Duration::from_micros(env_get(
            "IOS_LATENCY_THRESHOLD_US",
            defaults::LATENCY_THRESHOLD_US,
        ));
        config.alpha_bits = env_get("IOS_ALPHA_BITS", defaults::ALPHA_BITS);
        config.read_limiter = limiter_from_env("READ", defaults::READ_LIMITER);
        config.write_limiter = limiter_from_env("WRITE", defaults::WRITE_LIMITER);
        config.trim_limiter = limiter_from_env("TRIM", defaults::TRIM_LIMITER);
        config
    }

    /// Library defaults only, no environment. Useful for tests.
    pub fn new() -> Self {
        Self {
            sort_queue: defaults::SORT_QUEUE,
            dynamic: defaults::DYNAMIC,
            read_bias: defaults::READ_BIAS,
            max_active: defaults::MAX_ACTIVE,
            block_size: defaults::BLOCK_SIZE,
            queue_capacity: defaults::QUEUE_CAPACITY,
            trim_goal: defaults::TRIM_GOAL,
            trim_ticks: defaults::TRIM_TICKS,
            trim_max_blocks: defaults::TRIM_MAX_BLOCKS,
            trim_max_ranges: defaults::TRIM_MAX_RANGES,
            latency_threshold: Duration::from_micros(defaults::LATENCY_THRESHOLD_US),
            alpha_bits: defaults::ALPHA_BITS,
            read_limiter: LimiterConfig::new(defaults::READ_LIMITER, defaults::LIMIT_MAX),
            write_limiter: LimiterConfig::new(defaults::WRITE_LIMITER, defaults::LIMIT_MAX),
            trim_limiter: LimiterConfig::new(defaults::TRIM_LIMITER, defaults::LIMIT_MAX),
        }
    }

    // Builder methods

    pub fn sort_queue(mut self, sort: Option<bool>) -> Self {
        self.sort_queue = sort;
        self
    }

    pub fn dynamic(mut self, enable: bool) -> Self {
        self.dynamic = enable;
        self
    }

    pub fn read_bias(mut self, bias: u32) -> Self {
        self.read_bias = bias;
        self
    }

    pub fn max_active(mut self, n: usize) -> Self {
        self.max_active = n;
        self
    }

    pub fn block_size(mut self, bytes: u64) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    pub fn trim_goal(mut self, n: u32) -> Self {
        self.trim_goal = n;
        self
    }

    pub fn trim_ticks(mut self, n: u32) -> Self {
        self.trim_ticks = n;
        self
    }

    pub fn trim_max_blocks(mut self, n: u64) -> Self {
        self.trim_max_blocks = n;
        self
    }

    pub fn trim_max_ranges(mut self, n: usize) -> Self {
        self.trim_max_ranges = n;
        self
    }

    pub fn latency_threshold(mut self, d: Duration) -> Self {
        self.latency_threshold = d;
        self
    }

    pub fn alpha_bits(mut self, bits: u32) -> Self {
        self.alpha_bits = bits;
        self
    }

    pub fn read_limiter(mut self, l: LimiterConfig) -> Self {
        self.read_limiter = l;
        self
    }

    pub fn write_limiter(mut self, l: LimiterConfig) -> Self {
        self.write_limiter = l;
        self
    }

    pub fn trim_limiter(mut self, l: LimiterConfig) -> Self {
        self.trim_limiter = l;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active == 0 {
            return Err(ConfigError::InvalidValue("max_active must be > 0"));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ConfigError::InvalidValue("block_size must be a power of two"));
        }
        if self.trim_max_blocks == 0 {
            return Err(ConfigError::InvalidValue("trim_max_blocks must be > 0"));
        }
        if self.trim_max_ranges == 0 {
            return Err(ConfigError::InvalidValue("trim_max_ranges must be > 0"));
        }
        if !(1..=16).contains(&self.alpha_bits) {
            return Err(ConfigError::InvalidValue("alpha_bits must be in 1..=16"));
        }
        for l in [&self.read_limiter, &self.write_limiter, &self.trim_limiter] {
            if l.kind != LimiterKind::None && l.max == 0 {
                return Err(ConfigError::InvalidValue("an active limiter needs max > 0"));
            }
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("I/O Scheduler Configuration:");
        eprintln!("  sort_queue:         {:?}", self.sort_queue);
        eprintln!("  dynamic:            {}", self.dynamic);
        eprintln!("  read_bias:          {}", self.read_bias);
        eprintln!("  max_active:         {}", self.max_active);
        eprintln!("  block_size:         {}", self.block_size);
        eprintln!("  queue_capacity:     {}", self.queue_capacity);
        eprintln!("  trim_goal:          {}", self.trim_goal);
        eprintln!("  trim_ticks:         {}", self.trim_ticks);
        eprintln!("  trim_max_blocks:    {}", self.trim_max_blocks);
        eprintln!("  trim_max_ranges:    {}", self.trim_max_ranges);
        eprintln!("  latency_threshold:  {:?}", self.latency_threshold);
        eprintln!("  alpha_bits:         {}", self.alpha_bits);
        eprintln!("  read_limiter:       {} max={}", self.read_limiter.kind, self.read_limiter.max);
        eprintln!("  write_limiter:      {} max={}", self.write_limiter.kind, self.write_limiter.max);
        eprintln!("  trim_limiter:       {} max={}", self.trim_limiter.kind, self.trim_limiter.max);
    }
}

fn limiter_from_env(queue: &str, default_kind: LimiterKind) -> LimiterConfig {
    LimiterConfig {
        kind: env_get(&format!("IOS_{}_LIMITER", queue), default_kind),
        max: env_get(&format!("IOS_{}_LIMIT", queue), defaults::LIMIT_MAX),
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for IoSchedError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => IoSchedError::InvalidConfig(msg),
        }
    }
}
