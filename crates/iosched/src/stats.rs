//! Statistics accumulator
//!
//! Per-category counters (read, write, trim, flush) plus latency tracking:
//! an exponential moving average and variance with weight `2^-alpha_bits`,
//! and a histogram whose first bucket ends at 20 µs and doubles from there.

use std::time::Duration;

use iosched_core::constants::{LAT_BUCKETS, LAT_FIRST_BUCKET_US};
use iosched_core::{BioCmd, WorkFlags};

/// Counters for one category of work
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Currently queued
    pub queued: u64,
    /// Dispatched and not yet completed
    pub in_flight: u64,
    /// Ever queued
    pub total_in: u64,
    /// Ever completed (including failures and flushed bios)
    pub total_out: u64,
    /// Completed with an error
    pub errors: u64,
    /// Bytes completed
    pub bytes: u64,
    /// Latency moving average, nanoseconds
    pub ema_ns: u64,
    /// Latency moving variance, ns²
    pub emvar_ns2: u64,
    /// Latency histogram
    pub latencies: [u64; LAT_BUCKETS],
}

impl QueueStats {
    pub(crate) fn on_queue(&mut self) {
        self.queued += 1;
        self.total_in += 1;
    }

    /// Queued item went to the caller.
    pub(crate) fn on_dispatch(&mut self) {
        self.queued = self.queued.saturating_sub(1);
        self.in_flight += 1;
    }

    /// Dispatched item came back unfinished.
    pub(crate) fn on_requeue(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.queued += 1;
    }

    pub(crate) fn on_complete(
        &mut self,
        latency: Option<Duration>,
        failed: bool,
        bytes: u64,
        alpha_bits: u32,
    ) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.total_out += 1;
        if failed {
            self.errors += 1;
            return;
        }
        self.bytes = self.bytes.saturating_add(bytes);
        if let Some(lat) = latency {
            self.record_latency(lat, alpha_bits);
        }
    }

    /// Queued item failed without ever reaching hardware.
    pub(crate) fn on_flushed(&mut self) {
        self.queued = self.queued.saturating_sub(1);
        self.total_out += 1;
        self.errors += 1;
    }

    fn record_latency(&mut self, lat: Duration, alpha_bits: u32) {
        let sample = i128::try_from(lat.as_nanos()).unwrap_or(i128::MAX / 4);
        let ema = self.ema_ns as i128;
        let delta = sample - ema;
        let new_ema = ema + (delta >> alpha_bits);

        let var = self.emvar_ns2 as i128;
        let sq = delta.saturating_mul(delta);
        let new_var = var + ((sq - var) >> alpha_bits);

        self.ema_ns = u64::try_from(new_ema.max(0)).unwrap_or(u64::MAX);
        self.emvar_ns2 = u64::try_from(new_var.max(0)).unwrap_or(u64::MAX);
        self.latencies[latency_bucket(lat)] += 1;
    }

    #[inline]
    pub fn pending(&self) -> u64 {
        self.queued + self.in_flight
    }

    pub fn ema(&self) -> Duration {
        Duration::from_nanos(self.ema_ns)
    }
}

/// Histogram bucket for a latency sample.
pub fn latency_bucket(lat: Duration) -> usize {
    let us = u64::try_from(lat.as_micros()).unwrap_or(u64::MAX);
    let mut limit = LAT_FIRST_BUCKET_US;
    let mut bucket = 0;
    while us >= limit && bucket < LAT_BUCKETS - 1 {
        limit = limit.saturating_mul(2);
        bucket += 1;
    }
    bucket
}

/// Scheduler-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Non-trim bios handed to the caller
    pub dispatched: u64,
    /// Non-trim bios completed
    pub completed: u64,
    /// Queued bios failed by `flush`
    pub flushed: u64,
    /// Trim batches sent to hardware
    pub trim_batches: u64,
    /// Trim bios returned through `put_back_trim`
    pub trims_put_back: u64,
    /// Completions slower than the latency threshold
    pub slow_completions: u64,
}

/// Point-in-time copy of the scheduler's statistics
#[derive(Debug, Clone, Default)]
pub struct IoSchedStats {
    pub queues: [QueueStats; BioCmd::COUNT],
    pub counters: Counters,
    pub flags: WorkFlags,
    pub trim_active: bool,
    pub sort_queue: bool,
    pub ticks: u64,
}

impl IoSchedStats {
    #[inline]
    pub fn queue(&self, cmd: BioCmd) -> &QueueStats {
        &self.queues[cmd.as_index()]
    }

    pub fn queued(&self) -> u64 {
        self.queues.iter().map(|q| q.queued).sum()
    }

    pub fn in_flight(&self) -> u64 {
        self.queues.iter().map(|q| q.in_flight).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets() {
        assert_eq!(latency_bucket(Duration::from_micros(0)), 0);
        assert_eq!(latency_bucket(Duration::from_micros(19)), 0);
        assert_eq!(latency_bucket(Duration::from_micros(20)), 1);
        assert_eq!(latency_bucket(Duration::from_micros(39)), 1);
        assert_eq!(latency_bucket(Duration::from_micros(40)), 2);
        assert_eq!(latency_bucket(Duration::from_secs(3600)), LAT_BUCKETS - 1);
    }

    #[test]
    fn test_lifecycle_counts() {
        let mut s = QueueStats::default();
        s.on_queue();
        s.on_queue();
        assert_eq!(s.pending(), 2);
        s.on_dispatch();
        assert_eq!((s.queued, s.in_flight), (1, 1));
        s.on_complete(Some(Duration::from_micros(100)), false, 4096, 9);
        s.on_flushed();
        assert_eq!(s.pending(), 0);
        assert_eq!((s.total_in, s.total_out, s.errors, s.bytes), (2, 2, 1, 4096));
        assert_eq!(s.latencies.iter().sum::<u64>(), 1);
    }

    #[test]
    fn test_ema_converges() {
        let mut s = QueueStats::default();
        for _ in 0..200 {
            s.on_queue();
            s.on_dispatch();
            s.on_complete(Some(Duration::from_micros(500)), false, 512, 2);
        }
        let ema_us = s.ema().as_micros();
        assert!((490..=500).contains(&ema_us), "ema {}us", ema_us);
    }

    #[test]
    fn test_errors_skip_latency() {
        let mut s = QueueStats::default();
        s.on_queue();
        s.on_dispatch();
        s.on_complete(Some(Duration::from_millis(5)), true, 4096, 9);
        assert_eq!(s.errors, 1);
        assert_eq!(s.bytes, 0);
        assert_eq!(s.ema_ns, 0);
    }
}
