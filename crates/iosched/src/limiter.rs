//! Per-queue dispatch limiters
//!
//! A limiter decides whether the head of a queue may go to hardware now.
//! Budgeted limiters (IOPS, bandwidth) are refilled by `IoScheduler::tick`,
//! which the caller drives; the scheduler keeps no timers.

use std::fmt;
use std::str::FromStr;

/// Limiter strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LimiterKind {
    /// Never refuses
    None = 0,
    /// At most `max` commands in flight
    QueueDepth = 1,
    /// At most `max` dispatches per tick
    Iops = 2,
    /// At most `max` bytes dispatched per tick. The last command of a tick
    /// may overdraw the budget.
    Bandwidth = 3,
}

impl LimiterKind {
    pub fn from_index(v: i64) -> Option<Self> {
        match v {
            0 => Some(LimiterKind::None),
            1 => Some(LimiterKind::QueueDepth),
            2 => Some(LimiterKind::Iops),
            3 => Some(LimiterKind::Bandwidth),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LimiterKind::None => "none",
            LimiterKind::QueueDepth => "queue_depth",
            LimiterKind::Iops => "iops",
            LimiterKind::Bandwidth => "bandwidth",
        }
    }
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LimiterKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(LimiterKind::None),
            "queue_depth" | "qd" | "1" => Ok(LimiterKind::QueueDepth),
            "iops" | "2" => Ok(LimiterKind::Iops),
            "bandwidth" | "bw" | "3" => Ok(LimiterKind::Bandwidth),
            _ => Err(()),
        }
    }
}

/// Limiter state for one queue
#[derive(Debug, Clone)]
pub(crate) struct Limiter {
    kind: LimiterKind,
    max: u64,
    /// Remaining budget this tick (IOPS: commands, bandwidth: bytes)
    budget: i64,
}

impl Limiter {
    pub(crate) fn new(kind: LimiterKind, max: u64) -> Self {
        let mut l = Self { kind, max, budget: 0 };
        l.refill();
        l
    }

    pub(crate) fn kind(&self) -> LimiterKind {
        self.kind
    }

    pub(crate) fn max(&self) -> u64 {
        self.max
    }

    /// Change strategy; budget starts full.
    pub(crate) fn set_kind(&mut self, kind: LimiterKind) {
        self.kind = kind;
        self.refill();
    }

    pub(crate) fn set_max(&mut self, max: u64) {
        self.max = max;
        self.refill();
    }

    fn refill(&mut self) {
        self.budget = i64::try_from(self.max).unwrap_or(i64::MAX);
    }

    /// May a command of `bytes` go out with `in_flight` already outstanding?
    pub(crate) fn can_dispatch(&self, in_flight: u64, _bytes: u64) -> bool {
        match self.kind {
            LimiterKind::None => true,
            LimiterKind::QueueDepth => in_flight < self.max,
            LimiterKind::Iops | LimiterKind::Bandwidth => self.budget > 0,
        }
    }

    pub(crate) fn on_dispatch(&mut self, bytes: u64) {
        match self.kind {
            LimiterKind::None | LimiterKind::QueueDepth => {}
            LimiterKind::Iops => self.budget -= 1,
            LimiterKind::Bandwidth => {
                self.budget = self
                    .budget
                    .saturating_sub(i64::try_from(bytes).unwrap_or(i64::MAX));
            }
        }
    }

    /// Give back the charge of a command that never reached the device.
    /// The budget never grows past one quantum.
    pub(crate) fn refund(&mut self, bytes: u64) {
        let cap = i64::try_from(self.max).unwrap_or(i64::MAX);
        match self.kind {
            LimiterKind::None | LimiterKind::QueueDepth => {}
            LimiterKind::Iops => self.budget = (self.budget + 1).min(cap),
            LimiterKind::Bandwidth => {
                self.budget = self
                    .budget
                    .saturating_add(i64::try_from(bytes).unwrap_or(i64::MAX))
                    .min(cap);
            }
        }
    }

    /// A command finished. Returns true when this completion reopened a
    /// queue the limiter had closed.
    pub(crate) fn on_complete(&mut self, in_flight_before: u64) -> bool {
        match self.kind {
            LimiterKind::QueueDepth => in_flight_before >= self.max,
            _ => false,
        }
    }

    /// Start of a new quantum. Returns true if the budget was exhausted.
    pub(crate) fn tick(&mut self) -> bool {
        match self.kind {
            LimiterKind::Iops | LimiterKind::Bandwidth => {
                let was_blocked = self.budget <= 0;
                self.refill();
                was_blocked
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!("iops".parse::<LimiterKind>(), Ok(LimiterKind::Iops));
        assert_eq!("QD".parse::<LimiterKind>(), Ok(LimiterKind::QueueDepth));
        assert_eq!("3".parse::<LimiterKind>(), Ok(LimiterKind::Bandwidth));
        assert!("fast".parse::<LimiterKind>().is_err());
        assert_eq!(LimiterKind::from_index(9), None);
    }

    #[test]
    fn test_queue_depth() {
        let mut l = Limiter::new(LimiterKind::QueueDepth, 2);
        assert!(l.can_dispatch(0, 4096));
        assert!(l.can_dispatch(1, 4096));
        assert!(!l.can_dispatch(2, 4096));
        assert!(l.on_complete(2));
        assert!(!l.on_complete(1));
    }

    #[test]
    fn test_iops_budget_refills_on_tick() {
        let mut l = Limiter::new(LimiterKind::Iops, 2);
        l.on_dispatch(512);
        assert!(l.can_dispatch(1, 512));
        l.on_dispatch(512);
        assert!(!l.can_dispatch(2, 512));
        assert!(l.tick());
        assert!(l.can_dispatch(2, 512));
    }

    #[test]
    fn test_bandwidth_allows_overdraft() {
        let mut l = Limiter::new(LimiterKind::Bandwidth, 1000);
        assert!(l.can_dispatch(0, 4096));
        l.on_dispatch(4096);
        assert!(!l.can_dispatch(1, 1));
        l.tick();
        assert!(l.can_dispatch(1, 1));
    }

    #[test]
    fn test_refund_restores_budget() {
        let mut l = Limiter::new(LimiterKind::Iops, 1);
        l.on_dispatch(512);
        assert!(!l.can_dispatch(1, 512));
        l.refund(512);
        assert!(l.can_dispatch(0, 512));
        l.refund(512);
        l.on_dispatch(512);
        assert!(!l.can_dispatch(1, 512));

        let mut l = Limiter::new(LimiterKind::Bandwidth, 1000);
        l.on_dispatch(4096);
        l.refund(4096);
        l.on_dispatch(1000);
        assert!(!l.can_dispatch(1, 1));
    }

    #[test]
    fn test_none_never_refuses() {
        let mut l = Limiter::new(LimiterKind::None, 0);
        l.on_dispatch(u64::MAX);
        assert!(l.can_dispatch(u64::MAX, u64::MAX));
        assert!(!l.tick());
    }
}
