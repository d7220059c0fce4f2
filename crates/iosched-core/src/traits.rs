//! Collaborator traits
//!
//! The scheduler never reaches for global state. The peripheral it serves
//! and the statistics sink it feeds are handed to it at construction.

use crate::bio::Bio;

/// The driver instance for one logical storage device.
pub trait Periph: Send + Sync {
    /// Driver name, e.g. `"da"`
    fn name(&self) -> &str;

    /// Unit number, e.g. `0` for `da0`
    fn unit(&self) -> u32;

    /// Spinning media benefit from elevator ordering; solid state does not.
    /// Used when the sort mode is left on auto.
    fn is_rotational(&self) -> bool {
        true
    }

    /// Ask the transport for a dispatch callback.
    ///
    /// Must not block. The scheduler calls this without holding its own
    /// lock, so the implementation may call back into the scheduler.
    fn schedule(&self);
}

/// Per-device transaction statistics.
///
/// Shared with other writers. Implementations provide their own atomicity.
pub trait DevStat: Send + Sync {
    /// A request entered the device queue.
    fn start_transaction(&self, bio: &Bio);

    /// A request left the device, successfully or not (`bio.error()`).
    fn end_transaction(&self, bio: &Bio);
}
