//! Bio identifier type

use core::fmt;

/// Identifier assigned to a bio when it is queued.
///
/// Ids come from a per-scheduler counter that only grows, so comparing two
/// ids tells which bio was queued first. `BioId::NONE` marks a bio that has
/// not been queued yet.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BioId(u64);

impl BioId {
    /// Sentinel for "not yet queued"
    pub const NONE: BioId = BioId(u64::MAX);

    #[inline]
    pub const fn new(seq: u64) -> Self {
        BioId(seq)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Debug for BioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "BioId(NONE)")
        } else {
            write!(f, "BioId({})", self.0)
        }
    }
}

impl fmt::Display for BioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "-")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

impl Default for BioId {
    fn default() -> Self {
        BioId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bio_id_ordering() {
        assert!(BioId::new(1) < BioId::new(2));
        assert!(BioId::new(7).is_some());
        assert!(BioId::NONE.is_none());
        assert_eq!(BioId::default(), BioId::NONE);
    }

    #[test]
    fn test_bio_id_display() {
        assert_eq!(format!("{}", BioId::new(12)), "#12");
        assert_eq!(format!("{}", BioId::NONE), "-");
        assert_eq!(format!("{:?}", BioId::new(3)), "BioId(3)");
    }
}
