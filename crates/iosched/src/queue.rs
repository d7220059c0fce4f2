//! Request queue
//!
//! Holds pending non-trim bios as a sequence of segments. FIFO inserts append
//! to a trailing FIFO segment, sorted inserts land in a trailing sorted
//! segment keyed by `(lba, id)`. A segment is only ever appended to while it
//! is last, so switching the sort mode never reorders what is already queued,
//! and a barrier (flush or `ORDERED`) occupies a segment of its own that
//! nothing can pass in either direction.

use std::collections::{BTreeMap, VecDeque};

use iosched_core::{Bio, BioId, IoSchedResult};

enum Segment {
    Fifo(VecDeque<Bio>),
    Sorted(BTreeMap<(u64, BioId), Bio>),
    Barrier(Bio),
}

impl Segment {
    fn peek(&self) -> Option<&Bio> {
        match self {
            Segment::Fifo(q) => q.front(),
            Segment::Sorted(map) => map.first_key_value().map(|(_, bio)| bio),
            Segment::Barrier(bio) => Some(bio),
        }
    }
}

pub(crate) struct BioQueue {
    segments: VecDeque<Segment>,
    /// Preallocated storage for the next FIFO segment
    spare: VecDeque<Bio>,
    len: usize,
}

impl BioQueue {
    /// Empty queue with room for `capacity` FIFO entries reserved up front.
    pub(crate) fn try_with_capacity(capacity: usize) -> IoSchedResult<Self> {
        let mut segments = VecDeque::new();
        segments.try_reserve(4)?;
        let mut spare = VecDeque::new();
        spare.try_reserve(capacity)?;
        Ok(Self { segments, spare, len: 0 })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn insert(&mut self, bio: Bio, sorted: bool) {
        self.len += 1;
        if bio.is_barrier() {
            self.segments.push_back(Segment::Barrier(bio));
            return;
        }
        if sorted {
            if let Some(Segment::Sorted(map)) = self.segments.back_mut() {
                map.insert((bio.lba(), bio.id()), bio);
                return;
            }
            let mut map = BTreeMap::new();
            map.insert((bio.lba(), bio.id()), bio);
            self.segments.push_back(Segment::Sorted(map));
        } else {
            if let Some(Segment::Fifo(q)) = self.segments.back_mut() {
                q.push_back(bio);
                return;
            }
            let mut q = std::mem::take(&mut self.spare);
            q.push_back(bio);
            self.segments.push_back(Segment::Fifo(q));
        }
    }

    /// Next bio in dispatch order.
    pub(crate) fn peek(&self) -> Option<&Bio> {
        self.segments.iter().find_map(Segment::peek)
    }

    pub(crate) fn pop(&mut self) -> Option<Bio> {
        while let Some(front) = self.segments.front_mut() {
            let bio = match front {
                Segment::Fifo(q) => q.pop_front(),
                Segment::Sorted(map) => map.pop_first().map(|(_, bio)| bio),
                Segment::Barrier(_) => None,
            };
            if let Some(bio) = bio {
                if front.peek().is_none() {
                    self.retire_front();
                }
                self.len -= 1;
                return Some(bio);
            }
            match self.segments.pop_front() {
                Some(Segment::Barrier(bio)) => {
                    self.len -= 1;
                    return Some(bio);
                }
                Some(Segment::Fifo(q)) => self.recycle(q),
                _ => {}
            }
        }
        None
    }

    /// Move everything queued in `other` behind what is queued here,
    /// keeping `other`'s internal order.
    pub(crate) fn append(&mut self, other: &mut BioQueue) {
        self.len += other.len;
        other.len = 0;
        self.segments.append(&mut other.segments);
    }

    /// Remove everything, in dispatch order.
    pub(crate) fn drain_all(&mut self) -> Vec<Bio> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(bio) = self.pop() {
            out.push(bio);
        }
        out
    }

    fn retire_front(&mut self) {
        if let Some(Segment::Fifo(q)) = self.segments.pop_front() {
            self.recycle(q);
        }
    }

    fn recycle(&mut self, q: VecDeque<Bio>) {
        if q.capacity() > self.spare.capacity() {
            self.spare = q;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iosched_core::BioFlags;

    fn stamped(mut bio: Bio, seq: u64) -> Bio {
        bio.assign_id(BioId::new(seq));
        bio
    }

    fn lbas(q: &mut BioQueue) -> Vec<u64> {
        q.drain_all().iter().map(|b| b.lba()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut q = BioQueue::try_with_capacity(8).unwrap();
        for (i, lba) in [500, 100, 300].into_iter().enumerate() {
            q.insert(stamped(Bio::read(lba, 100), i as u64), false);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(lbas(&mut q), vec![500, 100, 300]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_sorted_order_with_ties() {
        let mut q = BioQueue::try_with_capacity(8).unwrap();
        q.insert(stamped(Bio::read(500, 100), 0), true);
        q.insert(stamped(Bio::write(100, 8), 1), true);
        q.insert(stamped(Bio::read(100, 4), 2), true);
        q.insert(stamped(Bio::read(300, 100), 3), true);
        let out = q.drain_all();
        let ids: Vec<_> = out.iter().map(|b| b.id().as_u64()).collect();
        assert_eq!(ids, vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_mode_switch_is_not_retroactive() {
        let mut q = BioQueue::try_with_capacity(8).unwrap();
        q.insert(stamped(Bio::read(900, 1), 0), false);
        q.insert(stamped(Bio::read(800, 1), 1), false);
        q.insert(stamped(Bio::read(50, 1), 2), true);
        q.insert(stamped(Bio::read(10, 1), 3), true);
        q.insert(stamped(Bio::read(700, 1), 4), false);
        assert_eq!(lbas(&mut q), vec![900, 800, 10, 50, 700]);
    }

    #[test]
    fn test_barrier_splits_sorted_runs() {
        let mut q = BioQueue::try_with_capacity(8).unwrap();
        q.insert(stamped(Bio::write(400, 1), 0), true);
        q.insert(stamped(Bio::flush(), 1), true);
        q.insert(stamped(Bio::write(100, 1), 2), true);
        q.insert(stamped(Bio::write(300, 1).with_flags(BioFlags::ORDERED), 3), true);
        q.insert(stamped(Bio::write(200, 1), 4), true);
        let ids: Vec<_> = q.drain_all().iter().map(|b| b.id().as_u64()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_peek_matches_pop() {
        let mut q = BioQueue::try_with_capacity(2).unwrap();
        assert!(q.peek().is_none());
        assert!(q.pop().is_none());
        q.insert(stamped(Bio::read(7, 1), 0), true);
        q.insert(stamped(Bio::read(3, 1), 1), true);
        assert_eq!(q.peek().map(|b| b.lba()), Some(3));
        assert_eq!(q.pop().map(|b| b.lba()), Some(3));
        assert_eq!(q.peek().map(|b| b.lba()), Some(7));
    }

    #[test]
    fn test_append_keeps_order() {
        let mut a = BioQueue::try_with_capacity(2).unwrap();
        let mut b = BioQueue::try_with_capacity(2).unwrap();
        a.insert(stamped(Bio::read(1, 1), 0), false);
        b.insert(stamped(Bio::write(9, 1), 1), true);
        b.insert(stamped(Bio::write(5, 1), 2), true);
        a.append(&mut b);
        assert!(b.is_empty());
        assert_eq!(a.len(), 3);
        assert_eq!(lbas(&mut a), vec![1, 5, 9]);
    }

    #[test]
    fn test_capacity_overflow_is_reported() {
        assert!(BioQueue::try_with_capacity(usize::MAX).is_err());
    }
}
