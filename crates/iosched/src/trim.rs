//! Trim coalescer
//!
//! Queued trims are kept ordered by `(lba, id)`. A batch starts at the lowest
//! queued LBA and absorbs each following trim that begins at or before the
//! batch end, i.e. contiguous or overlapping ranges. Gaps are never bridged:
//! trimming blocks nobody asked to trim would discard live data.
//!
//! A batch owns its member bios. It leaves the scheduler through
//! `IoScheduler::finish_trim` (members go back to the caller) or
//! `IoScheduler::put_back_trim` (members are re-queued under their original
//! keys, so the next pull rebuilds the same batch).

use std::collections::BTreeMap;
use std::time::Instant;

use iosched_core::{kerror, Bio, BioId};

/// Queue of pending trims
pub(crate) struct TrimQueue {
    map: BTreeMap<(u64, BioId), Bio>,
}

impl TrimQueue {
    pub(crate) fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn insert(&mut self, bio: Bio) {
        self.map.insert((bio.lba(), bio.id()), bio);
    }

    /// Blocks covered by the next batch head, for limiter checks.
    pub(crate) fn head_blocks(&self) -> Option<u64> {
        self.map.first_key_value().map(|(_, bio)| bio.blocks())
    }

    /// Pull the next coalesced batch.
    ///
    /// The extent never exceeds `max_blocks` unless a single trim is larger
    /// on its own, and never holds more than `max_ranges` bios.
    pub(crate) fn take_batch(&mut self, max_blocks: u64, max_ranges: usize) -> Option<TrimBatch> {
        let (_, first) = self.map.pop_first()?;
        let start = first.lba();
        let mut end = first.end();
        let mut members = vec![first];

        while members.len() < max_ranges.max(1) {
            let Some((&(lba, _), next)) = self.map.first_key_value() else {
                break;
            };
            if lba > end {
                break;
            }
            let new_end = end.max(next.end());
            if new_end - start > max_blocks {
                break;
            }
            match self.map.pop_first() {
                Some((_, bio)) => members.push(bio),
                None => break,
            }
            end = new_end;
        }

        Some(TrimBatch::from_members(members, start, end))
    }

    pub(crate) fn put_back(&mut self, members: Vec<Bio>) {
        for bio in members {
            self.insert(bio);
        }
    }

    pub(crate) fn drain_all(&mut self) -> Vec<Bio> {
        std::mem::take(&mut self.map).into_values().collect()
    }
}

/// A coalesced run of trims covering `[start, end)`.
///
/// Must be handed back through `finish_trim` or `put_back_trim`. Dropping a
/// batch that still holds bios loses them and is reported as misuse.
#[must_use = "a trim batch must be finished or put back"]
pub struct TrimBatch {
    members: Vec<Bio>,
    start: u64,
    end: u64,
    submitted_at: Option<Instant>,
}

impl TrimBatch {
    fn from_members(members: Vec<Bio>, start: u64, end: u64) -> Self {
        Self { members, start, end, submitted_at: None }
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Length of the extent in blocks
    #[inline]
    pub fn blocks(&self) -> u64 {
        self.end - self.start
    }

    /// Number of member bios
    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Bio] {
        &self.members
    }

    /// Member ranges as `(lba, end)`, ascending.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.members.iter().map(|b| (b.lba(), b.end())).collect()
    }

    #[inline]
    pub fn is_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }

    /// Split for partial completion.
    ///
    /// Members that end at or before `at` stay in `self`; the rest (including
    /// any member straddling `at`) move to the returned batch. Returns `None`
    /// when nothing needs to move. The tail inherits the submission state.
    pub fn split_off(&mut self, at: u64) -> Option<TrimBatch> {
        let (head, tail): (Vec<Bio>, Vec<Bio>) = std::mem::take(&mut self.members)
            .into_iter()
            .partition(|b| b.end() <= at);
        self.members = head;
        if tail.is_empty() {
            return None;
        }
        let (start, end) = extent(&tail, at);
        let rest = TrimBatch {
            members: tail,
            start,
            end,
            submitted_at: self.submitted_at,
        };
        let (start, end) = extent(&self.members, at);
        self.start = start;
        self.end = end;
        Some(rest)
    }

    pub(crate) fn mark_submitted(&mut self, at: Instant) -> bool {
        if self.submitted_at.is_some() {
            return false;
        }
        self.submitted_at = Some(at);
        true
    }

    pub(crate) fn submitted_at(&self) -> Option<Instant> {
        self.submitted_at
    }

    pub(crate) fn into_members(mut self) -> Vec<Bio> {
        std::mem::take(&mut self.members)
    }
}

fn extent(members: &[Bio], empty_at: u64) -> (u64, u64) {
    let start = members.iter().map(Bio::lba).min().unwrap_or(empty_at);
    let end = members.iter().map(Bio::end).max().unwrap_or(empty_at);
    (start, end)
}

impl std::fmt::Debug for TrimBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrimBatch")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("members", &self.members.len())
            .field("submitted", &self.is_submitted())
            .finish()
    }
}

impl Drop for TrimBatch {
    fn drop(&mut self) {
        if self.members.is_empty() || std::thread::panicking() {
            return;
        }
        kerror!(
            "trim batch [{}, {}) dropped with {} bios unaccounted",
            self.start,
            self.end,
            self.members.len()
        );
        debug_assert!(false, "trim batch dropped without finish_trim or put_back_trim");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_of(ranges: &[(u64, u64)]) -> TrimQueue {
        let mut q = TrimQueue::new();
        for (i, &(lba, blocks)) in ranges.iter().enumerate() {
            let mut bio = Bio::delete(lba, blocks);
            bio.assign_id(BioId::new(i as u64));
            q.insert(bio);
        }
        q
    }

    fn settle(q: &mut TrimQueue, batch: TrimBatch) {
        q.put_back(batch.into_members());
    }

    #[test]
    fn test_adjacent_trims_coalesce() {
        let mut q = queue_of(&[(100, 100), (0, 100)]);
        let batch = q.take_batch(u64::MAX, 64).unwrap();
        assert_eq!((batch.start(), batch.end()), (0, 200));
        assert_eq!(batch.ranges(), vec![(0, 100), (100, 200)]);
        assert!(q.is_empty());
        settle(&mut q, batch);
    }

    #[test]
    fn test_gap_is_not_bridged() {
        let mut q = queue_of(&[(0, 100), (101, 50)]);
        let first = q.take_batch(u64::MAX, 64).unwrap();
        assert_eq!((first.start(), first.end()), (0, 100));
        let second = q.take_batch(u64::MAX, 64).unwrap();
        assert_eq!((second.start(), second.end()), (101, 151));
        settle(&mut q, first);
        settle(&mut q, second);
    }

    #[test]
    fn test_overlap_merges() {
        let mut q = queue_of(&[(0, 100), (50, 100), (150, 10)]);
        let batch = q.take_batch(u64::MAX, 64).unwrap();
        assert_eq!((batch.start(), batch.end(), batch.len()), (0, 160, 3));
        settle(&mut q, batch);
    }

    #[test]
    fn test_limits() {
        let mut q = queue_of(&[(0, 10), (10, 10), (20, 10), (30, 10)]);
        let batch = q.take_batch(25, 64).unwrap();
        assert_eq!(batch.ranges(), vec![(0, 10), (10, 20)]);
        settle(&mut q, batch);

        let batch = q.take_batch(u64::MAX, 3).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(q.len(), 1);
        settle(&mut q, batch);

        // A single oversized trim still goes out alone.
        let mut q = queue_of(&[(0, 1000), (1000, 1)]);
        let batch = q.take_batch(10, 64).unwrap();
        assert_eq!(batch.ranges(), vec![(0, 1000)]);
        settle(&mut q, batch);
    }

    #[test]
    fn test_put_back_rebuilds_same_batch() {
        let mut q = queue_of(&[(0, 100), (100, 100), (500, 10)]);
        let batch = q.take_batch(u64::MAX, 64).unwrap();
        let before = batch.ranges();
        settle(&mut q, batch);
        assert_eq!(q.len(), 3);
        let again = q.take_batch(u64::MAX, 64).unwrap();
        assert_eq!(again.ranges(), before);
        settle(&mut q, again);
    }

    #[test]
    fn test_split_off() {
        let mut q = queue_of(&[(0, 100), (100, 100), (200, 100)]);
        let mut batch = q.take_batch(u64::MAX, 64).unwrap();
        batch.mark_submitted(Instant::now());

        let rest = batch.split_off(150).unwrap();
        assert_eq!(batch.ranges(), vec![(0, 100)]);
        assert_eq!((batch.start(), batch.end()), (0, 100));
        assert_eq!(rest.ranges(), vec![(100, 200), (200, 300)]);
        assert_eq!((rest.start(), rest.end()), (100, 300));
        assert!(rest.is_submitted());

        let mut rest = rest;
        assert!(rest.split_off(300).is_none());
        settle(&mut q, batch);
        settle(&mut q, rest);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_drain_all() {
        let mut q = queue_of(&[(30, 1), (10, 1), (20, 1)]);
        let lbas: Vec<_> = q.drain_all().iter().map(|b| b.lba()).collect();
        assert_eq!(lbas, vec![10, 20, 30]);
        assert!(q.is_empty());
        assert!(q.head_blocks().is_none());
    }
}
