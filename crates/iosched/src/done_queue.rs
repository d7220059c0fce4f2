//! Deferred completion queue
//!
//! Completion context (an interrupt handler, a transport callback thread)
//! posts finished `(Bio, Ccb)` pairs here without touching the scheduler
//! lock. The dispatch context drains them with `IoScheduler::drain_done`.
//!
//! Bounded and lock-free: a full queue hands the pair back to the poster.

use crossbeam_queue::ArrayQueue;

use iosched_core::{Bio, Ccb};

pub struct DoneQueue {
    queue: ArrayQueue<(Bio, Ccb)>,
}

impl DoneQueue {
    /// Queue with `depth` slots (at least one).
    pub fn new(depth: usize) -> Self {
        Self {
            queue: ArrayQueue::new(depth.max(1)),
        }
    }

    /// Post a completion. Never blocks.
    pub fn post(&self, bio: Bio, ccb: Ccb) -> Result<(), (Bio, Ccb)> {
        self.queue.push((bio, ccb))
    }

    pub(crate) fn pop(&self) -> Option<(Bio, Ccb)> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl Default for DoneQueue {
    fn default() -> Self {
        Self::new(crate::config::defaults::DONE_QUEUE_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_hands_back() {
        let dq = DoneQueue::new(1);
        assert!(dq.post(Bio::read(0, 1), Ccb::issue()).is_ok());
        let (bio, _ccb) = dq.post(Bio::read(1, 1), Ccb::issue()).unwrap_err();
        assert_eq!(bio.lba(), 1);
        assert_eq!(dq.len(), 1);
        assert_eq!(dq.pop().map(|(b, _)| b.lba()), Some(0));
        assert!(dq.is_empty());
    }

    #[test]
    fn test_zero_depth_rounds_up() {
        assert_eq!(DoneQueue::new(0).capacity(), 1);
    }
}
