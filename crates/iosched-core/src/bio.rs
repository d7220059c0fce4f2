//! Block I/O request type
//!
//! A `Bio` describes one pending request: a command, a block range and an
//! optional completion callback. The scheduler takes ownership on
//! `queue_work` and hands it back on dispatch.

use core::fmt;

use bitflags::bitflags;

use crate::id::BioId;

/// Completion callback run exactly once by [`Bio::done`].
pub type BioDone = Box<dyn FnOnce(&Bio) + Send + 'static>;

/// Block I/O command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BioCmd {
    Read = 0,
    Write = 1,
    /// Trim / unmap
    Delete = 2,
    /// Cache flush. Always a barrier.
    Flush = 3,
}

impl BioCmd {
    /// Number of commands
    pub const COUNT: usize = 4;

    #[inline]
    pub const fn as_index(&self) -> usize {
        *self as usize
    }

    #[inline]
    pub const fn is_trim(&self) -> bool {
        matches!(self, BioCmd::Delete)
    }

    /// All commands in index order
    pub fn iter() -> impl Iterator<Item = BioCmd> {
        [BioCmd::Read, BioCmd::Write, BioCmd::Delete, BioCmd::Flush].into_iter()
    }

    pub const fn name(&self) -> &'static str {
        match self {
            BioCmd::Read => "read",
            BioCmd::Write => "write",
            BioCmd::Delete => "trim",
            BioCmd::Flush => "flush",
        }
    }
}

impl fmt::Display for BioCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Per-request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BioFlags: u32 {
        /// Nothing queued after this bio may be dispatched before it,
        /// and it may not be dispatched before anything queued earlier.
        const ORDERED = 1 << 0;
    }
}

/// A single block I/O request.
pub struct Bio {
    id: BioId,
    cmd: BioCmd,
    lba: u64,
    blocks: u64,
    flags: BioFlags,
    error: Option<i32>,
    done: Option<BioDone>,
}

impl Bio {
    /// Create a request covering `[lba, lba + blocks)`.
    pub fn new(cmd: BioCmd, lba: u64, blocks: u64) -> Self {
        Self {
            id: BioId::NONE,
            cmd,
            lba,
            blocks,
            flags: BioFlags::empty(),
            error: None,
            done: None,
        }
    }

    pub fn read(lba: u64, blocks: u64) -> Self {
        Self::new(BioCmd::Read, lba, blocks)
    }

    pub fn write(lba: u64, blocks: u64) -> Self {
        Self::new(BioCmd::Write, lba, blocks)
    }

    /// Trim request
    pub fn delete(lba: u64, blocks: u64) -> Self {
        Self::new(BioCmd::Delete, lba, blocks)
    }

    pub fn flush() -> Self {
        Self::new(BioCmd::Flush, 0, 0)
    }

    pub fn with_flags(mut self, flags: BioFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Attach a completion callback.
    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Bio) + Send + 'static,
    {
        self.done = Some(Box::new(f));
        self
    }

    #[inline]
    pub fn id(&self) -> BioId {
        self.id
    }

    #[inline]
    pub fn cmd(&self) -> BioCmd {
        self.cmd
    }

    #[inline]
    pub fn lba(&self) -> u64 {
        self.lba
    }

    #[inline]
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// First block past the end of the range
    #[inline]
    pub fn end(&self) -> u64 {
        self.lba.saturating_add(self.blocks)
    }

    #[inline]
    pub fn flags(&self) -> BioFlags {
        self.flags
    }

    /// True for flushes and `ORDERED` bios
    #[inline]
    pub fn is_barrier(&self) -> bool {
        self.cmd == BioCmd::Flush || self.flags.contains(BioFlags::ORDERED)
    }

    #[inline]
    pub fn error(&self) -> Option<i32> {
        self.error
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Record an errno for this request.
    pub fn set_error(&mut self, errno: i32) {
        self.error = Some(errno);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Transfer size in bytes for a given logical block size.
    #[inline]
    pub fn bytes(&self, block_size: u64) -> u64 {
        self.blocks.saturating_mul(block_size)
    }

    /// Stamp the queue id. Called by the scheduler on `queue_work`.
    #[doc(hidden)]
    pub fn assign_id(&mut self, id: BioId) {
        self.id = id;
    }

    /// Run the completion callback, if any. Consumes the bio.
    pub fn done(mut self) {
        if let Some(cb) = self.done.take() {
            cb(&self);
        }
    }

    /// Record `error` (if any) and complete the bio.
    pub fn finish(mut self, error: Option<i32>) {
        if let Some(errno) = error {
            self.error = Some(errno);
        }
        self.done();
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("id", &self.id)
            .field("cmd", &self.cmd)
            .field("lba", &self.lba)
            .field("blocks", &self.blocks)
            .field("flags", &self.flags)
            .field("error", &self.error)
            .field("has_done", &self.done.is_some())
            .finish()
    }
}
