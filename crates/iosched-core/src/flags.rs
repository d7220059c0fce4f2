//! Work-pending flag word
//!
//! Summary of which kinds of work a scheduler holds, queued or mid-dispatch.
//! Drivers query it from completion context to decide whether another
//! scheduling pass is worth it, without touching the queues.

use bitflags::bitflags;

use crate::bio::BioCmd;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WorkFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const TRIM  = 1 << 2;
        const FLUSH = 1 << 3;
    }
}

impl WorkFlags {
    /// Flag for the category a command belongs to.
    pub const fn for_cmd(cmd: BioCmd) -> WorkFlags {
        match cmd {
            BioCmd::Read => WorkFlags::READ,
            BioCmd::Write => WorkFlags::WRITE,
            BioCmd::Delete => WorkFlags::TRIM,
            BioCmd::Flush => WorkFlags::FLUSH,
        }
    }

    /// Non-trim I/O
    pub const IO: WorkFlags = WorkFlags::READ
        .union(WorkFlags::WRITE)
        .union(WorkFlags::FLUSH);
}
