//! Counting devstat sink
//!
//! `DevStatCounters` is a lock-free `DevStat` that keeps per-command
//! transaction counts. Drivers without a devstat of their own can hand it
//! to `init_with_devstat`; the simulator and tests read it back.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use iosched_core::{Bio, BioCmd, DevStat};

#[derive(Debug, Default)]
struct CmdCounters {
    started: AtomicU64,
    ended: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Debug)]
pub struct DevStatCounters {
    block_size: u64,
    busy: AtomicI64,
    cmds: [CmdCounters; BioCmd::COUNT],
}

impl DevStatCounters {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            busy: AtomicI64::new(0),
            cmds: Default::default(),
        }
    }

    /// Transactions started and not yet ended
    pub fn busy(&self) -> i64 {
        self.busy.load(Ordering::Acquire)
    }

    pub fn started(&self, cmd: BioCmd) -> u64 {
        self.cmds[cmd.as_index()].started.load(Ordering::Relaxed)
    }

    pub fn ended(&self, cmd: BioCmd) -> u64 {
        self.cmds[cmd.as_index()].ended.load(Ordering::Relaxed)
    }

    pub fn errors(&self, cmd: BioCmd) -> u64 {
        self.cmds[cmd.as_index()].errors.load(Ordering::Relaxed)
    }

    /// Bytes of successfully ended transactions
    pub fn bytes(&self, cmd: BioCmd) -> u64 {
        self.cmds[cmd.as_index()].bytes.load(Ordering::Relaxed)
    }
}

impl DevStat for DevStatCounters {
    fn start_transaction(&self, bio: &Bio) {
        self.cmds[bio.cmd().as_index()]
            .started
            .fetch_add(1, Ordering::Relaxed);
        self.busy.fetch_add(1, Ordering::AcqRel);
    }

    fn end_transaction(&self, bio: &Bio) {
        let c = &self.cmds[bio.cmd().as_index()];
        c.ended.fetch_add(1, Ordering::Relaxed);
        if bio.is_error() {
            c.errors.fetch_add(1, Ordering::Relaxed);
        } else {
            c.bytes.fetch_add(bio.bytes(self.block_size), Ordering::Relaxed);
        }
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }
}
