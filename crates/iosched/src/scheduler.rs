//! Scheduler core
//!
//! One `IoScheduler` serves one peripheral. All mutable state sits behind a
//! single internal mutex; every method takes `&self`. Collaborator callbacks
//! (`Periph::schedule`, bio completion callbacks, the latency callback) run
//! after the lock is dropped, so they may call back into the scheduler.
//!
//! Lifecycle of a bio:
//!
//! ```text
//! queue_work ──► QUEUED ──next_bio──► DISPATCHED ──bio_complete──► COMPLETED
//!                  ▲                       │
//!                  └──── put_back_trim ────┘   (trims only)
//! ```
//!
//! Non-trim bios live in the request queue (and, with dynamic scheduling, a
//! separate write queue). Trims live in the trim queue and leave it as
//! coalesced `TrimBatch`es.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use iosched_core::{kdebug, kerror, kinfo, ktrace, kwarn};
use iosched_core::{
    Bio, BioCmd, BioId, Ccb, DevStat, IoSchedError, IoSchedResult, Periph, WorkFlags,
};

use crate::config::IoSchedConfig;
use crate::done_queue::DoneQueue;
use crate::limiter::Limiter;
use crate::queue::BioQueue;
use crate::stats::{Counters, IoSchedStats, QueueStats};
use crate::trim::{TrimBatch, TrimQueue};

/// Called for completions slower than the configured latency threshold.
pub type LatencyCallback = Arc<dyn Fn(&Bio, Duration) + Send + Sync>;

/// Limiter slots
pub(crate) const LIM_READ: usize = 0;
pub(crate) const LIM_WRITE: usize = 1;
pub(crate) const LIM_TRIM: usize = 2;

#[inline]
pub(crate) fn limiter_slot(cmd: BioCmd) -> Option<usize> {
    match cmd {
        BioCmd::Read => Some(LIM_READ),
        BioCmd::Write => Some(LIM_WRITE),
        BioCmd::Delete => Some(LIM_TRIM),
        BioCmd::Flush => None,
    }
}

/// Outcome of `bio_complete`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStatus {
    /// Errno the bio finished with
    pub error: Option<i32>,
    /// More work was dispatchable and the periph was poked
    pub reschedule: bool,
}

impl CompletionStatus {
    #[inline]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Runtime-adjustable parameters
#[derive(Debug, Clone)]
pub(crate) struct Tunables {
    pub(crate) sort_queue: bool,
    pub(crate) dynamic: bool,
    pub(crate) read_bias: u32,
    pub(crate) max_active: usize,
    pub(crate) block_size: u64,
    pub(crate) trim_goal: u32,
    pub(crate) trim_ticks: u32,
    pub(crate) trim_max_blocks: u64,
    pub(crate) trim_max_ranges: usize,
    pub(crate) latency_threshold: Duration,
    pub(crate) alpha_bits: u32,
}

#[derive(Debug, Clone, Copy)]
struct Inflight {
    cmd: BioCmd,
    bytes: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Source {
    Main,
    Writes,
}

pub(crate) struct SchedState {
    pub(crate) tun: Tunables,
    bio_queue: BioQueue,
    write_queue: BioQueue,
    /// Barriers sitting in `bio_queue`; writes bypass the write queue while
    /// any is pending so they cannot overtake it.
    barriers_queued: usize,
    /// Writes sitting in `bio_queue`; new writes follow them there until
    /// they have all gone out.
    main_writes: usize,
    trim_queue: TrimQueue,
    inflight: HashMap<BioId, Inflight>,
    /// Trim bios taken into batches and not yet finished or put back
    trims_outstanding: usize,
    pub(crate) trim_active: bool,
    /// Bytes charged to the trim limiter by the active submission until
    /// any of it finishes
    trim_charge: Option<u64>,
    read_bias_left: u32,
    pub(crate) limiters: [Limiter; 3],
    pub(crate) stats: [QueueStats; BioCmd::COUNT],
    counters: Counters,
    next_seq: u64,
    ticks: u64,
    last_trim_tick: u64,
    latency_cb: Option<LatencyCallback>,
}

impl SchedState {
    fn new(config: &IoSchedConfig, sort_queue: bool) -> IoSchedResult<Self> {
        let bio_queue = BioQueue::try_with_capacity(config.queue_capacity)?;
        let write_queue = if config.dynamic {
            BioQueue::try_with_capacity(config.queue_capacity)?
        } else {
            BioQueue::try_with_capacity(0)?
        };
        let mut inflight = HashMap::new();
        inflight.try_reserve(config.max_active)?;

        Ok(Self {
            tun: Tunables {
                sort_queue,
                dynamic: config.dynamic,
                read_bias: config.read_bias,
                max_active: config.max_active,
                block_size: config.block_size,
                trim_goal: config.trim_goal,
                trim_ticks: config.trim_ticks,
                trim_max_blocks: config.trim_max_blocks,
                trim_max_ranges: config.trim_max_ranges,
                latency_threshold: config.latency_threshold,
                alpha_bits: config.alpha_bits,
            },
            bio_queue,
            write_queue,
            barriers_queued: 0,
            main_writes: 0,
            trim_queue: TrimQueue::new(),
            inflight,
            trims_outstanding: 0,
            trim_active: false,
            trim_charge: None,
            read_bias_left: config.read_bias,
            limiters: [
                Limiter::new(config.read_limiter.kind, config.read_limiter.max),
                Limiter::new(config.write_limiter.kind, config.write_limiter.max),
                Limiter::new(config.trim_limiter.kind, config.trim_limiter.max),
            ],
            stats: Default::default(),
            counters: Counters::default(),
            next_seq: 0,
            ticks: 0,
            last_trim_tick: 0,
            latency_cb: None,
        })
    }

    fn enqueue(&mut self, mut bio: Bio) -> BioId {
        let id = BioId::new(self.next_seq);
        self.next_seq += 1;
        bio.assign_id(id);
        self.stats[bio.cmd().as_index()].on_queue();

        if bio.cmd().is_trim() {
            if self.trim_queue.is_empty() {
                self.last_trim_tick = self.ticks;
            }
            self.trim_queue.insert(bio);
            return id;
        }

        let is_write = bio.cmd() == BioCmd::Write;
        if bio.is_barrier() {
            if self.tun.dynamic {
                self.main_writes += self.write_queue.len();
                self.bio_queue.append(&mut self.write_queue);
            }
            self.barriers_queued += 1;
        } else if self.tun.dynamic
            && is_write
            && self.barriers_queued == 0
            && self.main_writes == 0
        {
            self.write_queue.insert(bio, self.tun.sort_queue);
            return id;
        }
        if is_write {
            self.main_writes += 1;
        }
        self.bio_queue.insert(bio, self.tun.sort_queue);
        id
    }

    #[inline]
    fn queued_io(&self) -> usize {
        self.bio_queue.len() + self.write_queue.len()
    }

    #[inline]
    fn has_io(&self) -> bool {
        self.queued_io() > 0
    }

    /// Non-trim work queued and a transport opening free.
    #[inline]
    fn can_dispatch_io(&self) -> bool {
        self.has_io() && self.inflight.len() < self.tun.max_active
    }

    fn has_more_trim(&self) -> bool {
        if self.trim_queue.is_empty() || self.trim_active || self.trims_outstanding > 0 {
            return false;
        }
        let head_bytes = self
            .trim_queue
            .head_blocks()
            .unwrap_or(0)
            .saturating_mul(self.tun.block_size);
        let in_flight = self.stats[BioCmd::Delete.as_index()].in_flight;
        if !self.limiters[LIM_TRIM].can_dispatch(in_flight, head_bytes) {
            return false;
        }
        if self.tun.trim_goal == 0 {
            return true;
        }
        let goal_met = self.trim_queue.len() >= self.tun.trim_goal as usize;
        let aged = self.tun.trim_ticks > 0
            && self.ticks.saturating_sub(self.last_trim_tick) >= u64::from(self.tun.trim_ticks);
        goal_met || aged
    }

    fn queue_mut(&mut self, src: Source) -> &mut BioQueue {
        match src {
            Source::Main => &mut self.bio_queue,
            Source::Writes => &mut self.write_queue,
        }
    }

    /// Pop the head of `src` if its limiter lets it go.
    fn take_from(&mut self, src: Source) -> Option<Bio> {
        let (cmd, bytes) = {
            let head = match src {
                Source::Main => self.bio_queue.peek()?,
                Source::Writes => self.write_queue.peek()?,
            };
            (head.cmd(), head.bytes(self.tun.block_size))
        };
        let slot = limiter_slot(cmd);
        if let Some(slot) = slot {
            let in_flight = self.stats[cmd.as_index()].in_flight;
            if !self.limiters[slot].can_dispatch(in_flight, bytes) {
                return None;
            }
        }

        let bio = self.queue_mut(src).pop()?;
        if let Some(slot) = slot {
            self.limiters[slot].on_dispatch(bytes);
        }
        if src == Source::Main {
            if bio.is_barrier() {
                self.barriers_queued = self.barriers_queued.saturating_sub(1);
            }
            if cmd == BioCmd::Write {
                self.main_writes = self.main_writes.saturating_sub(1);
            }
        }
        self.stats[cmd.as_index()].on_dispatch();
        self.inflight.insert(bio.id(), Inflight { cmd, bytes });
        self.counters.dispatched += 1;
        Some(bio)
    }

    fn next_bio(&mut self) -> Option<Bio> {
        if self.inflight.len() >= self.tun.max_active {
            return None;
        }
        if !self.tun.dynamic {
            return self.take_from(Source::Main);
        }

        // Reads first, but let a write through every `read_bias` reads.
        let writes_waiting = !self.write_queue.is_empty();
        let prefer_write =
            writes_waiting && (self.bio_queue.is_empty() || self.read_bias_left == 0);
        if prefer_write {
            if let Some(bio) = self.take_from(Source::Writes) {
                self.read_bias_left = self.tun.read_bias;
                return Some(bio);
            }
        }
        if let Some(bio) = self.take_from(Source::Main) {
            if bio.cmd() == BioCmd::Read && writes_waiting {
                self.read_bias_left = self.read_bias_left.saturating_sub(1);
            }
            return Some(bio);
        }
        if writes_waiting && !prefer_write {
            let bio = self.take_from(Source::Writes)?;
            self.read_bias_left = self.tun.read_bias;
            return Some(bio);
        }
        None
    }

    fn take_trim_batch(&mut self) -> Option<TrimBatch> {
        let batch = self
            .trim_queue
            .take_batch(self.tun.trim_max_blocks, self.tun.trim_max_ranges)?;
        let stats = &mut self.stats[BioCmd::Delete.as_index()];
        for _ in 0..batch.len() {
            stats.on_dispatch();
        }
        self.trims_outstanding += batch.len();
        self.last_trim_tick = self.ticks;
        Some(batch)
    }

    fn flags(&self) -> WorkFlags {
        BioCmd::iter()
            .filter(|cmd| self.stats[cmd.as_index()].pending() > 0)
            .fold(WorkFlags::empty(), |acc, cmd| acc | WorkFlags::for_cmd(cmd))
    }

    fn snapshot(&self) -> IoSchedStats {
        IoSchedStats {
            queues: self.stats.clone(),
            counters: self.counters,
            flags: self.flags(),
            trim_active: self.trim_active,
            sort_queue: self.tun.sort_queue,
            ticks: self.ticks,
        }
    }
}

pub(crate) struct Shared {
    periph: Arc<dyn Periph>,
    devstat: Option<Arc<dyn DevStat>>,
    name: String,
    /// Mirror of the work flags, readable without the lock
    flags: AtomicU32,
    state: Mutex<SchedState>,
}

impl Shared {
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn load_flags(&self) -> WorkFlags {
        WorkFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_work_flags(&self, flags: WorkFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clr_work_flags(&self, flags: WorkFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Bring the flag word in line with queue contents. Caller holds the lock.
    pub(crate) fn sync_flags(&self, st: &SchedState) {
        let want = st.flags();
        let have = self.load_flags();
        if want == have {
            return;
        }
        let set = want.difference(have);
        let clr = have.difference(want);
        if !set.is_empty() {
            self.set_work_flags(set);
        }
        if !clr.is_empty() {
            self.clr_work_flags(clr);
        }
        ktrace!("{}: work flags {:?} -> {:?}", self.name, have, want);
    }

    /// Release the lock and poke the periph if anything can go now.
    pub(crate) fn kick(&self, st: MutexGuard<'_, SchedState>) -> bool {
        let ready = st.can_dispatch_io() || st.has_more_trim();
        drop(st);
        if ready {
            self.periph.schedule();
        }
        ready
    }

    fn end_transaction(&self, bio: &Bio) {
        if let Some(ds) = &self.devstat {
            ds.end_transaction(bio);
        }
    }
}

/// Per-peripheral I/O scheduler.
///
/// # Example
///
/// ```rust,ignore
/// let sched = iosched::init(periph, IoSchedConfig::from_env())?;
/// sched.queue_work(Bio::read(100, 8));
/// while let Some(bio) = sched.next_bio() {
///     transport.submit(bio);
/// }
/// ```
pub struct IoScheduler {
    pub(crate) shared: Arc<Shared>,
}

/// Create a scheduler for `periph`.
///
/// Fails with `InvalidConfig` when the configuration does not validate and
/// with `AllocationFailed` when queue storage cannot be reserved.
pub fn init(periph: Arc<dyn Periph>, config: IoSchedConfig) -> IoSchedResult<IoScheduler> {
    IoScheduler::new(periph, None, config)
}

/// Like [`init`], with a devstat that sees every transaction.
pub fn init_with_devstat(
    periph: Arc<dyn Periph>,
    devstat: Arc<dyn DevStat>,
    config: IoSchedConfig,
) -> IoSchedResult<IoScheduler> {
    IoScheduler::new(periph, Some(devstat), config)
}

/// Tear down a scheduler. `None` is a no-op.
pub fn fini(sched: Option<IoScheduler>) -> IoSchedResult<()> {
    match sched {
        Some(sched) => sched.fini(),
        None => Ok(()),
    }
}

impl IoScheduler {
    fn new(
        periph: Arc<dyn Periph>,
        devstat: Option<Arc<dyn DevStat>>,
        config: IoSchedConfig,
    ) -> IoSchedResult<Self> {
        iosched_core::klog::init();
        config.validate()?;

        let name = format!("{}{}", periph.name(), periph.unit());
        let sort_queue = config.sort_queue.unwrap_or_else(|| periph.is_rotational());
        let state = SchedState::new(&config, sort_queue).map_err(|e| {
            kerror!("{}: iosched init failed: {}", name, e);
            e
        })?;

        kinfo!(
            "{}: iosched init sort={} dynamic={} max_active={}",
            name,
            sort_queue,
            config.dynamic,
            config.max_active
        );

        Ok(Self {
            shared: Arc::new(Shared {
                periph,
                devstat,
                name,
                flags: AtomicU32::new(0),
                state: Mutex::new(state),
            }),
        })
    }

    /// Tear down. Work still queued or in flight is reported and dropped
    /// without running its callbacks.
    pub fn fini(self) -> IoSchedResult<()> {
        let (queued, inflight) = {
            let st = self.shared.lock();
            (
                st.queued_io() + st.trim_queue.len(),
                st.inflight.len() + st.trims_outstanding,
            )
        };
        if queued > 0 || inflight > 0 {
            kerror!(
                "{}: iosched fini with {} queued, {} in flight",
                self.shared.name,
                queued,
                inflight
            );
            return Err(IoSchedError::NotDrained { queued, inflight });
        }
        kinfo!("{}: iosched fini", self.shared.name);
        Ok(())
    }

    /// Device name, e.g. `da0`
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Take ownership of `bio` and queue it. Never fails.
    pub fn queue_work(&self, bio: Bio) -> BioId {
        if let Some(ds) = &self.shared.devstat {
            ds.start_transaction(&bio);
        }
        let mut st = self.shared.lock();
        let id = st.enqueue(bio);
        self.shared.sync_flags(&st);
        id
    }

    /// Next non-trim bio to send to hardware.
    ///
    /// `None` when nothing is queued, when `max_active` commands are in
    /// flight, or when the head's limiter refuses. Nothing changes in that
    /// case.
    pub fn next_bio(&self) -> Option<Bio> {
        let mut st = self.shared.lock();
        let bio = st.next_bio()?;
        self.shared.sync_flags(&st);
        ktrace!(
            "{}: dispatch {} {} [{}, {})",
            self.shared.name,
            bio.id(),
            bio.cmd(),
            bio.lba(),
            bio.end()
        );
        Some(bio)
    }

    /// Account for a finished command and poke the periph if more work can go.
    ///
    /// The error is the one already set on the bio or, failing that, the
    /// one implied by the ccb status; it is recorded on the bio. Completing a
    /// bio that was never dispatched is refused.
    pub fn bio_complete(&self, bio: &mut Bio, ccb: &Ccb) -> IoSchedResult<CompletionStatus> {
        let (status, slow) = {
            let mut st = self.shared.lock();
            let Some(entry) = st.inflight.remove(&bio.id()) else {
                kerror!("{}: completion for undispatched bio {}", self.shared.name, bio.id());
                return Err(IoSchedError::NotDispatched(bio.id()));
            };

            let error = bio.error().or_else(|| ccb.status().errno());
            if let Some(errno) = error {
                bio.set_error(errno);
            }

            let idx = entry.cmd.as_index();
            let latency = ccb.latency();
            let in_flight_before = st.stats[idx].in_flight;
            let alpha_bits = st.tun.alpha_bits;
            st.stats[idx].on_complete(latency, error.is_some(), entry.bytes, alpha_bits);
            st.counters.completed += 1;

            if let Some(slot) = limiter_slot(entry.cmd) {
                if st.limiters[slot].on_complete(in_flight_before) {
                    ktrace!("{}: {} limiter reopened", self.shared.name, entry.cmd);
                }
            }

            let threshold = st.tun.latency_threshold;
            let slow = match latency {
                Some(lat) if !threshold.is_zero() && lat > threshold => {
                    st.counters.slow_completions += 1;
                    Some((lat, st.latency_cb.clone()))
                }
                _ => None,
            };

            self.shared.sync_flags(&st);
            let reschedule = st.can_dispatch_io() || st.has_more_trim();
            (CompletionStatus { error, reschedule }, slow)
        };

        self.shared.end_transaction(bio);
        if let Some((lat, cb)) = slow {
            kwarn!(
                "{}: slow {} {} [{}, {}) took {:?}",
                self.shared.name,
                bio.cmd(),
                bio.id(),
                bio.lba(),
                bio.end(),
                lat
            );
            if let Some(cb) = cb {
                cb(bio, lat);
            }
        }
        if status.reschedule {
            self.shared.periph.schedule();
        }
        Ok(status)
    }

    /// Poke the periph if anything is ready to go. Returns whether it did.
    pub fn schedule(&self) -> bool {
        self.shared.kick(self.shared.lock())
    }

    /// Start of a new limiter quantum.
    ///
    /// Refills IOPS and bandwidth budgets and ages queued trims. Pokes the
    /// periph when work is ready; returns whether it did.
    pub fn tick(&self) -> bool {
        let mut st = self.shared.lock();
        st.ticks += 1;
        for (slot, limiter) in st.limiters.iter_mut().enumerate() {
            if limiter.tick() {
                ktrace!("{}: limiter {} refilled", self.shared.name, slot);
            }
        }
        self.shared.kick(st)
    }

    /// Sort mode for bios queued from now on.
    pub fn set_sort_queue(&self, sort: bool) {
        self.shared.lock().tun.sort_queue = sort;
    }

    pub fn sort_queue(&self) -> bool {
        self.shared.lock().tun.sort_queue
    }

    /// True if any flag in `mask` is set. Does not take the scheduler lock.
    #[inline]
    pub fn has_work_flags(&self, mask: WorkFlags) -> bool {
        self.shared.load_flags().intersects(mask)
    }

    pub fn work_flags(&self) -> WorkFlags {
        self.shared.load_flags()
    }

    /// Non-trim bios queued
    pub fn has_io(&self) -> bool {
        self.shared.lock().has_io()
    }

    /// Anything queued or in flight
    pub fn has_work(&self) -> bool {
        !self.shared.load_flags().is_empty()
    }

    /// A trim batch may be pulled with `get_trim` now.
    pub fn has_more_trim(&self) -> bool {
        self.shared.lock().has_more_trim()
    }

    /// Bios waiting, trims included
    pub fn queued(&self) -> usize {
        let st = self.shared.lock();
        st.queued_io() + st.trim_queue.len()
    }

    /// Bios handed out and not yet completed, trims included
    pub fn inflight(&self) -> usize {
        let st = self.shared.lock();
        st.inflight.len() + st.trims_outstanding
    }

    pub fn stats(&self) -> IoSchedStats {
        self.shared.lock().snapshot()
    }

    pub fn set_latency_callback<F>(&self, f: F)
    where
        F: Fn(&Bio, Duration) + Send + Sync + 'static,
    {
        self.shared.lock().latency_cb = Some(Arc::new(f));
    }

    pub fn clear_latency_callback(&self) {
        self.shared.lock().latency_cb = None;
    }

    // ── Trims ────────────────────────────────────────────────────────────

    /// Next trim batch if one should go now: no batch active, the trim
    /// limiter agrees, and the batching goal (count or age) is met.
    pub fn get_trim(&self) -> Option<TrimBatch> {
        let mut st = self.shared.lock();
        if !st.has_more_trim() {
            return None;
        }
        let batch = st.take_trim_batch()?;
        self.shared.sync_flags(&st);
        Some(batch)
    }

    /// Next trim batch regardless of goal, limiter or active batch.
    pub fn next_trim(&self) -> Option<TrimBatch> {
        let mut st = self.shared.lock();
        let batch = st.take_trim_batch()?;
        self.shared.sync_flags(&st);
        Some(batch)
    }

    /// The batch is going to hardware. Returns false if it already went.
    pub fn submit_trim(&self, batch: &mut TrimBatch) -> bool {
        if !batch.mark_submitted(Instant::now()) {
            kdebug!(
                "{}: trim [{}, {}) submitted twice",
                self.shared.name,
                batch.start(),
                batch.end()
            );
            return false;
        }
        let mut st = self.shared.lock();
        let bytes = batch.blocks().saturating_mul(st.tun.block_size);
        st.trim_active = true;
        st.trim_charge = Some(bytes);
        st.limiters[LIM_TRIM].on_dispatch(bytes);
        st.counters.trim_batches += 1;
        true
    }

    /// Acknowledge a batch. Members come back with `error` recorded, ready
    /// for the caller to complete.
    pub fn finish_trim(&self, batch: TrimBatch, error: Option<i32>) -> Vec<Bio> {
        let latency = batch.submitted_at().map(|at| at.elapsed());
        let mut members = batch.into_members();
        {
            let mut st = self.shared.lock();
            let block_size = st.tun.block_size;
            let alpha_bits = st.tun.alpha_bits;
            let stats = &mut st.stats[BioCmd::Delete.as_index()];
            for bio in members.iter_mut() {
                if let Some(errno) = error {
                    bio.set_error(errno);
                }
                stats.on_complete(latency, bio.is_error(), bio.bytes(block_size), alpha_bits);
            }
            st.trims_outstanding = st.trims_outstanding.saturating_sub(members.len());
            st.trim_charge = None;
            self.shared.sync_flags(&st);
        }
        for bio in &members {
            self.shared.end_transaction(bio);
        }
        members
    }

    /// Return an unfinished batch. Members go back under their original
    /// keys; the next pull rebuilds the same batch.
    ///
    /// When every member of a submitted batch comes back without any of it
    /// finishing, the trim limiter charge is returned. The active state is
    /// still cleared only by `trim_done`.
    pub fn put_back_trim(&self, batch: TrimBatch) {
        let (start, end) = (batch.start(), batch.end());
        let submitted = batch.is_submitted();
        let members = batch.into_members();
        let n = members.len();
        let mut st = self.shared.lock();
        let stats = &mut st.stats[BioCmd::Delete.as_index()];
        for _ in 0..n {
            stats.on_requeue();
        }
        st.trim_queue.put_back(members);
        st.trims_outstanding = st.trims_outstanding.saturating_sub(n);
        st.counters.trims_put_back += n as u64;
        if submitted && st.trims_outstanding == 0 {
            if let Some(bytes) = st.trim_charge.take() {
                st.limiters[LIM_TRIM].refund(bytes);
            }
        }
        self.shared.sync_flags(&st);
        kdebug!("{}: trim [{}, {}) put back ({} bios)", self.shared.name, start, end, n);
    }

    /// Final trim hook. Clears the active batch once every member is
    /// accounted for and reschedules if more trims are ready. Returns
    /// whether the active state was cleared.
    pub fn trim_done(&self) -> bool {
        let more = {
            let mut st = self.shared.lock();
            if !st.trim_active || st.trims_outstanding > 0 {
                return false;
            }
            st.trim_active = false;
            st.has_more_trim()
        };
        if more {
            self.shared.periph.schedule();
        }
        true
    }

    // ── Flush / deferred completion ─────────────────────────────────────

    /// Fail every queued bio with `error`.
    ///
    /// In-flight bios are left alone. Each flushed bio ends its devstat
    /// transaction (on `devstat` if given, else the one from init) and has
    /// its callback run. Returns how many were flushed.
    pub fn flush(&self, devstat: Option<&dyn DevStat>, error: i32) -> usize {
        let drained = {
            let mut st = self.shared.lock();
            let mut drained = st.bio_queue.drain_all();
            drained.extend(st.write_queue.drain_all());
            drained.extend(st.trim_queue.drain_all());
            for bio in &drained {
                st.stats[bio.cmd().as_index()].on_flushed();
            }
            st.barriers_queued = 0;
            st.main_writes = 0;
            st.counters.flushed += drained.len() as u64;
            self.shared.sync_flags(&st);
            drained
        };

        let n = drained.len();
        if n > 0 {
            kwarn!("{}: flushing {} queued bios with error {}", self.shared.name, n, error);
        }
        let ds: Option<&dyn DevStat> = match devstat {
            Some(ds) => Some(ds),
            None => self.shared.devstat.as_deref(),
        };
        for mut bio in drained {
            bio.set_error(error);
            if let Some(ds) = ds {
                ds.end_transaction(&bio);
            }
            bio.done();
        }
        n
    }

    /// Complete everything posted to `done`, in posting order.
    pub fn drain_done(&self, done: &DoneQueue) -> Vec<(Bio, IoSchedResult<CompletionStatus>)> {
        let mut out = Vec::with_capacity(done.len());
        while let Some((mut bio, ccb)) = done.pop() {
            let res = self.bio_complete(&mut bio, &ccb);
            out.push((bio, res));
        }
        out
    }
}

impl fmt::Debug for IoScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.lock();
        f.debug_struct("IoScheduler")
            .field("name", &self.shared.name)
            .field("queued", &(st.queued_io() + st.trim_queue.len()))
            .field("inflight", &(st.inflight.len() + st.trims_outstanding))
            .field("flags", &self.shared.load_flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;
    use crate::limiter::LimiterKind;
    use iosched_core::{BioFlags, CcbStatus};
    use std::sync::atomic::AtomicUsize;

    struct TestPeriph {
        rotational: bool,
        pokes: AtomicUsize,
    }

    impl Periph for TestPeriph {
        fn name(&self) -> &str {
            "da"
        }
        fn unit(&self) -> u32 {
            0
        }
        fn is_rotational(&self) -> bool {
            self.rotational
        }
        fn schedule(&self) {
            self.pokes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn periph(rotational: bool) -> Arc<TestPeriph> {
        Arc::new(TestPeriph { rotational, pokes: AtomicUsize::new(0) })
    }

    fn sched(config: IoSchedConfig) -> IoScheduler {
        init(periph(false), config).unwrap()
    }

    fn done_ccb() -> Ccb {
        let mut ccb = Ccb::issue();
        ccb.complete(CcbStatus::ReqCmp);
        ccb
    }

    fn complete(s: &IoScheduler, mut bio: Bio) -> CompletionStatus {
        s.bio_complete(&mut bio, &done_ccb()).unwrap()
    }

    #[test]
    fn test_sort_follows_rotational_hint() {
        let s = init(periph(true), IoSchedConfig::new()).unwrap();
        assert!(s.sort_queue());
        let s = init(periph(true), IoSchedConfig::new().sort_queue(Some(false))).unwrap();
        assert!(!s.sort_queue());
        assert_eq!(s.name(), "da0");
    }

    #[test]
    fn test_max_active_backpressure() {
        let s = sched(IoSchedConfig::new().max_active(2));
        for lba in 0..3 {
            s.queue_work(Bio::read(lba * 10, 1));
        }
        let a = s.next_bio().unwrap();
        let _b = s.next_bio().unwrap();
        assert!(s.next_bio().is_none());
        assert!(s.next_bio().is_none());
        assert_eq!(s.queued(), 1);
        complete(&s, a);
        assert!(s.next_bio().is_some());
    }

    #[test]
    fn test_dynamic_read_bias() {
        let s = sched(IoSchedConfig::new().dynamic(true).read_bias(2));
        for i in 0..3 {
            s.queue_work(Bio::write(1000 + i, 1));
        }
        for i in 0..5 {
            s.queue_work(Bio::read(i, 1));
        }
        let cmds: Vec<_> = std::iter::from_fn(|| s.next_bio())
            .map(|b| b.cmd())
            .collect();
        use BioCmd::{Read as R, Write as W};
        assert_eq!(cmds, vec![R, R, W, R, R, W, R, W]);
    }

    #[test]
    fn test_dynamic_barrier_holds_writes() {
        let s = sched(IoSchedConfig::new().dynamic(true).read_bias(8));
        s.queue_work(Bio::write(10, 1));
        s.queue_work(Bio::flush());
        s.queue_work(Bio::write(20, 1));
        s.queue_work(Bio::read(30, 1));
        let order: Vec<_> = std::iter::from_fn(|| s.next_bio())
            .map(|b| (b.cmd(), b.lba()))
            .collect();
        assert_eq!(
            order,
            vec![
                (BioCmd::Write, 10),
                (BioCmd::Flush, 0),
                (BioCmd::Write, 20),
                (BioCmd::Read, 30)
            ]
        );
    }

    #[test]
    fn test_dynamic_writes_stay_ordered_after_barrier() {
        let s = sched(
            IoSchedConfig::new()
                .dynamic(true)
                .read_bias(1)
                .sort_queue(Some(false)),
        );
        s.queue_work(Bio::write(900, 1));
        s.queue_work(Bio::read(0, 1));
        let mut order: Vec<_> = s.next_bio().into_iter().collect();
        s.queue_work(Bio::flush());
        let older = s.queue_work(Bio::write(10, 1));
        order.extend(s.next_bio());
        order.extend(s.next_bio());
        // The flush is gone but the older write is still queued behind it.
        let newer = s.queue_work(Bio::write(10, 1));
        order.extend(std::iter::from_fn(|| s.next_bio()));

        let ids: Vec<_> = order
            .iter()
            .filter(|b| b.cmd() == BioCmd::Write && b.lba() == 10)
            .map(|b| b.id())
            .collect();
        assert_eq!(ids, vec![older, newer]);
        assert_eq!(order.len(), 5);

        // With the old writes gone, new writes use the write queue again
        // and the spent read bias lets one through first.
        for bio in order {
            complete(&s, bio);
        }
        s.queue_work(Bio::read(1, 1));
        s.queue_work(Bio::read(2, 1));
        s.queue_work(Bio::write(20, 1));
        let cmds: Vec<_> = std::iter::from_fn(|| s.next_bio()).map(|b| b.cmd()).collect();
        assert_eq!(cmds, vec![BioCmd::Write, BioCmd::Read, BioCmd::Read]);
    }

    #[test]
    fn test_ordered_bio_is_a_barrier() {
        let s = sched(IoSchedConfig::new().sort_queue(Some(true)));
        s.queue_work(Bio::write(300, 1));
        s.queue_work(Bio::write(200, 1).with_flags(BioFlags::ORDERED));
        s.queue_work(Bio::write(100, 1));
        let lbas: Vec<_> = std::iter::from_fn(|| s.next_bio()).map(|b| b.lba()).collect();
        assert_eq!(lbas, vec![300, 200, 100]);
    }

    #[test]
    fn test_completion_error_from_ccb() {
        let s = sched(IoSchedConfig::new());
        s.queue_work(Bio::read(0, 8));
        let mut bio = s.next_bio().unwrap();
        let mut ccb = Ccb::issue();
        ccb.complete(CcbStatus::CmdTimeout);
        let status = s.bio_complete(&mut bio, &ccb).unwrap();
        assert_eq!(status.error, Some(libc::ETIMEDOUT));
        assert_eq!(bio.error(), Some(libc::ETIMEDOUT));
        assert_eq!(s.stats().queue(BioCmd::Read).errors, 1);
    }

    #[test]
    fn test_double_completion_refused() {
        let s = sched(IoSchedConfig::new());
        s.queue_work(Bio::write(0, 1));
        let mut bio = s.next_bio().unwrap();
        let ccb = done_ccb();
        assert!(s.bio_complete(&mut bio, &ccb).is_ok());
        assert_eq!(
            s.bio_complete(&mut bio, &ccb),
            Err(IoSchedError::NotDispatched(bio.id()))
        );
        let mut stray = Bio::read(0, 1);
        assert!(s.bio_complete(&mut stray, &ccb).is_err());
    }

    #[test]
    fn test_queue_depth_limiter() {
        let s = sched(
            IoSchedConfig::new().write_limiter(LimiterConfig::new(LimiterKind::QueueDepth, 1)),
        );
        s.queue_work(Bio::write(0, 1));
        s.queue_work(Bio::write(1, 1));
        s.queue_work(Bio::read(2, 1));
        let w = s.next_bio().unwrap();
        // FIFO head is a write and the write limiter is full.
        assert!(s.next_bio().is_none());
        complete(&s, w);
        assert_eq!(s.next_bio().map(|b| b.lba()), Some(1));
    }

    #[test]
    fn test_iops_limiter_waits_for_tick() {
        let p = periph(false);
        let s = init(
            p.clone(),
            IoSchedConfig::new().read_limiter(LimiterConfig::new(LimiterKind::Iops, 1)),
        )
        .unwrap();
        s.queue_work(Bio::read(0, 1));
        s.queue_work(Bio::read(1, 1));
        assert!(s.next_bio().is_some());
        assert!(s.next_bio().is_none());
        assert!(s.tick());
        assert_eq!(p.pokes.load(Ordering::SeqCst), 1);
        assert!(s.next_bio().is_some());
    }

    #[test]
    fn test_trim_goal_and_age() {
        let s = sched(IoSchedConfig::new().trim_goal(3).trim_ticks(2));
        s.queue_work(Bio::delete(0, 8));
        s.queue_work(Bio::delete(100, 8));
        assert!(!s.has_more_trim());
        assert!(s.get_trim().is_none());
        s.tick();
        assert!(!s.has_more_trim());
        s.tick();
        assert!(s.has_more_trim());

        let batch = s.get_trim().unwrap();
        assert_eq!(batch.ranges(), vec![(0, 8)]);
        // One batch at a time.
        assert!(s.get_trim().is_none());
        let bios = s.finish_trim(batch, None);
        assert_eq!(bios.len(), 1);

        // The age restarts once a batch goes out.
        assert!(s.get_trim().is_none());
        let rest = s.next_trim().unwrap();
        assert_eq!(rest.start(), 100);
        s.put_back_trim(rest);
        s.tick();
        s.tick();
        let rest = s.get_trim().unwrap();
        let _ = s.finish_trim(rest, None);
    }

    #[test]
    fn test_trim_active_until_done() {
        let s = sched(IoSchedConfig::new());
        s.queue_work(Bio::delete(0, 8));
        s.queue_work(Bio::delete(50, 8));
        let mut batch = s.get_trim().unwrap();
        assert!(s.submit_trim(&mut batch));
        assert!(!s.submit_trim(&mut batch));
        assert!(!s.trim_done());
        let bios = s.finish_trim(batch, None);
        assert!(bios.iter().all(|b| !b.is_error()));
        assert!(!s.has_more_trim());
        assert!(s.stats().trim_active);
        assert!(s.trim_done());
        assert!(!s.stats().trim_active);
        assert!(s.has_more_trim());
        let rest = s.get_trim().unwrap();
        let bios = s.finish_trim(rest, Some(libc::EIO));
        assert_eq!(bios[0].error(), Some(libc::EIO));
        assert_eq!(s.stats().queue(BioCmd::Delete).errors, 1);
    }

    #[test]
    fn test_trim_limiter_gates_batches() {
        let p = periph(false);
        let s = init(
            p.clone(),
            IoSchedConfig::new().trim_limiter(LimiterConfig::new(LimiterKind::Iops, 1)),
        )
        .unwrap();
        s.queue_work(Bio::delete(0, 8));
        s.queue_work(Bio::delete(100, 8));

        let mut batch = s.get_trim().unwrap();
        assert!(s.submit_trim(&mut batch));
        let _ = s.finish_trim(batch, None);
        assert!(s.trim_done());
        assert_eq!(p.pokes.load(Ordering::SeqCst), 0);

        // Budget spent for this tick.
        assert!(!s.has_more_trim());
        assert!(s.get_trim().is_none());

        assert!(s.tick());
        assert_eq!(p.pokes.load(Ordering::SeqCst), 1);
        let batch = s.get_trim().unwrap();
        assert_eq!(batch.start(), 100);
        let _ = s.finish_trim(batch, None);
    }

    #[test]
    fn test_put_back_returns_trim_charge() {
        let s = sched(
            IoSchedConfig::new().trim_limiter(LimiterConfig::new(LimiterKind::Iops, 1)),
        );
        s.queue_work(Bio::delete(0, 8));

        let mut batch = s.get_trim().unwrap();
        assert!(s.submit_trim(&mut batch));
        s.put_back_trim(batch);
        // Still active until the final hook runs.
        assert!(s.stats().trim_active);
        assert!(s.trim_done());

        // The charge came back, so the retry goes out in the same tick.
        let mut batch = s.get_trim().unwrap();
        assert!(s.submit_trim(&mut batch));
        let _ = s.finish_trim(batch, None);
        assert!(s.trim_done());

        // A finished submission keeps its charge.
        s.queue_work(Bio::delete(50, 8));
        assert!(s.get_trim().is_none());
        s.tick();
        let batch = s.get_trim().unwrap();
        let _ = s.finish_trim(batch, None);
    }

    #[test]
    fn test_flags_track_pending_work() {
        let s = sched(IoSchedConfig::new());
        assert!(!s.has_work());
        s.queue_work(Bio::read(0, 1));
        s.queue_work(Bio::delete(0, 1));
        assert!(s.has_work_flags(WorkFlags::READ));
        assert!(s.has_work_flags(WorkFlags::TRIM));
        assert!(!s.has_work_flags(WorkFlags::WRITE | WorkFlags::FLUSH));

        let bio = s.next_bio().unwrap();
        assert!(s.has_work_flags(WorkFlags::READ));
        complete(&s, bio);
        assert!(!s.has_work_flags(WorkFlags::READ));

        let batch = s.next_trim().unwrap();
        assert!(s.has_work_flags(WorkFlags::TRIM));
        s.put_back_trim(batch);
        assert!(s.has_work_flags(WorkFlags::TRIM));
        let batch = s.next_trim().unwrap();
        let _ = s.finish_trim(batch, None);
        assert_eq!(s.work_flags(), WorkFlags::empty());
    }

    #[test]
    fn test_latency_callback() {
        let s = sched(IoSchedConfig::new().latency_threshold(Duration::from_micros(100)));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        s.set_latency_callback(move |_, lat| {
            assert!(lat > Duration::from_micros(100));
            h.fetch_add(1, Ordering::SeqCst);
        });
        s.queue_work(Bio::read(0, 1));
        s.queue_work(Bio::read(1, 1));

        let start = Instant::now();
        let mut slow = s.next_bio().unwrap();
        let mut ccb = Ccb::issued_at(start);
        ccb.complete_at(CcbStatus::ReqCmp, start + Duration::from_millis(5));
        s.bio_complete(&mut slow, &ccb).unwrap();

        let mut fast = s.next_bio().unwrap();
        let mut ccb = Ccb::issued_at(start);
        ccb.complete_at(CcbStatus::ReqCmp, start + Duration::from_micros(10));
        s.bio_complete(&mut fast, &ccb).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(s.stats().counters.slow_completions, 1);
    }

    #[test]
    fn test_fini_checks_drained() {
        let s = sched(IoSchedConfig::new());
        s.queue_work(Bio::read(0, 1));
        assert_eq!(s.fini(), Err(IoSchedError::NotDrained { queued: 1, inflight: 0 }));
        assert_eq!(fini(None), Ok(()));
        assert!(fini(Some(sched(IoSchedConfig::new()))).is_ok());
    }
}
