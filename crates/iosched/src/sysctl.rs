//! Sysctl / tunable surface
//!
//! A flat tree of integer nodes addressed by dotted paths
//! (`dev.da.0.iosched.sort_queue`). Nodes are backed by closures, so the
//! tree does not own what it exposes; a scheduler that has been torn down
//! answers `IoSchedError::Gone`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use iosched_core::{kdebug, BioCmd, IoSchedError, IoSchedResult};

use crate::limiter::LimiterKind;
use crate::scheduler::{IoScheduler, SchedState, Shared, LIM_READ, LIM_TRIM, LIM_WRITE};
use crate::stats::QueueStats;

type Getter = Box<dyn Fn() -> IoSchedResult<i64> + Send + Sync>;
type Setter = Box<dyn Fn(i64) -> IoSchedResult<()> + Send + Sync>;

struct SysctlNode {
    descr: &'static str,
    get: Getter,
    set: Option<Setter>,
}

#[derive(Default)]
pub struct SysctlCtx {
    nodes: BTreeMap<String, SysctlNode>,
}

impl SysctlCtx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a read-only node. Re-registering a path replaces it.
    pub fn add_ro<G>(&mut self, path: String, descr: &'static str, get: G)
    where
        G: Fn() -> IoSchedResult<i64> + Send + Sync + 'static,
    {
        self.nodes.insert(path, SysctlNode { descr, get: Box::new(get), set: None });
    }

    /// Register a read-write node.
    pub fn add_rw<G, S>(&mut self, path: String, descr: &'static str, get: G, set: S)
    where
        G: Fn() -> IoSchedResult<i64> + Send + Sync + 'static,
        S: Fn(i64) -> IoSchedResult<()> + Send + Sync + 'static,
    {
        self.nodes.insert(
            path,
            SysctlNode { descr, get: Box::new(get), set: Some(Box::new(set)) },
        );
    }

    pub fn get(&self, path: &str) -> IoSchedResult<i64> {
        (self.node(path)?.get)()
    }

    pub fn set(&self, path: &str, value: i64) -> IoSchedResult<()> {
        match &self.node(path)?.set {
            Some(set) => set(value),
            None => Err(IoSchedError::ReadOnlyTunable(path.to_string())),
        }
    }

    pub fn describe(&self, path: &str) -> Option<&'static str> {
        self.nodes.get(path).map(|n| n.descr)
    }

    pub fn is_writable(&self, path: &str) -> bool {
        self.nodes.get(path).is_some_and(|n| n.set.is_some())
    }

    /// Registered paths, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, path: &str) -> IoSchedResult<&SysctlNode> {
        self.nodes
            .get(path)
            .ok_or_else(|| IoSchedError::UnknownTunable(path.to_string()))
    }
}

impl fmt::Debug for SysctlCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.nodes.keys()).finish()
    }
}

impl IoScheduler {
    /// Register this scheduler's tunables under `<parent>.iosched.`.
    ///
    /// Nodes hold weak references: once the scheduler is gone they answer
    /// `IoSchedError::Gone`.
    pub fn sysctl_init(&self, ctx: &mut SysctlCtx, parent: &str) {
        let weak = Arc::downgrade(&self.shared);
        let path = |leaf: &str| {
            if parent.is_empty() {
                format!("iosched.{}", leaf)
            } else {
                format!("{}.iosched.{}", parent, leaf)
            }
        };

        rw(
            ctx,
            &weak,
            path("sort_queue"),
            "Sort bios by LBA (0/1)",
            |st| i64::from(st.tun.sort_queue),
            |st, v| match v {
                0 | 1 => {
                    st.tun.sort_queue = v == 1;
                    true
                }
                _ => false,
            },
        );
        rw(
            ctx,
            &weak,
            path("read_bias"),
            "Reads served per write under dynamic scheduling",
            |st| i64::from(st.tun.read_bias),
            |st, v| set_from(&mut st.tun.read_bias, v, 0),
        );
        rw(
            ctx,
            &weak,
            path("max_active"),
            "Maximum non-trim commands in flight",
            |st| clamp(st.tun.max_active as u64),
            |st, v| set_from(&mut st.tun.max_active, v, 1),
        );
        rw(
            ctx,
            &weak,
            path("trim_goal"),
            "Trims to accumulate before a batch goes out",
            |st| i64::from(st.tun.trim_goal),
            |st, v| set_from(&mut st.tun.trim_goal, v, 0),
        );
        rw(
            ctx,
            &weak,
            path("trim_ticks"),
            "Ticks a trim waits for the goal (0 = forever)",
            |st| i64::from(st.tun.trim_ticks),
            |st, v| set_from(&mut st.tun.trim_ticks, v, 0),
        );
        rw(
            ctx,
            &weak,
            path("trim_max_blocks"),
            "Largest trim batch extent in blocks",
            |st| clamp(st.tun.trim_max_blocks),
            |st, v| set_from(&mut st.tun.trim_max_blocks, v, 1),
        );
        rw(
            ctx,
            &weak,
            path("trim_max_ranges"),
            "Most bios per trim batch",
            |st| clamp(st.tun.trim_max_ranges as u64),
            |st, v| set_from(&mut st.tun.trim_max_ranges, v, 1),
        );
        rw(
            ctx,
            &weak,
            path("latency_threshold_us"),
            "Report completions slower than this (0 = off)",
            |st| clamp(u64::try_from(st.tun.latency_threshold.as_micros()).unwrap_or(u64::MAX)),
            |st, v| match u64::try_from(v) {
                Ok(us) => {
                    st.tun.latency_threshold = Duration::from_micros(us);
                    true
                }
                Err(_) => false,
            },
        );

        for (queue, slot) in [("read", LIM_READ), ("write", LIM_WRITE), ("trim", LIM_TRIM)] {
            rw(
                ctx,
                &weak,
                path(&format!("{}.limiter", queue)),
                "Limiter: 0 none, 1 queue depth, 2 iops, 3 bandwidth",
                move |st| st.limiters[slot].kind() as i64,
                move |st, v| match LimiterKind::from_index(v) {
                    Some(kind) if kind == LimiterKind::None || st.limiters[slot].max() > 0 => {
                        st.limiters[slot].set_kind(kind);
                        true
                    }
                    _ => false,
                },
            );
            rw(
                ctx,
                &weak,
                path(&format!("{}.max", queue)),
                "Limiter maximum: commands in flight, commands or bytes per tick",
                move |st| clamp(st.limiters[slot].max()),
                move |st, v| match u64::try_from(v) {
                    Ok(0) if st.limiters[slot].kind() != LimiterKind::None => false,
                    Ok(max) => {
                        st.limiters[slot].set_max(max);
                        true
                    }
                    Err(_) => false,
                },
            );
        }

        let fields: [(&str, &'static str, fn(&QueueStats) -> u64); 5] = [
            ("queued", "Bios waiting", |q| q.queued),
            ("in_flight", "Bios dispatched, not completed", |q| q.in_flight),
            ("total", "Bios completed", |q| q.total_out),
            ("errors", "Bios completed with an error", |q| q.errors),
            ("ema_us", "Latency moving average in microseconds", |q| q.ema_ns / 1000),
        ];
        for cmd in BioCmd::iter() {
            let idx = cmd.as_index();
            for (leaf, descr, field) in fields {
                ro(
                    ctx,
                    &weak,
                    path(&format!("{}.{}", cmd.name(), leaf)),
                    descr,
                    move |st| clamp(field(&st.stats[idx])),
                );
            }
        }
        ro(
            ctx,
            &weak,
            path("trim_active"),
            "A trim batch is at the device",
            |st| i64::from(st.trim_active),
        );

        kdebug!("{}: sysctl nodes under {}", self.name(), path(""));
    }
}

fn clamp(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Store `v` into `slot` when it is at least `min` and fits the type.
fn set_from<T: TryFrom<i64>>(slot: &mut T, v: i64, min: i64) -> bool {
    if v < min {
        return false;
    }
    match T::try_from(v) {
        Ok(x) => {
            *slot = x;
            true
        }
        Err(_) => false,
    }
}

fn ro<G>(ctx: &mut SysctlCtx, weak: &Weak<Shared>, path: String, descr: &'static str, get: G)
where
    G: Fn(&SchedState) -> i64 + Send + Sync + 'static,
{
    let weak = weak.clone();
    ctx.add_ro(path, descr, move || {
        let shared = weak.upgrade().ok_or(IoSchedError::Gone)?;
        let st = shared.lock();
        Ok(get(&*st))
    });
}

fn rw<G, S>(
    ctx: &mut SysctlCtx,
    weak: &Weak<Shared>,
    path: String,
    descr: &'static str,
    get: G,
    set: S,
) where
    G: Fn(&SchedState) -> i64 + Send + Sync + 'static,
    S: Fn(&mut SchedState, i64) -> bool + Send + Sync + 'static,
{
    let (wg, ws) = (weak.clone(), weak.clone());
    let name = path.clone();
    ctx.add_rw(
        path,
        descr,
        move || {
            let shared = wg.upgrade().ok_or(IoSchedError::Gone)?;
            let st = shared.lock();
            Ok(get(&*st))
        },
        move |v| {
            let shared = ws.upgrade().ok_or(IoSchedError::Gone)?;
            let mut st = shared.lock();
            if !set(&mut *st, v) {
                return Err(IoSchedError::InvalidTunable { name: name.clone(), value: v });
            }
            kdebug!("sysctl {} = {}", name, v);
            // Wake the periph if the new value frees queued work.
            shared.kick(st);
            Ok(())
        },
    );
}
