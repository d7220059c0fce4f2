//! Simulated disk driver
//!
//! Runs the scheduler the way a disk driver would: a workload thread queues
//! bios, a dispatch loop feeds a fake device, and the device thread posts
//! completions to a `DoneQueue` like an interrupt handler.
//!
//! Usage: iosched-sim [bios] [trim_percent] [error_per_mille]
//!
//! Scheduler tunables come from the `IOS_*` environment variables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use iosched::{init_with_devstat, DevStatCounters, DoneQueue, IoSchedConfig, IoScheduler, SysctlCtx, TrimBatch};
use iosched_core::{kinfo, kwarn, Bio, BioCmd, Ccb, CcbStatus, Periph, WorkFlags};

/// Wakeup line between the device and the dispatch loop
struct SimDisk {
    rotational: bool,
    pending: Mutex<bool>,
    cv: Condvar,
}

impl SimDisk {
    fn new(rotational: bool) -> Self {
        Self {
            rotational,
            pending: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Wait for a schedule request, at most `timeout`.
    fn wait(&self, timeout: Duration) {
        let guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let (mut guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |pending| !*pending)
            .unwrap_or_else(|e| e.into_inner());
        *guard = false;
    }
}

impl Periph for SimDisk {
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
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cv.notify_one();
    }
}

enum DeviceCmd {
    Io(Bio, Ccb),
    Trim(TrimBatch),
    Stop,
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn arg(n: usize, default: u64) -> u64 {
    std::env::args()
        .nth(n)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn main() {
    println!("=== I/O Scheduler Simulation ===\n");

    let total = arg(1, 20_000);
    let trim_pct = arg(2, 10).min(100);
    let error_per_mille = arg(3, 2).min(1000);

    let config = IoSchedConfig::from_env();
    config.print();

    let disk = Arc::new(SimDisk::new(true));
    let devstat = Arc::new(DevStatCounters::new(config.block_size));
    let sched = match init_with_devstat(disk.clone(), devstat.clone(), config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("init failed: {}", e);
            std::process::exit(1);
        }
    };

    let mut sysctl = SysctlCtx::new();
    sched.sysctl_init(&mut sysctl, "dev.da.0");

    let done = Arc::new(DoneQueue::default());
    let finished = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let (dev_tx, dev_rx) = mpsc::channel::<DeviceCmd>();
    let (trim_tx, trim_rx) = mpsc::channel::<TrimBatch>();

    println!("\nBios: {}  trims: {}%  errors: {}/1000\n", total, trim_pct, error_per_mille);
    let start = Instant::now();

    // Device: completes commands after a seek-dependent delay.
    let device = {
        let done = Arc::clone(&done);
        let disk = Arc::clone(&disk);
        thread::spawn(move || {
            let mut rng = Lcg(0xd15c);
            let mut head = 0u64;
            while let Ok(cmd) = dev_rx.recv() {
                match cmd {
                    DeviceCmd::Io(bio, mut ccb) => {
                        let seek = head.abs_diff(bio.lba()) / 4096;
                        head = bio.end();
                        thread::sleep(Duration::from_micros(5 + seek.min(200)));
                        let status = if rng.next() % 1000 < error_per_mille {
                            CcbStatus::ScsiStatusError
                        } else {
                            CcbStatus::ReqCmp
                        };
                        ccb.complete(status);
                        let mut item = (bio, ccb);
                        while let Err(back) = done.post(item.0, item.1) {
                            item = back;
                            thread::yield_now();
                        }
                    }
                    DeviceCmd::Trim(batch) => {
                        thread::sleep(Duration::from_micros(20 + batch.len() as u64));
                        if trim_tx.send(batch).is_err() {
                            break;
                        }
                    }
                    DeviceCmd::Stop => break,
                }
                disk.schedule();
            }
        })
    };

    // Workload: a mix of sequential and random traffic.
    let workload = {
        let sched = Arc::clone(&sched);
        let finished = Arc::clone(&finished);
        let failed = Arc::clone(&failed);
        thread::spawn(move || {
            let mut rng = Lcg(0x5eed);
            let mut seq_lba = 0u64;
            for i in 0..total {
                let roll = rng.next() % 100;
                let lba = if roll % 2 == 0 {
                    seq_lba += 8;
                    seq_lba
                } else {
                    rng.next() % (1 << 24)
                };
                let cmd = if roll < trim_pct {
                    BioCmd::Delete
                } else if roll % 3 == 0 {
                    BioCmd::Write
                } else {
                    BioCmd::Read
                };
                let bio_finished = Arc::clone(&finished);
                let bio_failed = Arc::clone(&failed);
                let bio = Bio::new(cmd, lba, 8).on_done(move |b| {
                    if b.is_error() {
                        bio_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    bio_finished.fetch_add(1, Ordering::Relaxed);
                });
                sched.queue_work(bio);
                if i % 997 == 0 {
                    sched.queue_work(Bio::flush().on_done({
                        let finished = Arc::clone(&finished);
                        move |_| {
                            finished.fetch_add(1, Ordering::Relaxed);
                        }
                    }));
                }
                sched.schedule();
                if i % 64 == 0 {
                    thread::sleep(Duration::from_micros(50));
                }
            }
        })
    };
    let expected = total + total.div_ceil(997);

    // Dispatch loop
    let deadline = Duration::from_secs(60);
    let mut last_tick = Instant::now();
    let mut last_report = Instant::now();
    loop {
        disk.wait(Duration::from_millis(1));

        if last_tick.elapsed() >= Duration::from_millis(1) {
            sched.tick();
            last_tick = Instant::now();
        }

        complete_io(&sched, &done);
        while let Ok(batch) = trim_rx.try_recv() {
            for bio in sched.finish_trim(batch, None) {
                bio.done();
            }
            sched.trim_done();
        }

        while let Some(bio) = sched.next_bio() {
            if dev_tx.send(DeviceCmd::Io(bio, Ccb::issue())).is_err() {
                break;
            }
        }
        if let Some(mut batch) = sched.get_trim() {
            sched.submit_trim(&mut batch);
            if let Err(mpsc::SendError(DeviceCmd::Trim(batch))) = dev_tx.send(DeviceCmd::Trim(batch)) {
                sched.put_back_trim(batch);
            }
        }

        let n = finished.load(Ordering::Relaxed);
        if last_report.elapsed() >= Duration::from_millis(250) {
            print!("\rCompleted: {}/{}", n, expected);
            last_report = Instant::now();
        }
        if n >= expected && !sched.has_work() {
            break;
        }
        if start.elapsed() > deadline {
            kwarn!("timeout with {} of {} complete", n, expected);
            break;
        }
    }

    let _ = workload.join();
    let _ = dev_tx.send(DeviceCmd::Stop);
    let _ = device.join();
    complete_io(&sched, &done);
    while let Ok(batch) = trim_rx.try_recv() {
        sched.put_back_trim(batch);
    }
    let flushed = sched.flush(None, libc::ETIMEDOUT);

    let elapsed = start.elapsed();
    report(&sched, &devstat, &sysctl, elapsed, flushed, failed.load(Ordering::Relaxed));

    match Arc::try_unwrap(sched) {
        Ok(sched) => {
            if let Err(e) = sched.fini() {
                eprintln!("fini: {}", e);
                std::process::exit(1);
            }
        }
        Err(_) => kwarn!("scheduler still shared at exit"),
    }
}

fn complete_io(sched: &IoScheduler, done: &DoneQueue) {
    for (bio, res) in sched.drain_done(done) {
        if let Err(e) = res {
            kwarn!("completion rejected: {}", e);
        }
        bio.done();
    }
}

fn report(
    sched: &IoScheduler,
    devstat: &DevStatCounters,
    sysctl: &SysctlCtx,
    elapsed: Duration,
    flushed: usize,
    failed: u64,
) {
    let stats = sched.stats();
    println!("\n\n=== Results ===");
    println!("Elapsed:         {:?}", elapsed);
    println!("Dispatched:      {}", stats.counters.dispatched);
    println!("Completed:       {}", stats.counters.completed);
    println!("Trim batches:    {}", stats.counters.trim_batches);
    println!("Trims put back:  {}", stats.counters.trims_put_back);
    println!("Slow:            {}", stats.counters.slow_completions);
    println!("Failed:          {}", failed);
    println!("Flushed at exit: {}", flushed);
    println!(
        "Throughput:      {:.0} bios/sec",
        stats.counters.completed as f64 / elapsed.as_secs_f64()
    );

    println!("\n{:<6} {:>8} {:>8} {:>7} {:>12} {:>10}", "queue", "in", "out", "errors", "bytes", "ema");
    for cmd in BioCmd::iter() {
        let q = stats.queue(cmd);
        println!(
            "{:<6} {:>8} {:>8} {:>7} {:>12} {:>10?}",
            cmd.name(),
            q.total_in,
            q.total_out,
            q.errors,
            devstat.bytes(cmd),
            q.ema()
        );
    }

    println!("\nLatency histogram (reads):");
    let mut limit_us = iosched_core::constants::LAT_FIRST_BUCKET_US;
    for count in stats.queue(BioCmd::Read).latencies {
        if count > 0 {
            println!("  < {:>8} us: {}", limit_us, count);
        }
        limit_us = limit_us.saturating_mul(2);
    }

    if sched.has_work_flags(WorkFlags::IO | WorkFlags::TRIM) {
        kwarn!("work left behind: {:?}", sched.work_flags());
    }
    kinfo!("devstat busy at exit: {}", devstat.busy());

    println!("\nTunables:");
    for name in sysctl.names() {
        if let Ok(v) = sysctl.get(name) {
            println!("  {} = {}", name, v);
        }
    }
}
