//! Buffer-exhaustion recovery.
//!
//! When a buffer cannot hold the next emission, the writer thread runs the
//! hot-swap protocol: briefly quiesce writers (or, in lossless mode, rely on
//! atomic reservations), substitute every live buffer's pre-allocated standby
//! region, and hand the full regions to a background scheduler. The
//! scheduler replenishes standby regions and dispatches the detached regions
//! to a small bounded pool of writer threads that format them to
//! `..._exh_<N>.json` segments and free the memory.
//!
//! Lock order: exhaustion -> control -> buffers.

use crate::buffer::{BufferRef, EventBuffer, Region};
#[cfg(not(feature = "safer-lossless"))]
use crate::clock;
use crate::emit::MAX_RECORDS_PER_EMIT;
use crate::engine::Engine;
use crate::event::Event;
use crate::trace;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

/// Scheduler wake interval. A 4M-record buffer filling at ~8 ns/event
/// exhausts in roughly 32 ms, so 5 ms keeps standby regions replenished
/// ahead of the fastest writers.
const SCHEDULER_TICK: Duration = Duration::from_millis(5);

/// Bounded pool for the background segment writers. Spawning a detached
/// thread per exhaustion would let a pathological emit rate exhaust
/// thread-creation resources.
const WRITER_THREADS: usize = 2;

/// Counter reads used as a microsecond-scale wait for in-flight writers to
/// leave the emit path after the enabled flag drops.
#[cfg(not(feature = "safer-lossless"))]
const QUIESCE_READS: u32 = 2000;

/// Everything a background writer needs: the detached regions, the buffers
/// whose standby must be replenished, and the output parameters resolved at
/// swap time.
struct ExhaustedSet {
    regions: SmallVec<[(u64, Region); 8]>,
    replenish: SmallVec<[BufferRef; 8]>,
    /// `None` when the sink discards output; the regions are still freed.
    path: Option<PathBuf>,
    ticks_per_ns: f64,
    pid: u32,
}

pub(crate) struct Recovery {
    exhaustion: Mutex<()>,
    /// Exhaustion segments queued or being written; flush drains to zero.
    active: Arc<AtomicUsize>,
    sequence: AtomicU64,
    pending: Arc<Mutex<VecDeque<ExhaustedSet>>>,
    stop: Arc<AtomicBool>,
    scheduler: Option<JoinHandle<()>>,
    writers: Vec<JoinHandle<()>>,
}

impl Recovery {
    pub(crate) fn start(running: bool) -> Self {
        let active = Arc::new(AtomicUsize::new(0));
        let pending: Arc<Mutex<VecDeque<ExhaustedSet>>> = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let mut scheduler = None;
        let mut writers = Vec::new();

        if running {
            let (tx, rx) = mpsc::channel::<ExhaustedSet>();
            let rx = Arc::new(Mutex::new(rx));
            for i in 0..WRITER_THREADS {
                let rx = Arc::clone(&rx);
                let active = Arc::clone(&active);
                writers.push(
                    std::thread::Builder::new()
                        .name(format!("lop-exh-writer-{i}"))
                        .spawn(move || writer_loop(rx, active))
                        .expect("failed to spawn exhaustion writer thread"),
                );
            }
            let pending = Arc::clone(&pending);
            let active = Arc::clone(&active);
            let stop = Arc::clone(&stop);
            scheduler = Some(
                std::thread::Builder::new()
                    .name("lop-recovery".into())
                    .spawn(move || scheduler_loop(pending, tx, active, stop))
                    .expect("failed to spawn recovery scheduler thread"),
            );
        }

        Self {
            exhaustion: Mutex::new(()),
            active,
            sequence: AtomicU64::new(0),
            pending,
            stop,
            scheduler,
            writers,
        }
    }

    /// Block until every queued exhaustion segment has reached its writer
    /// and been written out.
    pub(crate) fn wait_idle(&self) {
        while self.active.load(Ordering::Acquire) > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
        // The writers exit once the scheduler drops the channel sender.
        for handle in self.writers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn scheduler_loop(
    pending: Arc<Mutex<VecDeque<ExhaustedSet>>>,
    tx: mpsc::Sender<ExhaustedSet>,
    active: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
) {
    loop {
        let drained: Vec<ExhaustedSet> = {
            let mut queue = pending.lock().unwrap();
            queue.drain(..).collect()
        };
        for set in drained {
            // Replenish first so the next exhaustion finds a standby even
            // while the segment is still being written.
            for bref in &set.replenish {
                bref.get().replenish_standby();
            }
            if tx.send(set).is_err() {
                // Writer pool is gone (shutdown); account for the dropped set.
                active.fetch_sub(1, Ordering::AcqRel);
            }
        }
        if stop.load(Ordering::Acquire) {
            break;
        }
        std::thread::sleep(SCHEDULER_TICK);
    }
}

fn writer_loop(rx: Arc<Mutex<mpsc::Receiver<ExhaustedSet>>>, active: Arc<AtomicUsize>) {
    loop {
        let received = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        let Ok(set) = received else { break };
        if let Some(ref path) = set.path {
            let snapshots: Vec<(u64, &[Event])> = set
                .regions
                .iter()
                .map(|(tid, region)| (*tid, region.events()))
                .collect();
            if let Err(err) = trace::write_trace(path, &snapshots, set.ticks_per_ns, set.pid) {
                eprintln!("lop: writing {} failed: {err}", path.display());
            }
        }
        // Dropping the set frees the detached regions.
        drop(set);
        active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run the hot-swap protocol for a buffer that cannot hold the next
/// emission. Called from the emit path with no locks held.
pub(crate) fn handle_exhausted(engine: &Engine, buffer: &EventBuffer) {
    let recovery = engine.recovery();

    #[cfg(not(feature = "safer-lossless"))]
    let _exhaustion = match recovery.exhaustion.try_lock() {
        Ok(guard) => guard,
        // Another thread is mid-recovery; this emission is dropped.
        Err(_) => return,
    };
    #[cfg(feature = "safer-lossless")]
    let _exhaustion = recovery.exhaustion.lock().unwrap();

    loop {
        let control = engine.control_lock();
        let buffers = engine.buffers_lock();

        // Another actor may have swapped the signaling buffer while we
        // waited on the locks.
        if buffer.has_room(MAX_RECORDS_PER_EMIT) {
            return;
        }

        if !buffer.has_standby() {
            if cfg!(feature = "safer-lossless") {
                // Lossless mode waits for the scheduler to replenish rather
                // than dropping records.
                drop(buffers);
                drop(control);
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            // Best-effort mode: the scheduler has not replenished since the
            // previous swap, so this emission is lost.
            return;
        }

        // Quiesce in-flight writers. With plain (non-atomic) reservations a
        // store into the outgoing region may still be in flight; dropping
        // the enabled flag and spinning a microsecond lets it land. Atomic
        // reservations (lossless) need no quiescence.
        #[cfg(not(feature = "safer-lossless"))]
        let was_enabled = {
            let was = engine.is_enabled();
            engine.set_enabled(false);
            for _ in 0..QUIESCE_READS {
                std::hint::black_box(clock::read_ticks());
            }
            was
        };

        let mut regions: SmallVec<[(u64, Region); 8]> = SmallVec::new();
        let mut replenish: SmallVec<[BufferRef; 8]> = SmallVec::new();
        for bref in buffers.iter() {
            let buf = bref.get();
            if let Some(region) = buf.swap_in_standby() {
                regions.push((buf.thread_id(), region));
                replenish.push(bref.clone());
            }
        }

        #[cfg(not(feature = "safer-lossless"))]
        engine.set_enabled(was_enabled);

        drop(buffers);

        // Anchor the new segment in wall time, mirroring the enable pair.
        // The swapped-in region has room, but the handler must never re-enter
        // itself while holding the locks.
        crate::emit::with_recovery_suppressed(|| {
            engine.emit_begin("lop_engine_recovery");
            let now = std::time::SystemTime::now();
            engine.emit_end_meta("lop_engine_recovery", crate::engine::unix_nanos(now));
        });

        let sequence = recovery.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let set = ExhaustedSet {
            regions,
            replenish,
            path: engine.exhausted_trace_path(sequence),
            ticks_per_ns: engine.ticks_per_ns(),
            pid: std::process::id(),
        };
        recovery.active.fetch_add(1, Ordering::AcqRel);
        recovery.pending.lock().unwrap().push_back(set);

        drop(control);
        return;
    }
}
