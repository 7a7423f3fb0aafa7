//! Engine state and lifecycle controller.
//!
//! One [`Engine`] owns the registry, the live-buffer list, the timebase and
//! (with the `safer` feature) the recovery scheduler. The crate-level free
//! functions forward to a lazily initialized process-wide instance; embedded
//! and test callers construct their own with a small [`Config`].
//!
//! Lock order everywhere: exhaustion -> control -> buffers.

use crate::buffer::BufferRef;
use crate::buffer::EventBuffer;
use crate::clock::{self, Timebase};
use crate::event::Event;
use crate::registry::Registry;
use crate::trace::{self, TraceSink};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
#[cfg(feature = "safer")]
use std::sync::MutexGuard;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Engine tunables. The global engine uses the defaults plus the
/// environment; tests construct engines with tiny capacities and a short
/// calibration spin.
#[derive(Debug, Clone)]
pub struct Config {
    /// Records per per-thread buffer.
    pub capacity: usize,
    /// Wall-clock interval of the startup tick-rate calibration.
    pub calibration: Duration,
    /// Where flushed traces go.
    pub sink: TraceSink,
    /// When true the engine stays dormant and every operation is a no-op.
    pub disabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: 1 << 22,
            calibration: Duration::from_millis(200),
            sink: TraceSink::default(),
            disabled: false,
        }
    }
}

impl Config {
    /// Defaults plus the single recognized environment option:
    /// `LOP_DISABLE=1` leaves the engine dormant.
    pub fn from_env() -> Self {
        Self {
            disabled: std::env::var("LOP_DISABLE").is_ok_and(|v| v == "1"),
            ..Self::default()
        }
    }
}

/// Wall-clock/tick pair captured at enable, published lock-free so the flush
/// path and background exhaustion writers can anchor their output without
/// taking the control lock.
pub(crate) struct SessionAnchor {
    pub(crate) time_enable: SystemTime,
    pub(crate) tsc_enable: u64,
}

pub(crate) fn unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

static NEXT_ENGINE_KEY: AtomicUsize = AtomicUsize::new(1);

pub struct Engine {
    /// Process-unique id keying the per-thread resolution cache.
    key: usize,
    /// False when `LOP_DISABLE=1` made the engine dormant at construction.
    running: bool,
    enabled: AtomicBool,
    flushed: AtomicBool,
    timebase: Timebase,
    registry: Registry,
    anchor: ArcSwap<Option<SessionAnchor>>,
    tsc_disable: AtomicU64,
    time_disable: Mutex<Option<SystemTime>>,
    /// Live per-thread buffers in creation order. The pointers stay valid
    /// for the engine's lifetime; the registry owns the slots.
    buffers: Mutex<Vec<BufferRef>>,
    /// Serializes enable/disable/flush against each other and against the
    /// recovery hot-swap.
    control: Mutex<()>,
    config: Config,
    #[cfg(feature = "safer")]
    recovery: crate::recovery::Recovery,
}

impl Engine {
    /// Construct an engine and calibrate its timebase.
    ///
    /// Calibration sleeps for `config.calibration` (200 ms by default), so
    /// construct once, early. A dormant engine (`config.disabled`) skips
    /// calibration and ignores every subsequent call.
    pub fn new(config: Config) -> Self {
        let running = !config.disabled;
        let timebase = if running {
            Timebase::calibrate(config.calibration)
        } else {
            Timebase::dormant()
        };
        Self {
            key: NEXT_ENGINE_KEY.fetch_add(1, Ordering::Relaxed),
            running,
            enabled: AtomicBool::new(false),
            // A never-enabled engine has nothing to flush.
            flushed: AtomicBool::new(true),
            timebase,
            registry: Registry::new(),
            anchor: ArcSwap::from_pointee(None),
            tsc_disable: AtomicU64::new(0),
            time_disable: Mutex::new(None),
            buffers: Mutex::new(Vec::new()),
            control: Mutex::new(()),
            config,
            #[cfg(feature = "safer")]
            recovery: crate::recovery::Recovery::start(running),
        }
    }

    #[inline]
    pub(crate) fn is_enabled(&self) -> bool {
        // Relaxed is enough: a racing transition at most drops or spuriously
        // records a handful of events around enable/disable.
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    /// Resolve the calling thread's buffer, allocating and registering it on
    /// first touch.
    #[inline]
    pub(crate) fn buffer_for_current_thread(&self) -> Option<&EventBuffer> {
        self.registry.resolve(self.key, self.config.capacity, |buffer| {
            self.buffers.lock().unwrap().push(BufferRef::new(buffer));
        })
    }

    pub(crate) fn ticks_per_ns(&self) -> f64 {
        self.timebase.ticks_per_ns()
    }

    #[cfg(feature = "safer")]
    pub(crate) fn recovery(&self) -> &crate::recovery::Recovery {
        &self.recovery
    }

    #[cfg(feature = "safer")]
    pub(crate) fn control_lock(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap()
    }

    #[cfg(feature = "safer")]
    pub(crate) fn buffers_lock(&self) -> MutexGuard<'_, Vec<BufferRef>> {
        self.buffers.lock().unwrap()
    }

    /// Output path for an exhausted-buffer segment, stamped with the wall
    /// time elapsed since enable.
    #[cfg(feature = "safer")]
    pub(crate) fn exhausted_trace_path(&self, sequence: u64) -> Option<std::path::PathBuf> {
        let TraceSink::Directory(ref dir) = self.config.sink else {
            return None;
        };
        let elapsed_us = match **self.anchor.load() {
            Some(ref anchor) => SystemTime::now()
                .duration_since(anchor.time_enable)
                .unwrap_or_default()
                .as_micros() as u64,
            None => 0,
        };
        Some(trace::trace_file_path(
            dir,
            std::process::id(),
            elapsed_us,
            Some(&format!("exh_{sequence}")),
        ))
    }

    /// Transition to the active state. No-op when dormant or already
    /// enabled. Emits the `lop_engine_enable` sentinel pair whose end record
    /// carries the Unix-epoch nanoseconds, anchoring the trace in wall time.
    pub fn enable(&self) {
        if !self.running {
            return;
        }
        let _control = self.control.lock().unwrap();
        if self.enabled.load(Ordering::Relaxed) {
            return;
        }
        self.flushed.store(false, Ordering::Relaxed);
        self.enabled.store(true, Ordering::Relaxed);

        // The sentinels are emitted with the control lock held, so the
        // exhaustion handler stays disarmed for them.
        crate::emit::with_recovery_suppressed(|| {
            self.emit_begin("lop_engine_enable");
            let time_enable = SystemTime::now();
            let tsc_enable = clock::read_ticks();
            self.anchor.store(Arc::new(Some(SessionAnchor {
                time_enable,
                tsc_enable,
            })));
            self.emit_end_meta("lop_engine_enable", unix_nanos(time_enable));
        });
    }

    /// Leave the active state. Writers are not quiesced: an in-flight emit
    /// that already passed the gate completes normally.
    pub fn disable(&self) {
        if !self.running {
            return;
        }
        let _control = self.control.lock().unwrap();
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        crate::emit::with_recovery_suppressed(|| {
            self.emit_begin("lop_engine_disable");
            let tsc_disable = clock::read_ticks();
            let time_disable = SystemTime::now();
            self.tsc_disable.store(tsc_disable, Ordering::Relaxed);
            *self.time_disable.lock().unwrap() = Some(time_disable);
            self.emit_end_meta("lop_engine_disable", unix_nanos(time_disable));
        });
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Snapshot every live buffer, write the trace file, rewind the cursors.
    ///
    /// Refuses while enabled and refuses to run twice without an intervening
    /// session. Waits for background exhaustion flushes to drain, so when
    /// this returns every file of the session is on disk.
    pub fn flush(&self, suffix: Option<&str>) {
        if !self.running {
            return;
        }
        let _control = self.control.lock().unwrap();
        if self.enabled.load(Ordering::Relaxed) {
            eprintln!("lop: flush called while enabled; doing nothing");
            return;
        }
        if self.flushed.load(Ordering::Relaxed) {
            eprintln!("lop: flush called on an already flushed engine; doing nothing");
            return;
        }

        // Let in-flight exhaustion segments reach disk before the main file.
        #[cfg(feature = "safer")]
        self.recovery.wait_idle();

        let snapshots: Vec<(u64, Vec<Event>)> = {
            let buffers = self.buffers.lock().unwrap();
            buffers
                .iter()
                .map(|b| {
                    let buffer = b.get();
                    let events = buffer.copy_events();
                    buffer.reset();
                    (buffer.thread_id(), events)
                })
                .collect()
        };

        let total: usize = snapshots.iter().map(|(_, events)| events.len()).sum();
        if total > 0 {
            let session_ns = self.session_wall_ns();
            if session_ns > 1_000_000_000 {
                // A session this long is a better frequency baseline than
                // the startup calibration spin. An empty session leaves the
                // calibrated ratio untouched.
                let anchor = self.anchor.load();
                if let Some(ref anchor) = **anchor {
                    let ticks = self
                        .tsc_disable
                        .load(Ordering::Relaxed)
                        .wrapping_sub(anchor.tsc_enable);
                    self.timebase.refine(ticks, session_ns);
                }
            }

            if let TraceSink::Directory(ref dir) = self.config.sink {
                let path = trace::trace_file_path(
                    dir,
                    std::process::id(),
                    session_ns / 1000,
                    suffix,
                );
                let borrowed: Vec<(u64, &[Event])> = snapshots
                    .iter()
                    .map(|(tid, events)| (*tid, events.as_slice()))
                    .collect();
                if let Err(err) =
                    trace::write_trace(&path, &borrowed, self.timebase.ticks_per_ns(), std::process::id())
                {
                    eprintln!("lop: writing {} failed: {err}", path.display());
                }
            }
        }

        self.flushed.store(true, Ordering::Relaxed);
    }

    /// Wall-clock length of the last enable..disable interval, zero when the
    /// engine never completed a session.
    fn session_wall_ns(&self) -> u64 {
        let anchor = self.anchor.load();
        let Some(ref anchor) = **anchor else {
            return 0;
        };
        let Some(time_disable) = *self.time_disable.lock().unwrap() else {
            return 0;
        };
        time_disable
            .duration_since(anchor.time_enable)
            .unwrap_or_default()
            .as_nanos() as u64
    }

    /// Records currently sitting in the calling thread's buffer.
    #[cfg(test)]
    pub(crate) fn events_for_current_thread(&self) -> Vec<Event> {
        self.buffer_for_current_thread()
            .map(|b| b.copy_events())
            .unwrap_or_default()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Exclusive access here means no thread still holds a borrow, so no
        // emit can race the teardown.
        if self.running {
            self.disable();
            if !self.flushed.load(Ordering::Relaxed) {
                self.flush(None);
            }
        }
        #[cfg(feature = "safer")]
        self.recovery.shutdown();
    }
}

/// Small, quiet configuration shared by the unit tests across modules.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        capacity: 4096,
        calibration: Duration::from_millis(2),
        sink: TraceSink::Discard,
        disabled: false,
    }
}
