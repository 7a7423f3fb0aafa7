//! Hardware-tick timebase.
//!
//! `read_ticks()` returns raw counter ticks (TSC on x86_64, CNTVCT on
//! aarch64). Raw ticks are what land in event records; the calibrated
//! ticks-per-nanosecond ratio converts them to wall time at flush, never on
//! the emit path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Read the hardware cycle counter. A single unserialized instruction on the
/// supported architectures; anything else falls back to a monotonic clock
/// read and loses the performance edge, not correctness.
#[inline(always)]
pub fn read_ticks() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(target_arch = "aarch64")]
    {
        let val: u64;
        // SAFETY: CNTVCT_EL0 is readable from user mode on every aarch64
        // platform this crate targets.
        unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) val) };
        val
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        use std::sync::OnceLock;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

/// Calibrated tick-to-nanosecond ratio.
///
/// Stored as `f64` bits in an atomic so the flush path and the background
/// exhaustion writers read it without a lock.
pub(crate) struct Timebase {
    ticks_per_ns: AtomicU64,
}

impl Timebase {
    /// Measure the counter rate against the wall clock over `interval`.
    ///
    /// The startup estimate is deliberately short; for sessions longer than a
    /// second, [`Timebase::refine`] replaces it with a ratio derived from the
    /// whole enable-to-disable interval, which averages out the measurement
    /// overhead.
    pub(crate) fn calibrate(interval: Duration) -> Self {
        let wall_start = Instant::now();
        let tsc_start = read_ticks();
        std::thread::sleep(interval);
        let tsc_end = read_ticks();
        let wall_ns = wall_start.elapsed().as_nanos() as f64;

        let ticks = tsc_end.wrapping_sub(tsc_start) as f64;
        // A counter that did not advance (frozen TSC under a broken
        // hypervisor) degrades to a 1:1 ratio instead of dividing by zero.
        let ratio = if ticks > 0.0 && wall_ns > 0.0 {
            ticks / wall_ns
        } else {
            1.0
        };
        Self {
            ticks_per_ns: AtomicU64::new(ratio.to_bits()),
        }
    }

    /// A timebase that never calibrated; used when the engine is dormant.
    pub(crate) fn dormant() -> Self {
        Self {
            ticks_per_ns: AtomicU64::new(1f64.to_bits()),
        }
    }

    pub(crate) fn ticks_per_ns(&self) -> f64 {
        f64::from_bits(self.ticks_per_ns.load(Ordering::Relaxed))
    }

    /// Re-derive the ratio from a measured session interval.
    pub(crate) fn refine(&self, ticks: u64, wall_ns: u64) {
        if ticks == 0 || wall_ns == 0 {
            return;
        }
        let ratio = ticks as f64 / wall_ns as f64;
        self.ticks_per_ns.store(ratio.to_bits(), Ordering::Relaxed);
    }
}
