//! Event-emission primitives.
//!
//! Every primitive has the same shape: gate on the enabled flag, resolve the
//! calling thread's buffer, bounds-check, reserve 1-3 slots, store the
//! fields, and stamp timestamps last from a single hardware counter read.
//! Nothing here blocks, allocates (past first touch) or performs I/O.

use crate::clock;
use crate::engine::Engine;
use crate::event::{Event, EventKind};

/// The widest emission reserves three records (flow start/finish).
#[cfg(feature = "safer")]
pub(crate) const MAX_RECORDS_PER_EMIT: usize = 3;

/// Synthesized offsets between the records of one compound emission. A
/// single counter read covers all records; the offsets keep viewers from
/// seeing ties or inversions within the group.
const ENDBEGIN_STEP: u64 = 1;
const FLOW_STEP: u64 = 5;
const IMMEDIATE_STEP: u64 = 10;

/// Store everything except the timestamp.
///
/// # Safety
/// `p` must point at a reserved, writable record slot.
#[inline(always)]
unsafe fn write_record(p: *mut Event, name: &'static str, metadata: u64, kind: EventKind) {
    unsafe {
        (*p).name = name;
        (*p).metadata = metadata;
        (*p).kind = kind;
    }
}

#[cfg(feature = "safer")]
thread_local! {
    /// Set while the controller emits its sentinels with the control lock
    /// held; the exhaustion handler would self-deadlock re-acquiring it, so
    /// those emissions drop instead of recovering. Checked only on the
    /// buffer-full cold path.
    static SUPPRESS_RECOVERY: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Run `f` with the exhaustion handler disarmed for this thread.
#[cfg(feature = "safer")]
pub(crate) fn with_recovery_suppressed<R>(f: impl FnOnce() -> R) -> R {
    SUPPRESS_RECOVERY.with(|c| c.set(true));
    let result = f();
    SUPPRESS_RECOVERY.with(|c| c.set(false));
    result
}

#[cfg(not(feature = "safer"))]
pub(crate) fn with_recovery_suppressed<R>(f: impl FnOnce() -> R) -> R {
    f()
}

impl Engine {
    /// Resolve and bounds-check, driving the exhaustion protocol of the
    /// active mode. `None` means this emission is dropped.
    #[inline]
    fn reserve(&self, n: usize) -> Option<*mut Event> {
        let buffer = self.buffer_for_current_thread()?;
        if !buffer.has_room(n) {
            if !cfg!(feature = "safer") {
                // Append-only semantics: a full buffer stops recording.
                return None;
            }
            #[cfg(feature = "safer")]
            {
                if SUPPRESS_RECOVERY.with(std::cell::Cell::get) {
                    return None;
                }
                crate::recovery::handle_exhausted(self, buffer);
            }
            if !cfg!(feature = "safer-lossless") {
                // Best-effort recovery swapped the region (or dropped the
                // duty to another thread); either way this emission is lost.
                return None;
            }
            // Lossless: the handler only returns once the swapped-in region
            // has room, so the reservation below cannot overrun.
        }
        Some(buffer.reserve(n))
    }

    /// Record the start of a span.
    #[inline]
    pub fn emit_begin(&self, name: &'static str) {
        if !self.is_enabled() {
            return;
        }
        let Some(p) = self.reserve(1) else { return };
        // SAFETY: `reserve` handed this thread exclusive ownership of the slot.
        unsafe {
            write_record(p, name, 0, EventKind::CallBegin);
            (*p).timestamp = clock::read_ticks();
        }
    }

    /// Record the end of a span.
    #[inline]
    pub fn emit_end(&self, name: &'static str) {
        if !self.is_enabled() {
            return;
        }
        let Some(p) = self.reserve(1) else { return };
        // SAFETY: as in emit_begin.
        unsafe {
            write_record(p, name, 0, EventKind::CallEnd);
            (*p).timestamp = clock::read_ticks();
        }
    }

    /// End one span and begin the next back-to-back -- a fast separator
    /// between adjacent regions for roughly the cost of a single event.
    #[inline]
    pub fn emit_endbegin(&self, end_name: &'static str, begin_name: &'static str) {
        if !self.is_enabled() {
            return;
        }
        let Some(p) = self.reserve(2) else { return };
        // SAFETY: two consecutive reserved slots.
        unsafe {
            let q = p.add(1);
            write_record(p, end_name, 0, EventKind::CallEnd);
            write_record(q, begin_name, 0, EventKind::CallBegin);
            let ts = clock::read_ticks();
            (*p).timestamp = ts;
            (*q).timestamp = ts + ENDBEGIN_STEP;
        }
    }

    /// Record a zero-width marker span.
    #[inline]
    pub fn emit_immediate(&self, name: &'static str) {
        if !self.is_enabled() {
            return;
        }
        let Some(p) = self.reserve(2) else { return };
        // SAFETY: two consecutive reserved slots.
        unsafe {
            let q = p.add(1);
            write_record(p, name, 0, EventKind::CallBegin);
            write_record(q, name, 0, EventKind::CallEnd);
            let ts = clock::read_ticks();
            (*p).timestamp = ts;
            (*q).timestamp = ts + IMMEDIATE_STEP;
        }
    }

    /// Span start with a 64-bit payload shown in the viewer.
    #[inline]
    pub fn emit_begin_meta(&self, name: &'static str, metadata: u64) {
        if !self.is_enabled() {
            return;
        }
        let Some(p) = self.reserve(1) else { return };
        // SAFETY: as in emit_begin.
        unsafe {
            write_record(p, name, metadata, EventKind::CallBeginMeta);
            (*p).timestamp = clock::read_ticks();
        }
    }

    /// Span end with a 64-bit payload shown in the viewer.
    #[inline]
    pub fn emit_end_meta(&self, name: &'static str, metadata: u64) {
        if !self.is_enabled() {
            return;
        }
        let Some(p) = self.reserve(1) else { return };
        // SAFETY: as in emit_begin.
        unsafe {
            write_record(p, name, metadata, EventKind::CallEndMeta);
            (*p).timestamp = clock::read_ticks();
        }
    }

    /// Zero-width marker span carrying a payload on both records.
    #[inline]
    pub fn emit_immediate_meta(&self, name: &'static str, metadata: u64) {
        if !self.is_enabled() {
            return;
        }
        let Some(p) = self.reserve(2) else { return };
        // SAFETY: two consecutive reserved slots.
        unsafe {
            let q = p.add(1);
            write_record(p, name, metadata, EventKind::CallBeginMeta);
            write_record(q, name, metadata, EventKind::CallEndMeta);
            let ts = clock::read_ticks();
            (*p).timestamp = ts;
            (*q).timestamp = ts + IMMEDIATE_STEP;
        }
    }

    /// Sample an integer counter; viewers render these as a time series.
    #[inline]
    pub fn emit_counter(&self, name: &'static str, value: u64) {
        if !self.is_enabled() {
            return;
        }
        let Some(p) = self.reserve(1) else { return };
        // SAFETY: as in emit_begin.
        unsafe {
            write_record(p, name, value, EventKind::CounterInt);
            (*p).timestamp = clock::read_ticks();
        }
    }

    /// Start of a flow link. Wraps the flow record in a zero-width meta span
    /// so the arrow has a visible anchor on the emitting thread's track.
    #[inline]
    pub fn emit_flow_start(&self, name: &'static str, flow_id: u64) {
        self.emit_flow(name, flow_id, EventKind::FlowStart);
    }

    /// Finish of a flow link; the mirror of [`Engine::emit_flow_start`].
    #[inline]
    pub fn emit_flow_finish(&self, name: &'static str, flow_id: u64) {
        self.emit_flow(name, flow_id, EventKind::FlowFinish);
    }

    #[inline]
    fn emit_flow(&self, name: &'static str, flow_id: u64, kind: EventKind) {
        if !self.is_enabled() {
            return;
        }
        let Some(p) = self.reserve(3) else { return };
        // SAFETY: three consecutive reserved slots.
        unsafe {
            let q = p.add(1);
            let r = p.add(2);
            write_record(p, name, flow_id, EventKind::CallBeginMeta);
            write_record(q, name, flow_id, EventKind::CallEndMeta);
            write_record(r, name, flow_id, kind);
            let ts = clock::read_ticks();
            (*p).timestamp = ts;
            (*q).timestamp = ts + FLOW_STEP;
            (*r).timestamp = ts + FLOW_STEP + FLOW_STEP;
        }
    }
}
