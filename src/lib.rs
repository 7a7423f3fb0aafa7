//! Low-overhead in-process event tracing.
//!
//! `lop` records timestamped program events -- span begin/end, counters,
//! flow links -- into per-thread append-only buffers at a few nanoseconds
//! per event, then writes a Chrome-Trace-Event JSON file that Perfetto and
//! `chrome://tracing` load directly.
//!
//! The hot path never locks, blocks or allocates (past a thread's first
//! event): an emission gates on one atomic flag, resolves the calling
//! thread's buffer through a thread-local cache, reserves 1-3 record slots
//! and stores the fields, timestamping them from the hardware cycle counter.
//! Timestamps stay in raw ticks until flush, where a calibrated ratio
//! converts them to wall time.
//!
//! ```no_run
//! lop::enable();
//! lop::emit_begin("parse");
//! // ... work ...
//! lop::emit_end("parse");
//! lop::disable();
//! lop::flush(None);
//! ```
//!
//! Event names are `&'static str` because the engine stores the reference,
//! never the bytes; string constants are the intended currency.
//!
//! Set `LOP_DISABLE=1` in the environment to keep the engine dormant; every
//! call becomes a no-op and no file is written.
//!
//! The `safer` feature adds buffer-exhaustion recovery: a full buffer is
//! hot-swapped for a pre-allocated standby and flushed to an `exh_<N>`
//! segment in the background, so long sessions keep recording.
//! `safer-lossless` additionally makes reservations atomic so no event is
//! ever dropped, at a per-emit cost.

mod buffer;
mod clock;
mod emit;
mod engine;
mod event;
#[cfg(feature = "safer")]
mod recovery;
mod registry;
mod scope;
pub mod trace;

pub use clock::read_ticks;
pub use engine::{Config, Engine};
pub use event::{Event, EventKind};
pub use scope::{MetaScopedSpan, ScopedSpan};
pub use trace::TraceSink;

use std::sync::OnceLock;

/// The process-wide engine behind the free functions, constructed (and
/// calibrated) on first use.
fn global() -> &'static Engine {
    static ENGINE: OnceLock<Engine> = OnceLock::new();
    ENGINE.get_or_init(|| Engine::new(Config::from_env()))
}

/// Start recording. Emits the `lop_engine_enable` sentinel pair.
pub fn enable() {
    global().enable();
}

/// Stop recording. In-flight emissions on other threads complete normally.
pub fn disable() {
    global().disable();
}

/// Write the session's trace file. Must be called while disabled; a suffix
/// produces distinct files within one process session.
pub fn flush(suffix: Option<&str>) {
    global().flush(suffix);
}

/// Record the start of a span.
pub fn emit_begin(name: &'static str) {
    global().emit_begin(name);
}

/// Record the end of a span.
pub fn emit_end(name: &'static str) {
    global().emit_end(name);
}

/// End one span and begin the next for the cost of roughly one event.
pub fn emit_endbegin(end_name: &'static str, begin_name: &'static str) {
    global().emit_endbegin(end_name, begin_name);
}

/// Record a zero-width marker span.
pub fn emit_immediate(name: &'static str) {
    global().emit_immediate(name);
}

/// Span start carrying a 64-bit payload.
pub fn emit_begin_meta(name: &'static str, metadata: u64) {
    global().emit_begin_meta(name, metadata);
}

/// Span end carrying a 64-bit payload.
pub fn emit_end_meta(name: &'static str, metadata: u64) {
    global().emit_end_meta(name, metadata);
}

/// Zero-width marker span carrying a 64-bit payload.
pub fn emit_immediate_meta(name: &'static str, metadata: u64) {
    global().emit_immediate_meta(name, metadata);
}

/// Sample an integer counter.
pub fn emit_counter(name: &'static str, value: u64) {
    global().emit_counter(name, value);
}

/// Start of a flow link; viewers draw an arrow to the matching finish.
pub fn emit_flow_start(name: &'static str, flow_id: u64) {
    global().emit_flow_start(name, flow_id);
}

/// Finish of a flow link.
pub fn emit_flow_finish(name: &'static str, flow_id: u64) {
    global().emit_flow_finish(name, flow_id);
}
