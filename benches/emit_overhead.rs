//! Per-event emit overhead. The engine's whole reason to exist is a
//! single-digit-nanosecond hot path, so regressions here matter more than
//! anywhere else.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use lop::{Config, Engine, TraceSink};
use std::time::{Duration, Instant};

/// Record slots per timed chunk; each chunk gets a fresh engine so the bench
/// never measures the buffer-full path.
const CHUNK: usize = 1 << 20;

fn bench_engine(capacity: usize) -> Engine {
    Engine::new(Config {
        capacity,
        calibration: Duration::from_millis(2),
        sink: TraceSink::Discard,
        disabled: false,
    })
}

/// Time `iters` calls of `emit`, re-arming a fresh engine between chunks so
/// setup, calibration and teardown stay outside the measurement.
fn timed_chunks(iters: u64, records_per_call: usize, emit: impl Fn(&Engine)) -> Duration {
    let calls_per_chunk = (CHUNK / records_per_call) as u64;
    let mut total = Duration::ZERO;
    let mut remaining = iters;
    while remaining > 0 {
        let engine = bench_engine(CHUNK + 16);
        engine.enable();
        let calls = remaining.min(calls_per_chunk);
        let start = Instant::now();
        for _ in 0..calls {
            emit(&engine);
        }
        total += start.elapsed();
        remaining -= calls;
        engine.disable();
    }
    total
}

fn bench_emit(c: &mut Criterion) {
    c.bench_function("emit_begin", |b| {
        b.iter_custom(|iters| timed_chunks(iters, 1, |e| e.emit_begin(black_box("bench_span"))));
    });

    c.bench_function("emit_endbegin", |b| {
        b.iter_custom(|iters| {
            timed_chunks(iters, 2, |e| {
                e.emit_endbegin(black_box("bench_prev"), black_box("bench_next"))
            })
        });
    });

    c.bench_function("emit_counter", |b| {
        b.iter_custom(|iters| {
            timed_chunks(iters, 1, |e| e.emit_counter(black_box("bench_val"), 42))
        });
    });

    c.bench_function("emit_flow_start", |b| {
        b.iter_custom(|iters| {
            timed_chunks(iters, 3, |e| e.emit_flow_start(black_box("bench_flow"), 7))
        });
    });

    c.bench_function("emit_begin_disabled", |b| {
        let engine = bench_engine(1024);
        b.iter(|| engine.emit_begin(black_box("bench_span")));
    });
}

criterion_group!(benches, bench_emit);
criterion_main!(benches);
