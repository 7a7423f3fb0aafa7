//! Chrome Trace Event JSON output and read-back.
//!
//! The formatter is a pure function over a snapshotted buffer set: it
//! converts raw tick timestamps to microseconds using the calibrated ratio,
//! patches each record's thread id from its buffer, and streams one JSON
//! object per record. Counter events are sorted globally by timestamp and
//! emitted after the span events -- Chrome-compatible viewers glitch on
//! unsorted counters, and the sort is stable so ties keep emission order.

use crate::event::{Event, EventKind};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Where flushed traces go.
#[derive(Debug, Clone)]
pub enum TraceSink {
    /// Write `events_pid<PID>_ts<US>[_<suffix>].json` files into a directory.
    Directory(PathBuf),
    /// Drop every snapshot. Useful for measuring emit overhead without I/O.
    Discard,
}

impl Default for TraceSink {
    fn default() -> Self {
        TraceSink::Directory(PathBuf::from("."))
    }
}

/// Build the output file name. `/` and `\` in the assembled name (a suffix
/// can contain anything) are flattened to `_` so the file always lands in
/// `dir` itself.
pub(crate) fn trace_file_path(
    dir: &Path,
    pid: u32,
    duration_us: u64,
    suffix: Option<&str>,
) -> PathBuf {
    let name = match suffix {
        Some(suffix) => format!("events_pid{pid}_ts{duration_us}_{suffix}.json"),
        None => format!("events_pid{pid}_ts{duration_us}.json"),
    };
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    dir.join(cleaned)
}

/// One Chrome Trace Event object. Absent fields are omitted from the JSON,
/// so the same shape serves spans, flows and counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Thread id as a hex string; counters carry none.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tid: Option<String>,
    pub pid: u32,
    /// Microseconds, with nanosecond precision in the fractional part.
    pub ts: f64,
    pub name: String,
    pub ph: String,
    /// Flow binding point; always `"e"` on flow records.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bp: Option<String>,
    /// Flow id, truncated to the 32 bits Perfetto's UI supports.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub args: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct TraceDocument {
    /// Always `"ns"`; carried through the parse for completeness.
    #[serde(rename = "displayTimeUnit")]
    #[allow(dead_code)]
    display_time_unit: String,
    #[serde(rename = "traceEvents")]
    trace_events: Vec<TraceEntry>,
}

fn ticks_to_ns(timestamp: u64, tsc_base: u64, ticks_per_ns: f64) -> u64 {
    (timestamp.saturating_sub(tsc_base) as f64 / ticks_per_ns) as u64
}

/// Microseconds with three sub-microsecond digits, as viewers expect.
fn ts_micros(time_ns: u64) -> f64 {
    (time_ns / 1000) as f64 + (time_ns % 1000) as f64 / 1000.0
}

fn entry_for(event: &Event, thread_id: u64, time_ns: u64, pid: u32) -> TraceEntry {
    let ts = ts_micros(time_ns);
    let tid = Some(format!("{thread_id:x}"));
    match event.kind {
        EventKind::CallBegin | EventKind::CallEnd => TraceEntry {
            tid,
            pid,
            ts,
            name: event.name.to_owned(),
            ph: if event.kind == EventKind::CallBegin { "B" } else { "E" }.to_owned(),
            bp: None,
            id: None,
            args: None,
        },
        EventKind::CallBeginMeta | EventKind::CallEndMeta => {
            let begin = event.kind == EventKind::CallBeginMeta;
            let meta = format!("{:x}", event.metadata);
            let args = if begin {
                serde_json::json!({ "b_meta": meta })
            } else {
                serde_json::json!({ "e_meta": meta })
            };
            TraceEntry {
                tid,
                pid,
                ts,
                name: event.name.to_owned(),
                ph: if begin { "B" } else { "E" }.to_owned(),
                bp: None,
                id: None,
                args: Some(args),
            }
        }
        EventKind::FlowStart | EventKind::FlowFinish => TraceEntry {
            tid,
            pid,
            ts,
            name: "flow".to_owned(),
            ph: if event.kind == EventKind::FlowStart { "s" } else { "f" }.to_owned(),
            bp: Some("e".to_owned()),
            id: Some(event.metadata as u32),
            args: Some(serde_json::json!({ "flow_id": format!("{:x}", event.metadata) })),
        },
        EventKind::CounterInt => TraceEntry {
            tid: None,
            pid,
            ts,
            name: event.name.to_owned(),
            ph: "C".to_owned(),
            bp: None,
            id: None,
            args: Some(serde_json::json!({ "val": event.metadata })),
        },
    }
}

/// Write a snapshot set as a Chrome Trace Event document.
///
/// `snapshots` pairs each buffer's thread id with its recorded events.
pub(crate) fn write_trace(
    path: &Path,
    snapshots: &[(u64, &[Event])],
    ticks_per_ns: f64,
    pid: u32,
) -> std::io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(b"{\"displayTimeUnit\":\"ns\",\"traceEvents\":[")?;

    // Trace time starts at the earliest event.
    let tsc_base = snapshots
        .iter()
        .flat_map(|(_, events)| events.iter())
        .map(|e| e.timestamp)
        .min()
        .unwrap_or(0);

    let mut first = true;
    let mut write_entry = |w: &mut BufWriter<File>, entry: &TraceEntry| -> std::io::Result<()> {
        if !first {
            w.write_all(b",")?;
        }
        first = false;
        serde_json::to_writer(&mut *w, entry)?;
        Ok(())
    };

    let mut counters: Vec<&Event> = Vec::new();
    for (thread_id, events) in snapshots {
        for event in *events {
            if event.kind == EventKind::CounterInt {
                counters.push(event);
                continue;
            }
            let time_ns = ticks_to_ns(event.timestamp, tsc_base, ticks_per_ns);
            write_entry(&mut w, &entry_for(event, *thread_id, time_ns, pid))?;
        }
    }

    counters.sort_by_key(|e| e.timestamp);
    for event in counters {
        let time_ns = ticks_to_ns(event.timestamp, tsc_base, ticks_per_ns);
        write_entry(&mut w, &entry_for(event, 0, time_ns, pid))?;
    }

    w.write_all(b"]}")?;
    w.flush()
}

/// Read a written trace file back into its entries.
///
/// The inverse of what the flush path writes; scenario tests use it to close
/// the write/read loop.
pub fn read_trace(path: &Path) -> std::io::Result<Vec<TraceEntry>> {
    let doc: TraceDocument = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    Ok(doc.trace_events)
}
