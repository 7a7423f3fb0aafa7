use lop::trace::TraceEntry;
use lop::{Config, Engine, TraceSink};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// An engine with a small buffer and fast calibration, writing into `dir`.
#[allow(dead_code)]
pub fn test_engine(dir: &Path) -> Engine {
    engine_with_capacity(dir, 4096)
}

#[allow(dead_code)]
pub fn engine_with_capacity(dir: &Path, capacity: usize) -> Engine {
    Engine::new(Config {
        capacity,
        calibration: Duration::from_millis(5),
        sink: TraceSink::Directory(dir.to_path_buf()),
        disabled: false,
    })
}

/// All trace files written into `dir`, sorted by name.
#[allow(dead_code)]
pub fn trace_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

/// Read the single trace file a simple session produced.
#[allow(dead_code)]
pub fn read_single_trace(dir: &Path) -> Vec<TraceEntry> {
    let files = trace_files(dir);
    assert_eq!(files.len(), 1, "expected exactly one trace file: {files:?}");
    lop::trace::read_trace(&files[0]).unwrap()
}

/// Entries minus the engine's own enable/disable/recovery sentinels.
#[allow(dead_code)]
pub fn user_entries(entries: &[TraceEntry]) -> Vec<TraceEntry> {
    entries
        .iter()
        .filter(|e| !e.name.starts_with("lop_engine_"))
        .cloned()
        .collect()
}
