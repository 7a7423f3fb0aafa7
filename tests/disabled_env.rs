//! `LOP_DISABLE=1` keeps the process global engine dormant: every call is a
//! no-op and no file is ever written. Lives in its own test binary so the
//! variable is set before anything constructs the engine.

#[test]
fn disable_env_makes_every_operation_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    // SAFETY: nothing else in this single-test binary reads the environment
    // concurrently.
    unsafe { std::env::set_var("LOP_DISABLE", "1") };

    lop::enable();
    lop::emit_begin("x");
    lop::emit_counter("c", 1);
    lop::disable();
    lop::flush(None);

    let files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(files, 0, "a dormant engine must not write a trace file");
}
