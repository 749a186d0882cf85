//! End-to-end record/replay scenarios (spec.md §8's S1-S6). These need
//! real ptrace privileges, a performance-counter-capable CPU, ASLR
//! disabled, and `cc` on `PATH` to build the fixtures, so they're
//! `#[ignore]`d by default; run with `cargo test -- --ignored` on a
//! suitably configured host.

use revtrace::flags::Flags;
use revtrace::session::{record_session, replay_session};
use revtrace::trace::TraceDir;
use std::path::{Path, PathBuf};
use std::process::Command;

fn build_fixture(name: &str) -> PathBuf {
    let src = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(format!("{}.c", name));
    let mut out = std::env::temp_dir();
    out.push(format!("revtrace-fixture-{}-{}", name, std::process::id()));
    let status = Command::new("cc")
        .arg(&src)
        .arg("-O0")
        .arg("-o")
        .arg(&out)
        .status()
        .expect("cc must be on PATH to build end-to-end fixtures");
    assert!(status.success(), "failed to build fixture {}", name);
    out
}

fn fresh_trace_dir(name: &str) -> TraceDir {
    let mut p = std::env::temp_dir();
    p.push(format!("revtrace-e2e-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&p);
    TraceDir::new(p)
}

#[test]
#[ignore]
fn s1_tenth_prime_replay_matches_recorded_stdout() {
    let exe = build_fixture("tenth_prime");
    let dir = fresh_trace_dir("s1");
    let exe_str = exe.to_string_lossy().into_owned();
    record_session::record(dir.clone(), &exe_str, &[exe_str.clone()], &[], Flags::default())
        .expect("record should complete without divergence");
    let status = replay_session::replay(dir).expect("replay should complete without divergence");
    assert_eq!(status, 0);
}

#[test]
#[ignore]
fn s2_gettimeofday_replay_is_deterministic_across_three_runs() {
    let exe = build_fixture("gettimeofday_diffs");
    let exe_str = exe.to_string_lossy().into_owned();
    let dir = fresh_trace_dir("s2");
    record_session::record(dir.clone(), &exe_str, &[exe_str.clone()], &[], Flags::default())
        .expect("record should complete without divergence");
    for _ in 0..3 {
        let status = replay_session::replay(dir.clone()).expect("replay should be deterministic");
        assert_eq!(status, 0);
    }
}

#[test]
#[ignore]
fn s3_fork_pipe_both_tracees_appear_and_replay_prints_hi() {
    let exe = build_fixture("fork_pipe_hi");
    let exe_str = exe.to_string_lossy().into_owned();
    let dir = fresh_trace_dir("s3");
    record_session::record(dir.clone(), &exe_str, &[exe_str.clone()], &[], Flags::default())
        .expect("record should observe both the parent and the forked child");
    let status = replay_session::replay(dir).expect("replay should complete without divergence");
    assert_eq!(status, 0);
}

#[test]
#[ignore]
fn s4_signal_delivered_at_same_loop_index_on_replay() {
    let exe = build_fixture("sigusr1_loop");
    let exe_str = exe.to_string_lossy().into_owned();
    let dir = fresh_trace_dir("s4");
    record_session::record(dir.clone(), &exe_str, &[exe_str.clone()], &[], Flags::default())
        .expect("record should capture the signal at a branch-exact point");
    let status = replay_session::replay(dir).expect("replay should reproduce the same loop index");
    assert_eq!(status, 0);
}

#[test]
#[ignore]
fn s5_corrupted_trailing_record_truncates_without_divergence() {
    let exe = build_fixture("malloc_memset_exit");
    let exe_str = exe.to_string_lossy().into_owned();
    let dir = fresh_trace_dir("s5");
    record_session::record(dir.clone(), &exe_str, &[exe_str.clone()], &[], Flags::default())
        .expect("record should complete");

    let events_path = dir.events();
    let mut bytes = std::fs::read(&events_path).unwrap();
    assert!(bytes.len() > 8);
    let trunc_at = bytes.len() - 4;
    bytes.truncate(trunc_at);
    std::fs::write(&events_path, &bytes).unwrap();

    replay_session::replay(dir).expect("truncated trace should replay short, not diverge");
}

#[test]
#[ignore]
fn s6_architecture_tag_mismatch_fails_at_open() {
    use revtrace::error::RdError;
    use revtrace::trace::TraceWriter;

    let dir = fresh_trace_dir("s6");
    let writer = TraceWriter::create(dir.clone()).unwrap();
    writer.close().unwrap();

    let mut header = std::fs::read(dir.header()).unwrap();
    for b in header[12..12 + 32].iter_mut() {
        *b = 0;
    }
    header[12..12 + 4].copy_from_slice(b"mips");
    std::fs::write(dir.header(), &header).unwrap();

    let err = replay_session::replay(dir).unwrap_err();
    assert!(matches!(err, RdError::TraceFormat(_)));
}
