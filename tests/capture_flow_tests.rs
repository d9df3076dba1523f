//! End-to-end capture flows through the public engine API.
//!
//! These tests drive both syscall edges against the preset programs and a
//! sparse in-process memory image, checking the full pipeline: admission,
//! snapshot correlation, program execution, framing and the sink.

use sondear::arch::RegisterFile;
use sondear::capture::{trace_everything, Disposition, SyscallCapture};
use sondear::event::{EventKind, TaskContext};
use sondear::filter::{ArgAction, ArgRule, FilterConfig, TraceMode};
use sondear::memory::SparseMemory;
use sondear::presets::default_store;
use sondear::sink::{EventSink, VecSink};
use sondear::syscalls::{NR_EXECVE, NR_OPENAT, NR_READ};
use std::sync::Arc;

fn engine(filter: FilterConfig) -> (SyscallCapture, Arc<VecSink>) {
    let sink = Arc::new(VecSink::new());
    let capture = SyscallCapture::new(
        Arc::new(default_store().unwrap()),
        Arc::new(filter),
        Arc::clone(&sink) as Arc<dyn EventSink>,
    )
    .with_predicate(trace_everything());
    (capture, sink)
}

fn openat_regs(path_ptr: u64) -> RegisterFile {
    let mut regs = RegisterFile::default();
    regs.regs[0] = u64::MAX - 99;
    regs.regs[1] = path_ptr;
    regs.regs[2] = 0;
    regs.regs[30] = 0xface;
    regs.pc = 0x1000;
    regs.sp = 0x2000;
    regs
}

fn hosts_memory() -> SparseMemory {
    let mut mem = SparseMemory::new();
    mem.map_str(0x4000, "/etc/hosts");
    mem
}

#[test]
fn test_openat_round_trip_produces_paired_events() {
    let (capture, sink) = engine(FilterConfig::default());
    let mem = hosts_memory();
    let task = TaskContext::new(42, 42);
    let enter_regs = openat_regs(0x4000);

    assert_eq!(
        capture.on_sys_enter(&task, NR_OPENAT, &enter_regs, &mem).unwrap(),
        Disposition::Captured
    );
    let mut exit_regs = enter_regs;
    exit_regs.regs[0] = 3;
    assert_eq!(
        capture.on_sys_exit(&task, NR_OPENAT, &exit_regs, &mem).unwrap(),
        Disposition::Captured
    );

    let events = sink.take();
    assert_eq!(events.len(), 2);

    let enter = &events[0];
    assert_eq!(enter.kind, EventKind::SyscallEnter);
    let fields = enter.buffer.fields();
    assert_eq!(fields[0], (0u8, &NR_OPENAT.to_le_bytes()[..]));
    assert_eq!(fields[1], (1u8, &0xfaceu64.to_le_bytes()[..]));
    assert_eq!(fields[2], (2u8, &0x1000u64.to_le_bytes()[..]));
    assert_eq!(fields[3], (3u8, &0x2000u64.to_le_bytes()[..]));
    assert_eq!(fields[4], (4u8, &(u64::MAX - 99).to_le_bytes()[..]));
    assert_eq!(fields[5], (5u8, &b"/etc/hosts\0"[..]));

    let exit = &events[1];
    assert_eq!(exit.kind, EventKind::SyscallExit);
    let fields = exit.buffer.fields();
    assert_eq!(fields[0], (0u8, &NR_OPENAT.to_le_bytes()[..]));
    assert_eq!(fields[1], (1u8, &3u64.to_le_bytes()[..]));
    assert!(capture.snapshots().is_empty());
}

#[test]
fn test_read_exit_clamps_buffer_to_short_return() {
    let (capture, sink) = engine(FilterConfig::default());
    let mut mem = SparseMemory::new();
    mem.map_bytes(0x6000, &[0x61; 128]);
    let task = TaskContext::new(7, 7);

    let mut enter_regs = RegisterFile::default();
    enter_regs.regs[0] = 3;
    enter_regs.regs[1] = 0x6000;
    enter_regs.regs[2] = 64;
    capture.on_sys_enter(&task, NR_READ, &enter_regs, &mem).unwrap();

    let mut exit_regs = enter_regs;
    exit_regs.regs[0] = 10; // short read
    capture.on_sys_exit(&task, NR_READ, &exit_regs, &mem).unwrap();

    let events = sink.take();
    let exit = &events[1];
    let fields = exit.buffer.fields();
    // slot 0 number, slot 1 raw return, slot 2 clamped payload
    assert_eq!(fields[1], (1u8, &10u64.to_le_bytes()[..]));
    assert_eq!(fields[2].0, 2u8);
    assert_eq!(fields[2].1, &[0x61; 10][..]);
}

#[test]
fn test_denied_syscall_emits_nothing_on_either_edge() {
    let mut filter = FilterConfig::default();
    filter.lists.deny(NR_OPENAT);
    let (capture, sink) = engine(filter);
    let mem = hosts_memory();
    let task = TaskContext::new(9, 9);
    let regs = openat_regs(0x4000);

    assert_eq!(
        capture.on_sys_enter(&task, NR_OPENAT, &regs, &mem).unwrap(),
        Disposition::Denied
    );
    assert_eq!(
        capture.on_sys_exit(&task, NR_OPENAT, &regs, &mem).unwrap(),
        Disposition::NoSnapshot
    );
    assert!(sink.take().is_empty());
    assert!(capture.snapshots().is_empty());
}

#[test]
fn test_listed_mode_captures_only_allowed_numbers() {
    let mut filter = FilterConfig::new(TraceMode::Listed);
    filter.lists.allow(NR_OPENAT);
    let (capture, sink) = engine(filter);
    let mem = hosts_memory();
    let task = TaskContext::new(5, 5);

    let mut read_regs = RegisterFile::default();
    read_regs.regs[2] = 8;
    assert_eq!(
        capture.on_sys_enter(&task, NR_READ, &read_regs, &mem).unwrap(),
        Disposition::AllowMiss
    );
    assert_eq!(
        capture
            .on_sys_enter(&task, NR_OPENAT, &openat_regs(0x4000), &mem)
            .unwrap(),
        Disposition::Captured
    );
    assert_eq!(sink.take().len(), 1);
}

#[test]
fn test_drop_rule_short_circuits_and_poisons_exit() {
    let filter = FilterConfig::default()
        .with_rule(ArgRule::new("^/proc/", ArgAction::Drop).unwrap());
    let (capture, sink) = engine(filter);
    let mut mem = SparseMemory::new();
    mem.map_str(0x4000, "/proc/self/environ");
    let task = TaskContext::new(11, 11);
    let regs = openat_regs(0x4000);

    assert_eq!(
        capture.on_sys_enter(&task, NR_OPENAT, &regs, &mem).unwrap(),
        Disposition::ShortCircuited
    );
    assert_eq!(
        capture.on_sys_exit(&task, NR_OPENAT, &regs, &mem).unwrap(),
        Disposition::DroppedPair
    );
    assert!(sink.take().is_empty());
}

#[test]
fn test_keep_rule_admits_only_matching_paths() {
    let filter = FilterConfig::default()
        .with_rule(ArgRule::new("^/etc/", ArgAction::Keep).unwrap());
    let (capture, sink) = engine(filter);
    let mut mem = SparseMemory::new();
    mem.map_str(0x4000, "/etc/hosts");
    mem.map_str(0x5000, "/tmp/scratch");
    let task = TaskContext::new(12, 12);

    assert_eq!(
        capture
            .on_sys_enter(&task, NR_OPENAT, &openat_regs(0x4000), &mem)
            .unwrap(),
        Disposition::Captured
    );
    let _ = capture.on_sys_exit(&task, NR_OPENAT, &openat_regs(0x4000), &mem);

    assert_eq!(
        capture
            .on_sys_enter(&task, NR_OPENAT, &openat_regs(0x5000), &mem)
            .unwrap(),
        Disposition::ShortCircuited
    );
    let events = sink.take();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.sysno == NR_OPENAT));
}

#[test]
fn test_descendants_gate_and_root_forgetting() {
    let sink = Arc::new(VecSink::new());
    let capture = SyscallCapture::new(
        Arc::new(default_store().unwrap()),
        Arc::new(FilterConfig::default()),
        Arc::clone(&sink) as Arc<dyn EventSink>,
    );
    let mem = hosts_memory();
    let regs = openat_regs(0x4000);

    let stranger = TaskContext::new(500, 500);
    assert_eq!(
        capture.on_sys_enter(&stranger, NR_OPENAT, &regs, &mem).unwrap(),
        Disposition::NotAdmitted
    );

    capture.admit_root(100);
    capture.observe_fork(100, 101);
    capture.observe_fork(101, 102);
    let grandchild = TaskContext::new(102, 102);
    assert_eq!(
        capture.on_sys_enter(&grandchild, NR_OPENAT, &regs, &mem).unwrap(),
        Disposition::Captured
    );

    // removing the root row does not orphan already-admitted descendants
    capture.lineage().forget(100);
    assert_eq!(
        capture.on_sys_exit(&grandchild, NR_OPENAT, &regs, &mem).unwrap(),
        Disposition::Captured
    );
    assert_eq!(sink.take().len(), 2);
}

#[test]
fn test_execve_argv_walk_through_engine() {
    let (capture, sink) = engine(FilterConfig::default());
    let mut mem = SparseMemory::new();
    mem.map_str(0x2000, "/bin/cat");
    mem.map_u64(0x8000, 0x9000);
    mem.map_u64(0x8008, 0x9100);
    mem.map_u64(0x8010, 0);
    mem.map_str(0x9000, "cat");
    mem.map_str(0x9100, "/etc/passwd");
    let task = TaskContext::new(33, 33);

    let mut regs = RegisterFile::default();
    regs.regs[0] = 0x2000;
    regs.regs[1] = 0x8000;
    assert_eq!(
        capture.on_sys_enter(&task, NR_EXECVE, &regs, &mem).unwrap(),
        Disposition::Captured
    );

    let events = sink.take();
    let fields = events[0].buffer.fields();
    assert_eq!(fields[4], (4u8, &b"/bin/cat\0"[..]));
    assert_eq!(fields[5], (5u8, &0x9000u64.to_le_bytes()[..]));
    assert_eq!(fields[6], (5u8, &b"cat\0"[..]));
    assert_eq!(fields[7], (6u8, &0x9100u64.to_le_bytes()[..]));
    assert_eq!(fields[8], (6u8, &b"/etc/passwd\0"[..]));
}

#[test]
fn test_stats_account_for_every_edge() {
    let mut filter = FilterConfig::default();
    filter.lists.deny(NR_READ);
    let (capture, _sink) = engine(filter);
    let mem = hosts_memory();
    let task = TaskContext::new(3, 3);

    let edges = [
        capture.on_sys_enter(&task, NR_OPENAT, &openat_regs(0x4000), &mem),
        capture.on_sys_exit(&task, NR_OPENAT, &openat_regs(0x4000), &mem),
        capture.on_sys_enter(&task, NR_READ, &RegisterFile::default(), &mem),
        capture.on_sys_enter(&task, 999, &RegisterFile::default(), &mem),
        capture.on_sys_exit(&task, NR_OPENAT, &openat_regs(0x4000), &mem),
    ];
    assert!(edges.iter().all(Result::is_ok));

    let summary = capture.stats().summary();
    assert_eq!(summary.captured, 2);
    assert_eq!(summary.denied, 1);
    assert_eq!(summary.not_instrumented, 1);
    assert_eq!(summary.no_snapshot, 1);
    assert_eq!(summary.total_seen(), edges.len() as u64);
}
