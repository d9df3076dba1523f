//! The capture engine: syscall edges in, framed events out.
//!
//! `SyscallCapture` owns the per-call state (snapshots, lineage) and borrows
//! the shared policy (program store, filter config). Both edge handlers are
//! `&self` and run to completion; everything they touch is either immutable
//! or behind its own short-lived lock.
//!
//! # Admission order
//!
//! Both edges apply the same fixed sequence: program lookup, ownership
//! predicate, allow set (in `Listed` mode), deny set. The exit edge consumes
//! its register snapshot between the predicate and the list checks, so a
//! filtered exit still clears the correlation row and a flagged pair is
//! suppressed before any list work happens.
//!
//! # What reaches the sink
//!
//! Enter records carry the syscall number, link register, program counter
//! and stack pointer in slots 0..=3, then whatever the enter program emits
//! from slot 4. Exit records carry the number in slot 0, exit-program fields
//! from slot 1, the raw return value, then the return descriptor's fields.
//! An invocation that fails admission, trips a content rule, or aborts on a
//! malformed program submits nothing at all.

use crate::arch::RegisterFile;
use crate::event::{CapturedEvent, EventBuffer, EventKind, TaskContext};
use crate::filter::{FilterConfig, Verdict};
use crate::interpreter::{ExecutionContext, Interpreter, RunOutcome, VmError};
use crate::lineage::LineageTable;
use crate::memory::UserMemory;
use crate::sink::EventSink;
use crate::snapshot::{RegisterSnapshot, SnapshotStore};
use crate::stats::CaptureStats;
use crate::store::{Phase, ProgramStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// Why an edge did or did not produce an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Captured,
    /// No point for this syscall number.
    NotInstrumented,
    /// Ownership predicate refused the task.
    NotAdmitted,
    AllowMiss,
    Denied,
    /// An argument-content rule rejected the invocation.
    ShortCircuited,
    /// Exit with no stored snapshot.
    NoSnapshot,
    /// Exit whose enter was rejected after storing its snapshot.
    DroppedPair,
}

/// Decides whether a task's syscalls belong to this capture session.
pub type TracePredicate = Box<dyn Fn(&TaskContext, &LineageTable) -> bool + Send + Sync>;

/// Admit tasks whose pid is in the lineage table.
pub fn trace_descendants() -> TracePredicate {
    Box::new(|task, lineage| lineage.is_traced(task.pid))
}

/// Admit everything; filtering is left to the lists.
pub fn trace_everything() -> TracePredicate {
    Box::new(|_, _| true)
}

/// Post-capture signal delivery.
pub trait Signaler: Send + Sync {
    fn deliver(&self, task: &TaskContext, signal: i32);
}

/// Discards every delivery request.
pub struct NullSignaler;

impl Signaler for NullSignaler {
    fn deliver(&self, _task: &TaskContext, _signal: i32) {}
}

/// Thread-directed delivery via `tgkill`.
pub struct KillSignaler;

impl Signaler for KillSignaler {
    fn deliver(&self, task: &TaskContext, signal: i32) {
        // SAFETY: plain syscall wrapper, no pointers involved.
        let rc = unsafe { libc::tgkill(task.pid as i32, task.tid as i32, signal) };
        if rc != 0 {
            warn!(pid = task.pid, tid = task.tid, signal, "tgkill failed");
        }
    }
}

/// The capture engine.
pub struct SyscallCapture {
    store: Arc<ProgramStore>,
    filter: Arc<FilterConfig>,
    snapshots: SnapshotStore,
    lineage: LineageTable,
    predicate: TracePredicate,
    signaler: Box<dyn Signaler>,
    sink: Arc<dyn EventSink>,
    stats: Arc<CaptureStats>,
}

impl SyscallCapture {
    /// Engine with the descendant predicate and no signal delivery. Admit
    /// at least one root before expecting captures.
    pub fn new(
        store: Arc<ProgramStore>,
        filter: Arc<FilterConfig>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            filter,
            snapshots: SnapshotStore::new(),
            lineage: LineageTable::new(),
            predicate: trace_descendants(),
            signaler: Box::new(NullSignaler),
            sink,
            stats: Arc::new(CaptureStats::new()),
        }
    }

    #[must_use]
    pub fn with_predicate(mut self, predicate: TracePredicate) -> Self {
        self.predicate = predicate;
        self
    }

    #[must_use]
    pub fn with_signaler(mut self, signaler: Box<dyn Signaler>) -> Self {
        self.signaler = signaler;
        self
    }

    #[must_use]
    pub fn with_stats(mut self, stats: Arc<CaptureStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn lineage(&self) -> &LineageTable {
        &self.lineage
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Seed a lineage root.
    pub fn admit_root(&self, pid: u32) -> bool {
        self.lineage.admit_root(pid)
    }

    /// Fork hook; call for every observed fork/clone.
    pub fn observe_fork(&self, parent: u32, child: u32) -> bool {
        self.lineage.observe_fork(parent, child)
    }

    /// Syscall-enter edge.
    ///
    /// A `VmError` means the point's program is malformed; nothing was
    /// submitted and the paired exit is poisoned.
    pub fn on_sys_enter<M: UserMemory>(
        &self,
        task: &TaskContext,
        sysno: u32,
        regs: &RegisterFile,
        memory: &M,
    ) -> Result<Disposition, VmError> {
        let Some(point) = self.store.lookup(sysno) else {
            self.stats.not_instrumented();
            return Ok(Disposition::NotInstrumented);
        };
        if !(self.predicate)(task, &self.lineage) {
            self.stats.not_admitted();
            return Ok(Disposition::NotAdmitted);
        }
        match self.filter.verdict(sysno) {
            Verdict::AllowMiss => {
                self.stats.allow_miss();
                return Ok(Disposition::AllowMiss);
            }
            Verdict::Denied => {
                self.stats.denied();
                return Ok(Disposition::Denied);
            }
            Verdict::Admit => {}
        }

        // snapshot only after every rejection path is behind us
        let snapshot = RegisterSnapshot::of(regs);
        self.snapshots.insert(task.tid, snapshot);

        let mut buf = EventBuffer::new();
        buf.push_u32(0, sysno);
        buf.push_u64(1, regs.link_register(self.filter.abi));
        buf.push_u64(2, regs.pc);
        buf.push_u64(3, regs.sp);

        let mut ctx = ExecutionContext::new(snapshot.args[0], 4);
        if let Some(program) = &point.enter_program {
            let rules = if point.arms_rules(Phase::Enter) {
                self.filter.arg_rules.as_slice()
            } else {
                &[]
            };
            let interp =
                Interpreter::new(self.store.instructions(), regs, memory).with_rules(rules);
            match interp.run(program, &mut ctx, &mut buf) {
                Ok(RunOutcome::Completed) => {}
                Ok(RunOutcome::ShortCircuited) => {
                    self.snapshots.flag_dropped(task.tid);
                    self.stats.short_circuited();
                    debug!(sysno, tid = task.tid, "enter short-circuited");
                    return Ok(Disposition::ShortCircuited);
                }
                Err(err) => {
                    self.snapshots.flag_dropped(task.tid);
                    self.stats.vm_error();
                    warn!(sysno, %err, "enter program aborted");
                    return Err(err);
                }
            }
        }

        self.sink.submit(CapturedEvent::new(
            task.clone(),
            EventKind::SyscallEnter,
            sysno,
            buf,
        ));
        self.stats.captured();
        if let Some(signal) = self.filter.signal {
            self.signaler.deliver(task, signal);
        }
        Ok(Disposition::Captured)
    }

    /// Syscall-exit edge. The return value is read from the register file
    /// (x0 at exit), and index 0 in programs resolves to the entry-time
    /// first argument from the snapshot.
    pub fn on_sys_exit<M: UserMemory>(
        &self,
        task: &TaskContext,
        sysno: u32,
        regs: &RegisterFile,
        memory: &M,
    ) -> Result<Disposition, VmError> {
        let Some(point) = self.store.lookup(sysno) else {
            self.stats.not_instrumented();
            return Ok(Disposition::NotInstrumented);
        };
        if !(self.predicate)(task, &self.lineage) {
            self.stats.not_admitted();
            return Ok(Disposition::NotAdmitted);
        }

        // consume the correlation row before the list checks so it cannot
        // outlive this call
        let Some(snapshot) = self.snapshots.take(task.tid) else {
            self.stats.no_snapshot();
            return Ok(Disposition::NoSnapshot);
        };
        if snapshot.dropped {
            self.stats.dropped_pair();
            debug!(sysno, tid = task.tid, "suppressed paired exit");
            return Ok(Disposition::DroppedPair);
        }

        match self.filter.verdict(sysno) {
            Verdict::AllowMiss => {
                self.stats.allow_miss();
                return Ok(Disposition::AllowMiss);
            }
            Verdict::Denied => {
                self.stats.denied();
                return Ok(Disposition::Denied);
            }
            Verdict::Admit => {}
        }

        let rules = if point.arms_rules(Phase::Exit) {
            self.filter.arg_rules.as_slice()
        } else {
            &[]
        };
        let interp = Interpreter::new(self.store.instructions(), regs, memory).with_rules(rules);

        let mut buf = EventBuffer::new();
        buf.push_u32(0, sysno);
        let mut ctx = ExecutionContext::new(snapshot.args[0], 1);
        if let Some(program) = &point.exit_program {
            match interp.run(program, &mut ctx, &mut buf) {
                Ok(RunOutcome::Completed) => {}
                Ok(RunOutcome::ShortCircuited) => {
                    self.stats.short_circuited();
                    return Ok(Disposition::ShortCircuited);
                }
                Err(err) => {
                    self.stats.vm_error();
                    warn!(sysno, %err, "exit program aborted");
                    return Err(err);
                }
            }
        }

        // raw return value, then whatever the return descriptor extracts
        let ret = regs.regs[0];
        if !buf.push_u64(ctx.save_index as u8, ret) {
            buf.push_empty(ctx.save_index as u8);
        }
        ctx.save_index += 1;

        if let Some(ret_program) = &point.ret_program {
            let mut ret_ctx = ExecutionContext::new(ret, ctx.save_index);
            match interp.run(ret_program, &mut ret_ctx, &mut buf) {
                Ok(RunOutcome::Completed) => {}
                Ok(RunOutcome::ShortCircuited) => {
                    self.stats.short_circuited();
                    return Ok(Disposition::ShortCircuited);
                }
                Err(err) => {
                    self.stats.vm_error();
                    warn!(sysno, %err, "return program aborted");
                    return Err(err);
                }
            }
        }

        self.sink.submit(CapturedEvent::new(
            task.clone(),
            EventKind::SyscallExit,
            sysno,
            buf,
        ));
        self.stats.captured();
        Ok(Disposition::Captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TraceMode;
    use crate::memory::SparseMemory;
    use crate::program::{Instruction, OpCode, Program};
    use crate::sink::VecSink;
    use crate::store::{ArgDescriptor, SyscallPoint};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSignaler(Arc<AtomicU32>);

    impl Signaler for CountingSignaler {
        fn deliver(&self, _task: &TaskContext, _signal: i32) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn store_with_openat() -> ProgramStore {
        // slot 4: fd, slot 5: pathname string
        let mut store = ProgramStore::new();
        let enter = store
            .instructions_mut()
            .program()
            .op(OpCode::ResetCtx)
            .push(
                Instruction::new(OpCode::ReadReg)
                    .with_value(0)
                    .with_pre(OpCode::SetRegIndex),
            )
            .op(OpCode::SaveReg)
            .push(
                Instruction::new(OpCode::ReadReg)
                    .with_value(1)
                    .with_pre(OpCode::SetRegIndex),
            )
            .op(OpCode::MoveRegValue)
            .op(OpCode::SaveString)
            .build();
        store
            .insert(
                SyscallPoint::new(56)
                    .with_arg(ArgDescriptor::new(1, Phase::Enter).probed())
                    .with_enter(enter),
            )
            .unwrap();
        store
    }

    fn engine(store: ProgramStore, filter: FilterConfig) -> (SyscallCapture, Arc<VecSink>) {
        let sink = Arc::new(VecSink::new());
        let capture = SyscallCapture::new(
            Arc::new(store),
            Arc::new(filter),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        )
        .with_predicate(trace_everything());
        (capture, sink)
    }

    fn openat_regs(path_ptr: u64) -> RegisterFile {
        let mut regs = RegisterFile::default();
        regs.regs[0] = u64::MAX - 99; // AT_FDCWD as seen in x0
        regs.regs[1] = path_ptr;
        regs.regs[30] = 0x7000_0000;
        regs.pc = 0x5500;
        regs.sp = 0x7fff_0000;
        regs
    }

    #[test]
    fn test_enter_layout_head_then_program_fields() {
        let (capture, sink) = engine(store_with_openat(), FilterConfig::default());
        let mut mem = SparseMemory::new();
        mem.map_str(0x9000, "/etc/hosts");
        let task = TaskContext::new(10, 10);
        let regs = openat_regs(0x9000);

        let disp = capture.on_sys_enter(&task, 56, &regs, &mem).unwrap();
        assert_eq!(disp, Disposition::Captured);
        let events = sink.take();
        assert_eq!(events.len(), 1);
        let fields = events[0].buffer.fields();
        assert_eq!(fields[0], (0u8, &56u32.to_le_bytes()[..]));
        assert_eq!(fields[1], (1u8, &0x7000_0000u64.to_le_bytes()[..]));
        assert_eq!(fields[2], (2u8, &0x5500u64.to_le_bytes()[..]));
        assert_eq!(fields[3], (3u8, &0x7fff_0000u64.to_le_bytes()[..]));
        assert_eq!(fields[4], (4u8, &(u64::MAX - 99).to_le_bytes()[..]));
        assert_eq!(fields[5], (5u8, &b"/etc/hosts\0"[..]));
    }

    #[test]
    fn test_exit_pairs_with_enter_and_appends_ret() {
        let (capture, sink) = engine(store_with_openat(), FilterConfig::default());
        let mut mem = SparseMemory::new();
        mem.map_str(0x9000, "/etc/hosts");
        let task = TaskContext::new(10, 10);
        let enter_regs = openat_regs(0x9000);
        capture.on_sys_enter(&task, 56, &enter_regs, &mem).unwrap();
        let _ = sink.take();

        let mut exit_regs = enter_regs;
        exit_regs.regs[0] = 3; // returned fd
        let disp = capture.on_sys_exit(&task, 56, &exit_regs, &mem).unwrap();
        assert_eq!(disp, Disposition::Captured);
        let events = sink.take();
        assert_eq!(events[0].kind, EventKind::SyscallExit);
        let fields = events[0].buffer.fields();
        assert_eq!(fields[0], (0u8, &56u32.to_le_bytes()[..]));
        assert_eq!(fields[1], (1u8, &3u64.to_le_bytes()[..]));
        // the snapshot row is gone
        assert!(capture.snapshots().is_empty());
    }

    #[test]
    fn test_exit_without_enter_is_skipped() {
        let (capture, sink) = engine(store_with_openat(), FilterConfig::default());
        let mem = SparseMemory::new();
        let task = TaskContext::new(10, 10);
        let regs = openat_regs(0);
        let disp = capture.on_sys_exit(&task, 56, &regs, &mem).unwrap();
        assert_eq!(disp, Disposition::NoSnapshot);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_uninstrumented_sysno_is_silent() {
        let (capture, sink) = engine(store_with_openat(), FilterConfig::default());
        let mem = SparseMemory::new();
        let task = TaskContext::new(10, 10);
        let regs = RegisterFile::default();
        let disp = capture.on_sys_enter(&task, 999, &regs, &mem).unwrap();
        assert_eq!(disp, Disposition::NotInstrumented);
        assert!(sink.take().is_empty());
        assert_eq!(capture.stats().summary().not_instrumented, 1);
    }

    #[test]
    fn test_denied_enter_leaves_no_snapshot() {
        let mut filter = FilterConfig::default();
        filter.lists.deny(56);
        let (capture, sink) = engine(store_with_openat(), filter);
        let mut mem = SparseMemory::new();
        mem.map_str(0x9000, "/etc/hosts");
        let task = TaskContext::new(10, 10);
        let regs = openat_regs(0x9000);

        assert_eq!(
            capture.on_sys_enter(&task, 56, &regs, &mem).unwrap(),
            Disposition::Denied
        );
        assert!(sink.take().is_empty());
        assert!(capture.snapshots().is_empty());
        // the paired exit then has nothing to consume
        assert_eq!(
            capture.on_sys_exit(&task, 56, &regs, &mem).unwrap(),
            Disposition::NoSnapshot
        );
    }

    #[test]
    fn test_listed_mode_misses_unallowed() {
        let filter = FilterConfig::new(TraceMode::Listed);
        let (capture, sink) = engine(store_with_openat(), filter);
        let mut mem = SparseMemory::new();
        mem.map_str(0x9000, "/x");
        let task = TaskContext::new(10, 10);
        let regs = openat_regs(0x9000);
        assert_eq!(
            capture.on_sys_enter(&task, 56, &regs, &mem).unwrap(),
            Disposition::AllowMiss
        );
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_descendant_predicate_gates_capture() {
        let sink = Arc::new(VecSink::new());
        let capture = SyscallCapture::new(
            Arc::new(store_with_openat()),
            Arc::new(FilterConfig::default()),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );
        let mut mem = SparseMemory::new();
        mem.map_str(0x9000, "/etc/hosts");
        let regs = openat_regs(0x9000);

        let stranger = TaskContext::new(77, 77);
        assert_eq!(
            capture.on_sys_enter(&stranger, 56, &regs, &mem).unwrap(),
            Disposition::NotAdmitted
        );

        capture.admit_root(10);
        capture.observe_fork(10, 20);
        capture.observe_fork(20, 30);
        let grandchild = TaskContext::new(30, 30);
        assert_eq!(
            capture.on_sys_enter(&grandchild, 56, &regs, &mem).unwrap(),
            Disposition::Captured
        );
        assert_eq!(sink.take().len(), 1);
    }

    #[test]
    fn test_malformed_program_poisons_pair() {
        let mut store = ProgramStore::new();
        let enter = store
            .instructions_mut()
            .program()
            .push(
                Instruction::new(OpCode::ReadReg)
                    .with_value(77)
                    .with_pre(OpCode::SetRegIndex),
            )
            .build();
        store
            .insert(SyscallPoint::new(63).with_enter(enter))
            .unwrap();
        let (capture, sink) = engine(store, FilterConfig::default());
        let mem = SparseMemory::new();
        let task = TaskContext::new(10, 10);
        let regs = RegisterFile::default();

        assert!(capture.on_sys_enter(&task, 63, &regs, &mem).is_err());
        assert!(sink.take().is_empty());
        assert_eq!(
            capture.on_sys_exit(&task, 63, &regs, &mem).unwrap(),
            Disposition::DroppedPair
        );
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_unknown_key_aborts_without_submission() {
        let mut store = ProgramStore::new();
        store
            .insert(SyscallPoint::new(63).with_enter(Program::from_keys(vec![4242])))
            .unwrap();
        let (capture, sink) = engine(store, FilterConfig::default());
        let mem = SparseMemory::new();
        let task = TaskContext::new(10, 10);
        let regs = RegisterFile::default();
        assert!(capture.on_sys_enter(&task, 63, &regs, &mem).is_err());
        assert!(sink.take().is_empty());
        assert_eq!(capture.stats().summary().vm_errors, 1);
    }

    #[test]
    fn test_signal_delivered_after_capture_only() {
        let mut store = ProgramStore::new();
        store.insert(SyscallPoint::new(64)).unwrap();
        let sink = Arc::new(VecSink::new());
        let hits = Arc::new(AtomicU32::new(0));
        let capture = SyscallCapture::new(
            Arc::new(store),
            Arc::new(FilterConfig::default().with_signal(19)),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        )
        .with_predicate(trace_everything())
        .with_signaler(Box::new(CountingSignaler(Arc::clone(&hits))));
        let mem = SparseMemory::new();
        let task = TaskContext::new(10, 10);
        let regs = RegisterFile::default();

        capture.on_sys_enter(&task, 64, &regs, &mem).unwrap();
        capture.on_sys_enter(&task, 65, &regs, &mem).unwrap(); // not instrumented
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_ret_program_reads_return_value() {
        // ret program: dereference the returned pointer-sized value's slot:
        // save reg 0, which is rebound to the raw return value
        let mut store = ProgramStore::new();
        let ret_ops = store
            .instructions_mut()
            .program()
            .push(
                Instruction::new(OpCode::ReadReg)
                    .with_value(0)
                    .with_pre(OpCode::SetRegIndex),
            )
            .op(OpCode::SaveReg)
            .build();
        store
            .insert(
                SyscallPoint::new(63)
                    .with_ret(ArgDescriptor::new(0, Phase::Exit), ret_ops),
            )
            .unwrap();
        let (capture, sink) = engine(store, FilterConfig::default());
        let mem = SparseMemory::new();
        let task = TaskContext::new(10, 10);
        let mut regs = RegisterFile::default();
        regs.regs[0] = 0x1111;
        capture.on_sys_enter(&task, 63, &regs, &mem).unwrap();
        let _ = sink.take();

        let mut exit_regs = regs;
        exit_regs.regs[0] = 42;
        capture.on_sys_exit(&task, 63, &exit_regs, &mem).unwrap();
        let events = sink.take();
        let fields = events[0].buffer.fields();
        // slot 0 sysno, slot 1 raw ret, slot 2 the ret program's SaveReg of
        // the rebound register 0
        assert_eq!(fields[1], (1u8, &42u64.to_le_bytes()[..]));
        assert_eq!(fields[2], (2u8, &42u64.to_le_bytes()[..]));
    }

    #[test]
    fn test_short_circuit_suppresses_enter_and_exit() {
        let (capture, sink) = {
            let filter = FilterConfig::default().with_rule(
                crate::filter::ArgRule::new("^/proc/", crate::filter::ArgAction::Drop).unwrap(),
            );
            engine(store_with_openat(), filter)
        };
        let mut mem = SparseMemory::new();
        mem.map_str(0x9000, "/proc/self/maps");
        let task = TaskContext::new(10, 10);
        let regs = openat_regs(0x9000);

        assert_eq!(
            capture.on_sys_enter(&task, 56, &regs, &mem).unwrap(),
            Disposition::ShortCircuited
        );
        assert!(sink.take().is_empty());
        assert_eq!(
            capture.on_sys_exit(&task, 56, &regs, &mem).unwrap(),
            Disposition::DroppedPair
        );
        assert!(sink.take().is_empty());
        let summary = capture.stats().summary();
        assert_eq!(summary.short_circuited, 1);
        assert_eq!(summary.dropped_pair, 1);
    }
}
