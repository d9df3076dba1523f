//! Ptrace host for the capture engine.
//!
//! Spawns the target with `PTRACE_TRACEME`, then drives every syscall stop
//! through `SyscallCapture`. The engine itself is host-agnostic; this
//! module supplies the x86_64 glue: `orig_rax` translated into the
//! canonical syscall numbering and the kernel argument registers mapped
//! into the engine's register file.
//!
//! Fork following relies on `PTRACE_O_TRACEFORK`/`VFORK`/`CLONE`: each
//! event stop reports the new task, which is added to the lineage before
//! either side resumes. A freshly reported child starts on the exit edge
//! of the syscall that created it, so its toggle starts in-syscall and the
//! dangling exit is skipped as snapshot-less.

use crate::capture::SyscallCapture;
use crate::cli::OutputFormat;
use crate::event::TaskContext;
use crate::memory::ProcessVmReader;
use crate::output::{render_text, JsonReport};
use crate::sink::RingBufferSink;
use crate::syscalls::canonical_from_x86_64;
use anyhow::{Context, Result};
use fnv::FnvHashMap;
use libc::user_regs_struct;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::arch::RegisterFile;

const DRAIN_CHUNK: usize = 256;

/// Everything the trace loop needs besides the command itself.
pub struct TraceSession {
    pub capture: SyscallCapture,
    pub sink: Arc<RingBufferSink>,
    pub format: OutputFormat,
    pub show_stats: bool,
    pub follow_forks: bool,
}

/// Run `command` under capture and return its exit code.
pub fn trace_command(command: &[String], session: &TraceSession) -> Result<i32> {
    if command.is_empty() {
        anyhow::bail!("Command array is empty");
    }

    let program = &command[0];
    let args = &command[1..];

    match unsafe { fork() }.context("Failed to fork")? {
        ForkResult::Parent { child } => trace_child(child, session),
        ForkResult::Child => {
            ptrace::traceme().context("Failed to PTRACE_TRACEME")?;
            let err = Command::new(program).args(args).exec();
            eprintln!("Failed to exec {program}: {err}");
            std::process::exit(1);
        }
    }
}

fn trace_child(root: Pid, session: &TraceSession) -> Result<i32> {
    // initial stop from PTRACE_TRACEME + exec
    waitpid(root, None).context("Failed to wait for child")?;

    let mut options = ptrace::Options::PTRACE_O_TRACESYSGOOD | ptrace::Options::PTRACE_O_EXITKILL;
    if session.follow_forks {
        options |= ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACECLONE;
    }
    ptrace::setoptions(root, options).context("Failed to set ptrace options")?;

    session.capture.admit_root(root.as_raw() as u32);

    // per-task edge toggle: true once the enter edge has been seen
    let mut in_syscall: FnvHashMap<i32, bool> = FnvHashMap::default();
    let mut comms: FnvHashMap<u32, String> = FnvHashMap::default();
    let mut report = match session.format {
        OutputFormat::Json => Some(JsonReport::new()),
        OutputFormat::Text => None,
    };
    let mut exit_code = 0;

    ptrace::syscall(root, None).context("Failed to PTRACE_SYSCALL")?;

    loop {
        let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
            Ok(status) => status,
            Err(Errno::ECHILD) => break,
            Err(err) => return Err(err).context("Failed to waitpid"),
        };

        match status {
            WaitStatus::Exited(pid, code) => {
                forget_task(session, &mut in_syscall, pid);
                if pid == root {
                    exit_code = code;
                    if !session.follow_forks {
                        break;
                    }
                }
            }
            WaitStatus::Signaled(pid, sig, _) => {
                forget_task(session, &mut in_syscall, pid);
                if pid == root {
                    eprintln!("Child killed by signal: {sig:?}");
                    exit_code = 128 + sig as i32;
                    if !session.follow_forks {
                        break;
                    }
                }
            }
            WaitStatus::PtraceEvent(pid, _, event) => {
                if is_fork_event(event) {
                    match ptrace::getevent(pid) {
                        Ok(new_pid) => {
                            let child = new_pid as u32;
                            session.capture.observe_fork(pid.as_raw() as u32, child);
                            // the child resumes on the creating syscall's exit;
                            // or_insert in case its attach stop was seen first
                            in_syscall.entry(new_pid as i32).or_insert(true);
                        }
                        Err(err) => warn!(%err, "could not read fork event payload"),
                    }
                }
                resume(pid, None);
            }
            WaitStatus::PtraceSyscall(pid) => {
                let entering = !in_syscall.get(&pid.as_raw()).copied().unwrap_or(false);
                handle_syscall_stop(session, pid, entering, &mut comms);
                in_syscall.insert(pid.as_raw(), entering);
                flush_events(session, report.as_mut());
                resume(pid, None);
            }
            WaitStatus::Stopped(pid, sig) => {
                if pid != root {
                    // first stop of an auto-attached child can be reported
                    // before the parent's fork event
                    in_syscall.entry(pid.as_raw()).or_insert(true);
                }
                // exec and group-stop artifacts are swallowed, real signals
                // are forwarded on resume
                let forward = match sig {
                    Signal::SIGTRAP | Signal::SIGSTOP => None,
                    other => Some(other),
                };
                resume(pid, forward);
            }
            _ => {}
        }
    }

    flush_events(session, report.as_mut());

    if let Some(mut report) = report {
        report.set_exit_code(exit_code);
        report.set_stats(session.capture.stats().summary());
        match report.to_json() {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("Failed to serialize JSON: {err}"),
        }
    }
    if session.show_stats {
        print_stats(session);
    }

    Ok(exit_code)
}

/// Drop all per-task state once a task is gone. A task that dies inside
/// a syscall leaves a snapshot row behind; reclaim it here instead of
/// waiting for store eviction.
fn forget_task(session: &TraceSession, in_syscall: &mut FnvHashMap<i32, bool>, pid: Pid) {
    in_syscall.remove(&pid.as_raw());
    session.capture.lineage().forget(pid.as_raw() as u32);
    let _ = session.capture.snapshots().take(pid.as_raw() as u32);
}

/// Resume a stopped task; it may already be gone.
fn resume(pid: Pid, sig: Option<Signal>) {
    if let Err(err) = ptrace::syscall(pid, sig) {
        debug!(pid = pid.as_raw(), %err, "resume failed");
    }
}

fn is_fork_event(event: i32) -> bool {
    event == ptrace::Event::PTRACE_EVENT_FORK as i32
        || event == ptrace::Event::PTRACE_EVENT_VFORK as i32
        || event == ptrace::Event::PTRACE_EVENT_CLONE as i32
}

/// One syscall edge. Engine errors are tallied and logged inside the
/// engine, so the host loop keeps going.
fn handle_syscall_stop(
    session: &TraceSession,
    pid: Pid,
    entering: bool,
    comms: &mut FnvHashMap<u32, String>,
) {
    let Ok(regs) = ptrace::getregs(pid) else {
        // task vanished between the stop and here
        return;
    };
    let Some(sysno) = canonical_from_x86_64(regs.orig_rax as u32) else {
        // legacy call with no canonical number; nothing instruments those
        return;
    };
    let file = register_file(&regs, entering);
    let memory = ProcessVmReader::new(pid);
    let task = task_for(pid.as_raw() as u32, comms);
    if entering {
        let _ = session.capture.on_sys_enter(&task, sysno, &file, &memory);
    } else {
        let _ = session.capture.on_sys_exit(&task, sysno, &file, &memory);
    }
}

/// Map x86_64 ptrace registers onto the engine's register file. Kernel
/// argument order is rdi, rsi, rdx, r10, r8, r9; on the exit edge index 0
/// carries the return value from rax instead. rcx holds the user return
/// address at a syscall stop and stands in for the link register.
fn register_file(regs: &user_regs_struct, entering: bool) -> RegisterFile {
    let mut file = RegisterFile::default();
    file.regs[0] = if entering { regs.rdi } else { regs.rax };
    file.regs[1] = regs.rsi;
    file.regs[2] = regs.rdx;
    file.regs[3] = regs.r10;
    file.regs[4] = regs.r8;
    file.regs[5] = regs.r9;
    file.regs[30] = regs.rcx;
    file.sp = regs.rsp;
    file.pc = regs.rip;
    file
}

fn task_for(raw: u32, comms: &mut FnvHashMap<u32, String>) -> TaskContext {
    let comm = comms.entry(raw).or_insert_with(|| {
        std::fs::read_to_string(format!("/proc/{raw}/comm"))
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default()
    });
    TaskContext::new(raw, raw).with_comm(comm)
}

fn flush_events(session: &TraceSession, mut report: Option<&mut JsonReport>) {
    for event in session.sink.drain(DRAIN_CHUNK) {
        match report.as_deref_mut() {
            Some(report) => report.add_event(&event),
            None => println!("{}", render_text(&event)),
        }
    }
}

fn print_stats(session: &TraceSession) {
    let summary = session.capture.stats().summary();
    let sink = session.sink.stats();
    eprintln!("captured:        {}", summary.captured);
    eprintln!("not instrumented: {}", summary.not_instrumented);
    eprintln!("filtered out:    {}", summary.allow_miss + summary.denied);
    eprintln!("rule rejected:   {}", summary.short_circuited);
    eprintln!("unpaired exits:  {}", summary.no_snapshot + summary.dropped_pair);
    eprintln!("program errors:  {}", summary.vm_errors);
    eprintln!(
        "queue:           {} delivered, {} dropped",
        sink.total_pushed.saturating_sub(sink.total_dropped),
        sink.total_dropped
    );
}
