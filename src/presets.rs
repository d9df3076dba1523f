//! Built-in capture programs for a useful starter set of syscalls.
//!
//! Each preset reads like the descriptor it replaces: one `ResetCtx`-led
//! block per argument, registers pinned by `SetRegIndex` pre-ops, and
//! post-ops fusing the short tail steps. `read` shows the return-bound
//! pattern: its buffer is captured by the return program, where index 0
//! resolves to the return value and clamps the read to `min(count, ret)`.

use crate::program::{Instruction, OpCode};
use crate::store::{ArgDescriptor, Phase, ProgramStore, StoreError, SyscallPoint};
use crate::syscalls::{NR_CLONE, NR_CLOSE, NR_EXECVE, NR_OPENAT, NR_READ, NR_WRITE};

const READ_CAP: u64 = 4096;
const ARGV_WALK_BOUND: u64 = 6;

/// Store with every preset installed.
pub fn default_store() -> Result<ProgramStore, StoreError> {
    let mut store = ProgramStore::new();
    let point = openat_point(&mut store);
    store.insert(point)?;
    let point = close_point(&mut store);
    store.insert(point)?;
    let point = read_point(&mut store);
    store.insert(point)?;
    let point = write_point(&mut store);
    store.insert(point)?;
    let point = execve_point(&mut store);
    store.insert(point)?;
    let point = clone_point(&mut store);
    store.insert(point)?;
    Ok(store)
}

fn reg(index: u64) -> Instruction {
    Instruction::new(OpCode::ReadReg)
        .with_pre(OpCode::SetRegIndex)
        .with_value(index)
}

/// openat(dirfd, pathname, flags): two scalars around a path string.
fn openat_point(store: &mut ProgramStore) -> SyscallPoint {
    let enter = store
        .instructions_mut()
        .program()
        .op(OpCode::ResetCtx)
        .push(reg(0).with_post(OpCode::SaveReg))
        .op(OpCode::ResetCtx)
        .push(reg(1).with_post(OpCode::MoveRegValue))
        .op(OpCode::SaveString)
        .op(OpCode::ResetCtx)
        .push(reg(2).with_post(OpCode::SaveReg))
        .build();
    SyscallPoint::new(NR_OPENAT)
        .with_arg(ArgDescriptor::new(0, Phase::Enter))
        .with_arg(ArgDescriptor::new(1, Phase::Enter).probed())
        .with_arg(ArgDescriptor::new(2, Phase::Enter))
        .with_enter(enter)
}

fn close_point(store: &mut ProgramStore) -> SyscallPoint {
    let enter = store
        .instructions_mut()
        .program()
        .op(OpCode::ResetCtx)
        .push(reg(0).with_post(OpCode::SaveReg))
        .build();
    SyscallPoint::new(NR_CLOSE)
        .with_arg(ArgDescriptor::new(0, Phase::Enter))
        .with_enter(enter)
}

/// read(fd, buf, count): scalars at enter, buffer content bound to the
/// return value. The return program rebinds index 0 to `ret`, so the two
/// `SetReadLenRegValue` steps leave `read_len = min(count, ret)` before
/// the struct read.
fn read_point(store: &mut ProgramStore) -> SyscallPoint {
    let enter = store
        .instructions_mut()
        .program()
        .op(OpCode::ResetCtx)
        .push(reg(0).with_post(OpCode::SaveReg))
        .op(OpCode::ResetCtx)
        .push(reg(1).with_post(OpCode::SaveReg))
        .op(OpCode::ResetCtx)
        .push(reg(2).with_post(OpCode::SaveReg))
        .build();
    let ret = store
        .instructions_mut()
        .program()
        .op(OpCode::ResetCtx)
        .op_value(OpCode::SetReadLen, READ_CAP)
        .push(reg(2).with_post(OpCode::SetReadLenRegValue))
        .push(reg(0).with_post(OpCode::SetReadLenRegValue))
        .push(reg(1).with_post(OpCode::MoveRegValue))
        .op(OpCode::SaveStruct)
        .build();
    SyscallPoint::new(NR_READ)
        .with_arg(ArgDescriptor::new(0, Phase::Enter))
        .with_arg(ArgDescriptor::new(1, Phase::Enter))
        .with_arg(ArgDescriptor::new(2, Phase::Enter))
        .with_ret(ArgDescriptor::new(1, Phase::Exit), ret)
}

/// write(fd, buf, count): the payload is stable at enter, so it is read
/// there, clamped to `min(count, 4096)`.
fn write_point(store: &mut ProgramStore) -> SyscallPoint {
    let enter = store
        .instructions_mut()
        .program()
        .op(OpCode::ResetCtx)
        .push(reg(0).with_post(OpCode::SaveReg))
        .op(OpCode::ResetCtx)
        .op_value(OpCode::SetReadLen, READ_CAP)
        .push(reg(2).with_post(OpCode::SetReadLenRegValue))
        .push(reg(1).with_post(OpCode::MoveRegValue))
        .op(OpCode::SaveStruct)
        .op(OpCode::ResetCtx)
        .push(reg(2).with_post(OpCode::SaveReg))
        .build();
    SyscallPoint::new(NR_WRITE)
        .with_arg(ArgDescriptor::new(0, Phase::Enter))
        .with_arg(ArgDescriptor::new(1, Phase::Enter))
        .with_arg(ArgDescriptor::new(2, Phase::Enter))
        .with_enter(enter)
}

/// execve(pathname, argv, envp): path string plus a bounded argv walk.
/// Each iteration saves the element pointer and its string into one slot,
/// then steps the cursor; a null or faulted element kills the loop.
fn execve_point(store: &mut ProgramStore) -> SyscallPoint {
    let enter = store
        .instructions_mut()
        .program()
        .op(OpCode::ResetCtx)
        .push(reg(0).with_post(OpCode::MoveRegValue))
        .op(OpCode::SaveString)
        .op(OpCode::ResetCtx)
        .push(reg(1).with_post(OpCode::MoveRegValue))
        .op(OpCode::SetTmpValue)
        .op_value(OpCode::SetBreakCount, ARGV_WALK_BOUND)
        .op(OpCode::ForBreak)
        .op(OpCode::MoveTmpValue)
        .push(
            Instruction::new(OpCode::SavePtrString)
                .with_post(OpCode::AddOffset)
                .with_value(8),
        )
        .op(OpCode::SetTmpValue)
        .op(OpCode::ForBreak)
        .build();
    SyscallPoint::new(NR_EXECVE)
        .with_arg(ArgDescriptor::new(0, Phase::Enter).probed())
        .with_arg(ArgDescriptor::new(1, Phase::Enter).probed())
        .with_enter(enter)
}

fn clone_point(store: &mut ProgramStore) -> SyscallPoint {
    let enter = store
        .instructions_mut()
        .program()
        .op(OpCode::ResetCtx)
        .push(reg(0).with_post(OpCode::SaveReg))
        .op(OpCode::ResetCtx)
        .push(reg(1).with_post(OpCode::SaveReg))
        .build();
    SyscallPoint::new(NR_CLONE)
        .with_arg(ArgDescriptor::new(0, Phase::Enter))
        .with_arg(ArgDescriptor::new(1, Phase::Enter))
        .with_enter(enter)
}

/// `name` for every preset; mirrors what `default_store` installs.
pub fn preset_names() -> &'static [&'static str] {
    &["openat", "close", "read", "write", "execve", "clone"]
}
