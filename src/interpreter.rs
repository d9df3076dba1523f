//! The extraction program interpreter.
//!
//! A run executes one phase program against a frozen register file and the
//! task's memory, appending framed fields to an event buffer. The machine is
//! deliberately tiny: no stack, no branches except one bounded loop, and a
//! hard step cap so a hostile or buggy program can never wedge a capture
//! handler.
//!
//! # Machine model
//!
//! The mutable state lives in `ExecutionContext`:
//!
//! ```text
//! reg_index      which register ReadReg loads
//! reg_value      last register load
//! read_addr      current working address
//! pointer_value  last dereference result
//! tmp_value      scratch slot, survives ResetCtx
//! read_len       byte length for SaveStruct
//! break_count    loop bound, clamped to MAX_LOOP_COUNT
//! loop_count     loop progress
//! loop_index     rewind cursor for the active loop
//! save_index     next output slot
//! reg_0          first syscall argument, pinned at the enter edge
//! ```
//!
//! Instructions may carry companions: `pre_code` is folded into specific
//! operations (`ReadReg`, `ReadPointer`, `SaveStruct`) to apply the immediate
//! before the main effect, and `post_code` executes as the following step
//! with the carrying instruction's immediate still in scope. Each carried
//! step counts against the step cap.
//!
//! # Loop protocol
//!
//! A program loops by placing `ForBreak` at both ends of the body. The first
//! encounter records the body start; each later encounter either rewinds the
//! cursor or, once `loop_count` reaches `break_count`, zeroes the loop
//! bookkeeping and falls through. Loops do not nest; a second loop may follow
//! the first, but a loop inside a loop is unsupported.
//!
//! # Failure policy
//!
//! A malformed program (unknown instruction key, register index past the
//! file) aborts the run with `VmError`; the caller discards the buffer. A
//! failed memory read never aborts: the affected field is recorded with zero
//! length and the run continues.

use crate::arch::{strip_pointer_tags, RegisterFile, REG_COUNT};
use crate::event::EventBuffer;
use crate::filter::{ArgAction, ArgRule};
use crate::memory::UserMemory;
use crate::program::{Instruction, InstructionKey, InstructionTable, OpCode, Program, MAX_OP_COUNT};
use thiserror::Error;
use tracing::trace;

/// Iteration bound for the loop protocol.
pub const MAX_LOOP_COUNT: u64 = 32;

/// Byte cap for one `SaveStruct` field.
pub const MAX_BYTES_ARR_SIZE: u64 = 4096;

/// Byte cap for one captured string, terminator included.
pub const MAX_STRING_SIZE: usize = 4096;

/// Errors for malformed extraction programs
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("register index {index} out of range (file holds {max})")]
    RegisterOutOfRange { index: u64, max: usize },

    #[error("unknown instruction key {key}")]
    UnknownInstruction { key: InstructionKey },
}

pub type Result<T> = std::result::Result<T, VmError>;

/// How a run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Ran to the end of the program, a `Skip`, or the step cap.
    Completed,
    /// An argument-content rule rejected the invocation; the caller must
    /// discard everything the run emitted.
    ShortCircuited,
}

/// Per-invocation interpreter state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    pub reg_index: u64,
    pub reg_value: u64,
    pub read_addr: u64,
    pub pointer_value: u64,
    pub tmp_value: u64,
    pub read_len: u64,
    pub break_count: u64,
    pub loop_count: u64,
    pub loop_index: usize,
    pub save_index: u32,
    pub reg_0: u64,
}

impl ExecutionContext {
    /// Fresh context with the pinned first argument and the slot to start
    /// emitting at.
    pub fn new(reg_0: u64, save_index: u32) -> Self {
        Self {
            reg_0,
            save_index,
            ..Self::default()
        }
    }

    /// `ResetCtx`: clear the transient fields. Scratch, loop bookkeeping,
    /// and the output slot survive.
    fn reset_transients(&mut self) {
        self.break_count = 0;
        self.reg_index = 0;
        self.read_addr = 0;
        self.read_len = 0;
        self.reg_value = 0;
        self.pointer_value = 0;
    }
}

/// Executes programs against one syscall edge.
pub struct Interpreter<'a, M: UserMemory> {
    table: &'a InstructionTable,
    regs: &'a RegisterFile,
    memory: &'a M,
    rules: &'a [ArgRule],
}

impl<'a, M: UserMemory> Interpreter<'a, M> {
    pub fn new(table: &'a InstructionTable, regs: &'a RegisterFile, memory: &'a M) -> Self {
        Self {
            table,
            regs,
            memory,
            rules: &[],
        }
    }

    /// Arm argument-content rules for this run. String payloads emitted by
    /// the program are matched as they appear.
    #[must_use]
    pub fn with_rules(mut self, rules: &'a [ArgRule]) -> Self {
        self.rules = rules;
        self
    }

    /// Execute `program`, appending fields to `buf`.
    pub fn run(
        &self,
        program: &Program,
        ctx: &mut ExecutionContext,
        buf: &mut EventBuffer,
    ) -> Result<RunOutcome> {
        let mut cursor = 0usize;
        let mut current = Instruction::new(OpCode::Skip);
        let mut pending_post: Option<OpCode> = None;
        let mut keep_pending = self
            .rules
            .iter()
            .any(|rule| rule.action == ArgAction::Keep);

        for _step in 0..MAX_OP_COUNT {
            let code = match pending_post.take() {
                Some(post) => post,
                None => {
                    let Some(key) = program.get(cursor) else { break };
                    current = *self
                        .table
                        .get(key)
                        .ok_or(VmError::UnknownInstruction { key })?;
                    cursor += 1;
                    pending_post = current.post_code;
                    current.code
                }
            };
            if code == OpCode::Skip {
                break;
            }
            trace!(?code, cursor, save_index = ctx.save_index, "step");

            match code {
                OpCode::Skip => unreachable!("handled above"),
                OpCode::ResetCtx => ctx.reset_transients(),
                OpCode::SetRegIndex => ctx.reg_index = current.value,
                OpCode::SetReadLen => ctx.read_len = current.value,
                OpCode::SetReadLenRegValue => {
                    if ctx.read_len > ctx.reg_value {
                        ctx.read_len = ctx.reg_value;
                    }
                }
                OpCode::SetReadLenPointerValue => {
                    if ctx.read_len > ctx.pointer_value {
                        ctx.read_len = ctx.pointer_value;
                    }
                }
                OpCode::SetReadCount => {
                    ctx.read_len = ctx.read_len.wrapping_mul(current.value);
                }
                OpCode::AddOffset => {
                    ctx.read_addr = ctx.read_addr.wrapping_add(current.value);
                }
                OpCode::SubOffset => {
                    ctx.read_addr = ctx.read_addr.wrapping_sub(current.value);
                }
                OpCode::MoveRegValue => ctx.read_addr = ctx.reg_value,
                OpCode::MovePointerValue => ctx.read_addr = ctx.pointer_value,
                OpCode::MoveTmpValue => ctx.read_addr = ctx.tmp_value,
                OpCode::SetTmpValue => ctx.tmp_value = ctx.read_addr,
                OpCode::ForBreak => {
                    if ctx.loop_count == 0 {
                        ctx.loop_index = cursor;
                    }
                    if ctx.loop_count >= ctx.break_count {
                        ctx.loop_count = 0;
                        ctx.break_count = 0;
                        ctx.loop_index = 0;
                    } else {
                        ctx.loop_count += 1;
                        cursor = ctx.loop_index;
                    }
                }
                OpCode::SetBreakCount => {
                    ctx.break_count = MAX_LOOP_COUNT.min(current.value);
                }
                OpCode::SetBreakCountRegValue => {
                    ctx.break_count = MAX_LOOP_COUNT.min(ctx.reg_value);
                }
                OpCode::SetBreakCountPointerValue => {
                    ctx.break_count = MAX_LOOP_COUNT.min(ctx.pointer_value);
                }
                OpCode::SaveAddr => {
                    self.emit_u64(buf, ctx, ctx.read_addr);
                    ctx.save_index += 1;
                }
                OpCode::ReadReg => {
                    if current.pre_code == Some(OpCode::SetRegIndex) {
                        ctx.reg_index = current.value;
                    }
                    if ctx.reg_index >= REG_COUNT as u64 {
                        return Err(VmError::RegisterOutOfRange {
                            index: ctx.reg_index,
                            max: REG_COUNT,
                        });
                    }
                    ctx.reg_value = if ctx.reg_index == 0 {
                        ctx.reg_0
                    } else {
                        self.regs.regs[ctx.reg_index as usize]
                    };
                }
                OpCode::SaveReg => {
                    self.emit_u64(buf, ctx, ctx.reg_value);
                    ctx.save_index += 1;
                }
                OpCode::ReadPointer => {
                    let addr = match current.pre_code {
                        Some(OpCode::AddOffset) => ctx.read_addr.wrapping_add(current.value),
                        Some(OpCode::SubOffset) => ctx.read_addr.wrapping_sub(current.value),
                        _ => ctx.read_addr,
                    };
                    ctx.pointer_value = self
                        .memory
                        .read_u64(strip_pointer_tags(addr))
                        .unwrap_or(0);
                }
                OpCode::SavePointer => {
                    self.emit_u64(buf, ctx, ctx.pointer_value);
                    ctx.save_index += 1;
                }
                OpCode::SaveStruct => {
                    if current.pre_code == Some(OpCode::SetReadCount) {
                        ctx.read_len = ctx.read_len.wrapping_mul(current.value);
                    }
                    let len = ctx.read_len.min(MAX_BYTES_ARR_SIZE) as usize;
                    let addr = strip_pointer_tags(ctx.read_addr);
                    let mut bytes = vec![0u8; len];
                    let slot = ctx.save_index as u8;
                    match self.memory.read_bytes(addr, &mut bytes) {
                        Ok(()) => {
                            if !buf.push_bytes(slot, &bytes) {
                                buf.push_empty(slot);
                            }
                        }
                        Err(_) => {
                            buf.push_empty(slot);
                        }
                    }
                    ctx.save_index += 1;
                }
                OpCode::SaveString => {
                    let addr = strip_pointer_tags(ctx.read_addr);
                    let slot = ctx.save_index as u8;
                    match self.memory.read_string(addr, MAX_STRING_SIZE) {
                        Ok(s) => {
                            if self.string_rejected(&s, &mut keep_pending) {
                                return Ok(RunOutcome::ShortCircuited);
                            }
                            if !buf.push_bytes(slot, &s) {
                                buf.push_empty(slot);
                            }
                        }
                        Err(_) => {
                            buf.push_empty(slot);
                        }
                    }
                    ctx.save_index += 1;
                }
                OpCode::SavePtrString => {
                    let slot = ctx.save_index as u8;
                    let inner = self
                        .memory
                        .read_u64(strip_pointer_tags(ctx.read_addr))
                        .unwrap_or(0);
                    self.emit_u64(buf, ctx, inner);
                    match self.memory.read_string(strip_pointer_tags(inner), MAX_STRING_SIZE) {
                        Ok(s) => {
                            if self.string_rejected(&s, &mut keep_pending) {
                                return Ok(RunOutcome::ShortCircuited);
                            }
                            if !buf.push_bytes(slot, &s) {
                                buf.push_empty(slot);
                            }
                        }
                        Err(_) => {
                            buf.push_empty(slot);
                            // string array walks end on the first dead slot
                            ctx.loop_count = ctx.break_count;
                        }
                    }
                    ctx.save_index += 1;
                }
            }
        }

        if keep_pending {
            return Ok(RunOutcome::ShortCircuited);
        }
        Ok(RunOutcome::Completed)
    }

    /// Scalar append at the current slot, empty fallback if the buffer is
    /// out of room.
    fn emit_u64(&self, buf: &mut EventBuffer, ctx: &ExecutionContext, value: u64) {
        let slot = ctx.save_index as u8;
        if !buf.push_u64(slot, value) {
            buf.push_empty(slot);
        }
    }

    /// Match an emitted string against the armed rules. Returns true when a
    /// drop rule fires; clears `keep_pending` when a keep rule matches.
    fn string_rejected(&self, payload: &[u8], keep_pending: &mut bool) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let text = match payload.split_last() {
            Some((0, head)) => head,
            _ => payload,
        };
        for rule in self.rules {
            match rule.action {
                ArgAction::Drop => {
                    if rule.pattern.is_match(text) {
                        return true;
                    }
                }
                ArgAction::Keep => {
                    if *keep_pending && rule.pattern.is_match(text) {
                        *keep_pending = false;
                    }
                }
            }
        }
        false
    }
}
