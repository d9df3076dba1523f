//! Extraction programs: the op codes, instructions, and the shared
//! instruction table.
//!
//! A program is a flat list of instruction keys; the instructions themselves
//! live once in an `InstructionTable` and are shared by every program that
//! uses them. Instructions are structurally interned, so two programs that
//! both say "read x1" reference the same table entry.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Hard cap on program length, and on interpreter steps per run.
pub const MAX_OP_COUNT: usize = 256;

/// The closed set of interpreter operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    /// End the run.
    Skip,
    /// Clear the transient context fields.
    ResetCtx,
    SetRegIndex,
    SetReadLen,
    SetReadLenRegValue,
    SetReadLenPointerValue,
    SetReadCount,
    AddOffset,
    SubOffset,
    MoveRegValue,
    MovePointerValue,
    MoveTmpValue,
    SetTmpValue,
    /// Loop head/tail marker; see the interpreter for the rewind protocol.
    ForBreak,
    SetBreakCount,
    SetBreakCountRegValue,
    SetBreakCountPointerValue,
    SaveAddr,
    ReadReg,
    SaveReg,
    ReadPointer,
    SavePointer,
    SaveStruct,
    SaveString,
    SavePtrString,
}

/// One table entry: an operation plus its carried companions.
///
/// `pre_code` is consulted inside specific operations (`ReadReg`,
/// `ReadPointer`, `SaveStruct`) to reuse the immediate before the main
/// effect; `post_code` runs as the next step with this instruction's
/// immediate still in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub code: OpCode,
    pub pre_code: Option<OpCode>,
    pub post_code: Option<OpCode>,
    pub value: u64,
}

impl Instruction {
    pub fn new(code: OpCode) -> Self {
        Self {
            code,
            pre_code: None,
            post_code: None,
            value: 0,
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: u64) -> Self {
        self.value = value;
        self
    }

    #[must_use]
    pub fn with_pre(mut self, code: OpCode) -> Self {
        self.pre_code = Some(code);
        self
    }

    #[must_use]
    pub fn with_post(mut self, code: OpCode) -> Self {
        self.post_code = Some(code);
        self
    }
}

/// Key of an interned instruction.
pub type InstructionKey = u32;

/// Shared, append-only instruction storage with structural interning.
#[derive(Debug, Default, Clone)]
pub struct InstructionTable {
    entries: Vec<Instruction>,
    interned: FnvHashMap<Instruction, InstructionKey>,
}

impl InstructionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an instruction, returning the key of the canonical copy.
    pub fn intern(&mut self, inst: Instruction) -> InstructionKey {
        if let Some(key) = self.interned.get(&inst) {
            return *key;
        }
        let key = self.entries.len() as InstructionKey;
        self.entries.push(inst);
        self.interned.insert(inst, key);
        key
    }

    pub fn get(&self, key: InstructionKey) -> Option<&Instruction> {
        self.entries.get(key as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start a program that interns into this table.
    pub fn program(&mut self) -> ProgramBuilder<'_> {
        ProgramBuilder {
            table: self,
            keys: Vec::new(),
        }
    }
}

/// An extraction program: instruction keys in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    keys: Vec<InstructionKey>,
}

impl Program {
    /// Build from raw keys, truncating anything past `MAX_OP_COUNT`.
    pub fn from_keys(mut keys: Vec<InstructionKey>) -> Self {
        if keys.len() > MAX_OP_COUNT {
            warn!(
                len = keys.len(),
                max = MAX_OP_COUNT,
                "program too long, truncating"
            );
            keys.truncate(MAX_OP_COUNT);
        }
        Self { keys }
    }

    pub fn get(&self, cursor: usize) -> Option<InstructionKey> {
        self.keys.get(cursor).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Fluent builder that interns each pushed instruction.
pub struct ProgramBuilder<'a> {
    table: &'a mut InstructionTable,
    keys: Vec<InstructionKey>,
}

impl ProgramBuilder<'_> {
    /// Push a bare operation.
    pub fn op(&mut self, code: OpCode) -> &mut Self {
        self.push(Instruction::new(code))
    }

    /// Push an operation with an immediate.
    pub fn op_value(&mut self, code: OpCode, value: u64) -> &mut Self {
        self.push(Instruction::new(code).with_value(value))
    }

    /// Push a fully specified instruction.
    pub fn push(&mut self, inst: Instruction) -> &mut Self {
        let key = self.table.intern(inst);
        self.keys.push(key);
        self
    }

    pub fn build(&mut self) -> Program {
        Program::from_keys(std::mem::take(&mut self.keys))
    }
}
