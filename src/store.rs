//! The program store: which syscalls are instrumented, and how.
//!
//! One `SyscallPoint` per syscall number carries the argument descriptors
//! and the phase programs. The store owns the shared instruction table the
//! programs reference into. Lookup misses mean "not instrumented" and cost
//! one hash probe; inserts validate register indexes so the interpreter can
//! trust descriptors at capture time.

use crate::arch::REG_COUNT;
use crate::program::{InstructionTable, Program};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Most descriptors a point may carry; extras are ignored.
pub const MAX_POINT_ARG_COUNT: usize = 6;

/// Bound on instrumented syscalls, mirroring a fixed-size kernel table.
pub const MAX_POINTS: usize = 512;

/// `aux` value carrying no marker.
pub const AUX_NONE: u32 = 0;

/// `aux` sentinel that arms argument-content rules for the invocation.
pub const AUX_SKIP: u32 = u32::MAX;

/// Errors for program store population
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("program store is full ({capacity} points)")]
    Full { capacity: usize },

    #[error("syscall {nr}: descriptor register index {reg} out of range")]
    RegisterOutOfRange { nr: u32, reg: u8 },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Which edge a descriptor applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Enter,
    Exit,
}

/// Where one syscall argument lives and how it participates in filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgDescriptor {
    /// Argument register index.
    pub reg: u8,
    pub phase: Phase,
    /// Auxiliary marker; `AUX_SKIP` arms argument-content rules while this
    /// point is captured.
    pub aux: u32,
}

impl ArgDescriptor {
    pub fn new(reg: u8, phase: Phase) -> Self {
        Self {
            reg,
            phase,
            aux: AUX_NONE,
        }
    }

    /// Mark this argument as the content-rule probe.
    #[must_use]
    pub fn probed(mut self) -> Self {
        self.aux = AUX_SKIP;
        self
    }

    pub fn arms_rules(&self) -> bool {
        self.aux == AUX_SKIP
    }
}

/// Instrumentation for one syscall number.
#[derive(Debug, Clone, Default)]
pub struct SyscallPoint {
    pub nr: u32,
    args: Vec<ArgDescriptor>,
    pub enter_program: Option<Program>,
    pub exit_program: Option<Program>,
    pub ret_descriptor: Option<ArgDescriptor>,
    pub ret_program: Option<Program>,
}

impl SyscallPoint {
    pub fn new(nr: u32) -> Self {
        Self {
            nr,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_arg(mut self, desc: ArgDescriptor) -> Self {
        self.args.push(desc);
        self
    }

    #[must_use]
    pub fn with_enter(mut self, program: Program) -> Self {
        self.enter_program = Some(program);
        self
    }

    #[must_use]
    pub fn with_exit(mut self, program: Program) -> Self {
        self.exit_program = Some(program);
        self
    }

    #[must_use]
    pub fn with_ret(mut self, desc: ArgDescriptor, program: Program) -> Self {
        self.ret_descriptor = Some(desc);
        self.ret_program = Some(program);
        self
    }

    /// Descriptors, clamped to the fixed maximum before any iteration.
    pub fn descriptors(&self) -> &[ArgDescriptor] {
        &self.args[..self.args.len().min(MAX_POINT_ARG_COUNT)]
    }

    /// Whether content rules are armed for the given phase.
    pub fn arms_rules(&self, phase: Phase) -> bool {
        let in_args = self
            .descriptors()
            .iter()
            .any(|d| d.phase == phase && d.arms_rules());
        if in_args {
            return true;
        }
        phase == Phase::Exit
            && self
                .ret_descriptor
                .as_ref()
                .is_some_and(ArgDescriptor::arms_rules)
    }
}

/// Bounded map of instrumented syscalls plus their shared instructions.
#[derive(Debug, Default, Clone)]
pub struct ProgramStore {
    table: InstructionTable,
    points: FnvHashMap<u32, SyscallPoint>,
    capacity: usize,
}

impl ProgramStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_POINTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: InstructionTable::new(),
            points: FnvHashMap::default(),
            capacity,
        }
    }

    pub fn instructions(&self) -> &InstructionTable {
        &self.table
    }

    /// Table access for program construction.
    pub fn instructions_mut(&mut self) -> &mut InstructionTable {
        &mut self.table
    }

    /// Insert or replace a point. Register indexes are checked here so the
    /// capture path never sees an invalid descriptor.
    pub fn insert(&mut self, point: SyscallPoint) -> Result<()> {
        for desc in point
            .args
            .iter()
            .chain(point.ret_descriptor.as_ref())
        {
            if usize::from(desc.reg) >= REG_COUNT {
                return Err(StoreError::RegisterOutOfRange {
                    nr: point.nr,
                    reg: desc.reg,
                });
            }
        }
        if point.args.len() > MAX_POINT_ARG_COUNT {
            warn!(
                nr = point.nr,
                count = point.args.len(),
                max = MAX_POINT_ARG_COUNT,
                "descriptor overflow, extras ignored"
            );
        }
        if !self.points.contains_key(&point.nr) && self.points.len() >= self.capacity {
            warn!(nr = point.nr, capacity = self.capacity, "program store full");
            return Err(StoreError::Full {
                capacity: self.capacity,
            });
        }
        self.points.insert(point.nr, point);
        Ok(())
    }

    pub fn lookup(&self, nr: u32) -> Option<&SyscallPoint> {
        self.points.get(&nr)
    }

    pub fn contains(&self, nr: u32) -> bool {
        self.points.contains_key(&nr)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Instrumented syscall numbers, unordered.
    pub fn numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.points.keys().copied()
    }
}
