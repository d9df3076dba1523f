//! Register file abstraction for the traced task.
//!
//! Capture handlers receive one `RegisterFile` per syscall edge; the
//! interpreter only ever reads from it. The ABI flag picks the link register
//! for compat (32-bit) tasks, which keep their return address in r14 while
//! running on an aarch64 kernel.

use serde::{Deserialize, Serialize};

/// Number of addressable general-purpose registers (x0..x30).
pub const REG_COUNT: usize = 31;

/// Mask that clears MTE/TBI tag bits from a user-space pointer.
///
/// Tagged pointers carry metadata in the top byte; dereferencing them
/// verbatim faults. User addresses on untagged hosts never reach bit 56,
/// so the same mask is the identity there.
const POINTER_TAG_MASK: u64 = 0x00ff_ffff_ffff_ffff;

/// Strip MTE/TBI tag bits from a user-space address.
///
/// Applied immediately before each dereference; register values themselves
/// are captured unmasked so events still show the tags the task saw.
#[inline]
#[must_use]
pub fn strip_pointer_tags(addr: u64) -> u64 {
    addr & POINTER_TAG_MASK
}

/// Register width of the traced task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Abi {
    /// Native 64-bit task, link register in x30.
    Aarch64,
    /// Compat 32-bit task, link register in r14.
    Aarch32,
}

impl Abi {
    /// Index of the link register for this ABI.
    pub fn link_register(self) -> usize {
        match self {
            Abi::Aarch64 => 30,
            Abi::Aarch32 => 14,
        }
    }
}

impl Default for Abi {
    fn default() -> Self {
        Abi::Aarch64
    }
}

/// Snapshot of the general-purpose registers at a syscall edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterFile {
    /// x0..x30.
    pub regs: [u64; REG_COUNT],
    /// Stack pointer.
    pub sp: u64,
    /// Program counter.
    pub pc: u64,
}

impl RegisterFile {
    /// Register by index, `None` when out of range.
    pub fn get(&self, index: usize) -> Option<u64> {
        self.regs.get(index).copied()
    }

    /// Syscall argument register (x0..x5).
    ///
    /// # Panics
    ///
    /// Panics if `index >= 6`; argument indexes are fixed by the calling
    /// convention and validated long before this is reached.
    pub fn arg(&self, index: usize) -> u64 {
        assert!(index < 6, "syscall argument index out of range: {index}");
        self.regs[index]
    }

    /// Link register under the given ABI.
    pub fn link_register(&self, abi: Abi) -> u64 {
        self.regs[abi.link_register()]
    }

    /// First six registers, the syscall argument bank.
    pub fn args(&self) -> [u64; 6] {
        let mut out = [0u64; 6];
        out.copy_from_slice(&self.regs[..6]);
        out
    }
}
