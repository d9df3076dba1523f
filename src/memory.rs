//! Access to the traced task's memory.
//!
//! The interpreter reads tracee memory through the `UserMemory` trait so the
//! same programs run against a live process (`ProcessVmReader`, backed by
//! `process_vm_readv`) or an in-memory image (`SparseMemory`) in tests and
//! benches. Reads never retry: a fault is reported to the caller, which
//! degrades the affected field and moves on.

use nix::errno::Errno;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use std::io::IoSliceMut;
use thiserror::Error;

/// Errors for tracee memory reads
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("read of {len} bytes at {addr:#x} faulted: {errno}")]
    Fault { addr: u64, len: usize, errno: Errno },

    #[error("short read at {addr:#x}: wanted {wanted}, got {got}")]
    Short {
        addr: u64,
        wanted: usize,
        got: usize,
    },
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// Read-only view of the traced task's address space.
pub trait UserMemory {
    /// Fill `buf` from `addr`. Either the whole buffer is filled or an
    /// error is returned; no partial fills.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Read a little-endian u64 at `addr`.
    fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a NUL-terminated string of at most `max` bytes.
    ///
    /// The terminator counts against `max` and is always present in the
    /// result: a string longer than the cap is truncated and re-terminated.
    /// A fault before the terminator fails the whole read.
    fn read_string(&self, addr: u64, max: usize) -> Result<Vec<u8>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(max.min(256));
        let mut byte = [0u8; 1];
        for i in 0..max {
            self.read_bytes(addr + i as u64, &mut byte)?;
            out.push(byte[0]);
            if byte[0] == 0 {
                return Ok(out);
            }
        }
        // cap reached without a terminator
        out[max - 1] = 0;
        Ok(out)
    }
}

/// Live tracee memory via `process_vm_readv`.
///
/// Requires ptrace attachment (or CAP_SYS_PTRACE) to the target.
#[derive(Debug, Clone, Copy)]
pub struct ProcessVmReader {
    pid: Pid,
}

impl ProcessVmReader {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    /// One vectored read, returning the number of bytes the kernel copied.
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len();
        let local = IoSliceMut::new(buf);
        let remote = RemoteIoVec {
            base: addr as usize,
            len,
        };
        process_vm_readv(self.pid, &mut [local], &[remote]).map_err(|errno| MemoryError::Fault {
            addr,
            len,
            errno,
        })
    }
}

impl UserMemory for ProcessVmReader {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let wanted = buf.len();
        let got = self.read_into(addr, buf)?;
        if got < wanted {
            return Err(MemoryError::Short { addr, wanted, got });
        }
        Ok(())
    }

    fn read_string(&self, addr: u64, max: usize) -> Result<Vec<u8>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        // Single vectored read; a string ending near an unmapped page comes
        // back as a partial fill, which is fine as long as the terminator
        // landed inside it.
        let mut buf = vec![0u8; max];
        let got = self.read_into(addr, &mut buf)?;
        if let Some(nul) = buf[..got].iter().position(|&b| b == 0) {
            buf.truncate(nul + 1);
            return Ok(buf);
        }
        if got < max {
            return Err(MemoryError::Short {
                addr,
                wanted: max,
                got,
            });
        }
        buf[max - 1] = 0;
        Ok(buf)
    }
}

/// In-memory byte map standing in for a tracee address space.
///
/// Unmapped addresses fault, which makes the interpreter's degraded paths
/// testable without a live process.
#[derive(Debug, Default, Clone)]
pub struct SparseMemory {
    bytes: fnv::FnvHashMap<u64, u8>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `data` starting at `addr`.
    pub fn map_bytes(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
    }

    /// Map a little-endian u64 at `addr`.
    pub fn map_u64(&mut self, addr: u64, value: u64) {
        self.map_bytes(addr, &value.to_le_bytes());
    }

    /// Map a string at `addr`, terminator included.
    pub fn map_str(&mut self, addr: u64, s: &str) {
        self.map_bytes(addr, s.as_bytes());
        self.bytes.insert(addr + s.len() as u64, 0);
    }
}

impl UserMemory for SparseMemory {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        for (i, slot) in buf.iter_mut().enumerate() {
            let at = addr + i as u64;
            match self.bytes.get(&at) {
                Some(b) => *slot = *b,
                None => {
                    return Err(MemoryError::Fault {
                        addr,
                        len: buf.len(),
                        errno: Errno::EFAULT,
                    })
                }
            }
        }
        Ok(())
    }
}
