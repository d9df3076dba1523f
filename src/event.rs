//! Event records and the framed field buffer they carry.
//!
//! Every captured field is framed `[slot u8][len u32 LE][payload]`, scalars
//! included, so the consumer never needs per-field schema to walk a record.
//! A field that could not be materialized (bad pointer, buffer exhausted) is
//! present with a zero length rather than omitted; slot numbering stays
//! intact either way.

use serde::{Deserialize, Serialize};

/// Hard cap on the framed payload of one event.
pub const MAX_BUF_SIZE: usize = 32768;

/// Frame header: slot byte plus little-endian length.
const FRAME_HEADER: usize = 1 + 4;

/// Identity of the task that made the syscall.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    pub pid: u32,
    pub tid: u32,
    pub uid: u32,
    pub comm: String,
}

impl TaskContext {
    pub fn new(pid: u32, tid: u32) -> Self {
        Self {
            pid,
            tid,
            uid: 0,
            comm: String::new(),
        }
    }

    #[must_use]
    pub fn with_comm(mut self, comm: &str) -> Self {
        self.comm = comm.to_string();
        self
    }

    #[must_use]
    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }
}

/// Which syscall edge produced the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SyscallEnter,
    SyscallExit,
}

/// Append-only framed field buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBuffer {
    bytes: Vec<u8>,
    limit: usize,
    field_count: u32,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::with_limit(MAX_BUF_SIZE)
    }

    /// Buffer with a non-default cap. Tests use tiny limits to hit the
    /// exhaustion paths without megabyte payloads.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            field_count: 0,
        }
    }

    /// Append a framed payload. Returns false (writing nothing) when the
    /// frame would push the buffer past its cap.
    pub fn push_bytes(&mut self, slot: u8, payload: &[u8]) -> bool {
        if self.bytes.len() + FRAME_HEADER + payload.len() > self.limit {
            return false;
        }
        self.bytes.push(slot);
        self.bytes
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(payload);
        self.field_count += 1;
        true
    }

    /// Append a present-but-empty field for `slot`.
    pub fn push_empty(&mut self, slot: u8) -> bool {
        self.push_bytes(slot, &[])
    }

    pub fn push_u32(&mut self, slot: u8, value: u32) -> bool {
        self.push_bytes(slot, &value.to_le_bytes())
    }

    pub fn push_u64(&mut self, slot: u8, value: u64) -> bool {
        self.push_bytes(slot, &value.to_le_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn field_count(&self) -> u32 {
        self.field_count
    }

    /// Decode the frames back into `(slot, payload)` pairs.
    pub fn fields(&self) -> Vec<(u8, &[u8])> {
        let mut out = Vec::with_capacity(self.field_count as usize);
        let mut at = 0usize;
        while at + FRAME_HEADER <= self.bytes.len() {
            let slot = self.bytes[at];
            let len = u32::from_le_bytes([
                self.bytes[at + 1],
                self.bytes[at + 2],
                self.bytes[at + 3],
                self.bytes[at + 4],
            ]) as usize;
            let start = at + FRAME_HEADER;
            if start + len > self.bytes.len() {
                break;
            }
            out.push((slot, &self.bytes[start..start + len]));
            at = start + len;
        }
        out
    }
}

/// One completed capture, ready for the sink.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub task: TaskContext,
    pub kind: EventKind,
    pub sysno: u32,
    pub buffer: EventBuffer,
}

impl CapturedEvent {
    pub fn new(task: TaskContext, kind: EventKind, sysno: u32, buffer: EventBuffer) -> Self {
        Self {
            task,
            kind,
            sysno,
            buffer,
        }
    }
}
