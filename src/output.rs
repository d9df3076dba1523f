//! Output formats for captured events
//!
//! Two renderings over the same framed payloads: a one-line text form for
//! terminals and a JSON document for tooling. Field payloads are opaque
//! bytes at this layer; formatting guesses scalar width from the length
//! and falls back to hex.

use crate::event::{CapturedEvent, EventKind};
use crate::stats::StatsSummary;
use crate::syscalls::syscall_name;
use serde::{Deserialize, Serialize};

/// One framed field, hex-encoded; `text` carries a lossless printable
/// rendering when the payload is a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonField {
    pub slot: u8,
    pub hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A single captured syscall edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonEvent {
    /// Syscall name (e.g., "openat", "read")
    pub name: String,
    pub nr: u32,
    pub phase: String,
    pub pid: u32,
    pub tid: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comm: String,
    pub fields: Vec<JsonField>,
}

impl JsonEvent {
    pub fn from_event(event: &CapturedEvent) -> Self {
        let fields = event
            .buffer
            .fields()
            .into_iter()
            .map(|(slot, payload)| JsonField {
                slot,
                hex: hex::encode(payload),
                text: printable(payload),
            })
            .collect();
        Self {
            name: syscall_name(event.sysno).to_string(),
            nr: event.sysno,
            phase: phase_name(event.kind).to_string(),
            pid: event.task.pid,
            tid: event.task.tid,
            comm: event.task.comm.clone(),
            fields,
        }
    }
}

/// Capture-session counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSummary {
    pub total_events: u64,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSummary>,
}

/// Root JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonReport {
    /// Format version identifier
    pub version: String,
    /// Format name
    pub format: String,
    pub events: Vec<JsonEvent>,
    pub summary: JsonSummary,
}

impl JsonReport {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "sondear-json-v1".to_string(),
            events: Vec::new(),
            summary: JsonSummary {
                total_events: 0,
                exit_code: 0,
                stats: None,
            },
        }
    }

    pub fn add_event(&mut self, event: &CapturedEvent) {
        self.summary.total_events += 1;
        self.events.push(JsonEvent::from_event(event));
    }

    pub fn set_exit_code(&mut self, code: i32) {
        self.summary.exit_code = code;
    }

    pub fn set_stats(&mut self, stats: StatsSummary) {
        self.summary.stats = Some(stats);
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Default for JsonReport {
    fn default() -> Self {
        Self::new()
    }
}

fn phase_name(kind: EventKind) -> &'static str {
    match kind {
        EventKind::SyscallEnter => "enter",
        EventKind::SyscallExit => "exit",
    }
}

/// Printable rendering of a payload, with one trailing NUL stripped.
/// Returns `None` for anything that is not clean ASCII text.
fn printable(payload: &[u8]) -> Option<String> {
    let body = match payload.split_last() {
        Some((0, head)) => head,
        _ => payload,
    };
    if body.is_empty() {
        return None;
    }
    if body
        .iter()
        .all(|&b| (0x20..0x7f).contains(&b) || b == b'\n' || b == b'\t')
    {
        Some(String::from_utf8_lossy(body).into_owned())
    } else {
        None
    }
}

/// Terminal form of one field. Scalars as numbers, strings quoted,
/// everything else as truncated hex.
pub fn format_field(payload: &[u8]) -> String {
    const HEX_PREVIEW: usize = 32;
    if payload.is_empty() {
        return "-".to_string();
    }
    if payload.len() == 4 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(payload);
        return u32::from_le_bytes(raw).to_string();
    }
    if payload.len() == 8 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(payload);
        return format!("{:#x}", u64::from_le_bytes(raw));
    }
    if let Some(text) = printable(payload) {
        return format!("{text:?}");
    }
    if payload.len() > HEX_PREVIEW {
        format!(
            "0x{}... ({} bytes)",
            hex::encode(&payload[..HEX_PREVIEW]),
            payload.len()
        )
    } else {
        format!("0x{}", hex::encode(payload))
    }
}

/// One text line per event.
pub fn render_text(event: &CapturedEvent) -> String {
    let mut line = format!(
        "[{}:{}] {} {}({})",
        event.task.pid,
        event.task.tid,
        phase_name(event.kind),
        syscall_name(event.sysno),
        event.sysno,
    );
    for (slot, payload) in event.buffer.fields() {
        line.push_str(&format!(" {}={}", slot, format_field(payload)));
    }
    line
}
