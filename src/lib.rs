//! Sondear - programmable syscall argument capture
//!
//! A bytecode-driven capture engine: per-syscall programs describe which
//! registers to save and which pointers to chase, a small interpreter
//! executes them against a stopped task's registers and memory, and the
//! results are framed into bounded per-event buffers. Enter and exit
//! edges are correlated per task, with allow/deny filtering, content
//! rules and descendant tracking deciding what is captured.

pub mod arch;
pub mod capture;
pub mod cli;
pub mod event;
pub mod filter;
pub mod interpreter;
pub mod lineage;
pub mod memory;
pub mod output;
pub mod presets;
pub mod program;
pub mod sink;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod syscalls;
pub mod tracer;
