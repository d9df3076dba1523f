use anyhow::Result;
use clap::Parser;
use sondear::capture::{KillSignaler, SyscallCapture};
use sondear::cli::Cli;
use sondear::presets;
use sondear::sink::{EventSink, RingBufferSink};
use sondear::tracer::{trace_command, TraceSession};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Log to stderr, level taken from `RUST_LOG`.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing();

    if args.queue_size == 0 {
        anyhow::bail!("Invalid value for --queue-size: must be nonzero");
    }
    let Some(command) = args.command.clone() else {
        anyhow::bail!("Must specify a command. Usage: sondear [OPTIONS] -- COMMAND [ARGS...]");
    };

    let filter = args.filter_config()?;
    let store = presets::default_store()?;
    let sink = Arc::new(RingBufferSink::new(args.queue_size));
    let capture = SyscallCapture::new(
        Arc::new(store),
        Arc::new(filter),
        Arc::clone(&sink) as Arc<dyn EventSink>,
    )
    .with_signaler(Box::new(KillSignaler));

    let session = TraceSession {
        capture,
        sink,
        format: args.format,
        show_stats: args.statistics,
        follow_forks: args.follow_forks,
    };

    let code = trace_command(&command, &session)?;
    std::process::exit(code);
}
