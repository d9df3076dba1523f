//! CLI argument parsing for Sondear

use crate::filter::{ArgAction, ArgRule, FilterConfig, TraceMode};
use crate::syscalls::syscall_number;
use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use nix::sys::signal::Signal;
use std::str::FromStr;

/// Output format for captured events
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "sondear")]
#[command(version)]
#[command(about = "Programmable syscall argument capture", long_about = None)]
pub struct Cli {
    /// Capture only the listed syscalls (names or numbers, comma separated)
    #[arg(short = 'e', long = "trace", value_name = "LIST")]
    pub trace: Option<String>,

    /// Never capture the listed syscalls
    #[arg(long = "deny", value_name = "LIST")]
    pub deny: Option<String>,

    /// Discard events whose captured strings match the pattern (repeatable)
    #[arg(long = "drop", value_name = "REGEX")]
    pub drop_patterns: Vec<String>,

    /// Capture only events with a string matching the pattern (repeatable)
    #[arg(long = "keep", value_name = "REGEX")]
    pub keep_patterns: Vec<String>,

    /// Deliver a signal to the task after each captured enter (name or number)
    #[arg(long = "signal", value_name = "SIG")]
    pub signal: Option<String>,

    /// Follow forks (capture child processes)
    #[arg(short = 'f', long = "follow-forks")]
    pub follow_forks: bool,

    /// Show capture statistics at exit
    #[arg(short = 'c', long = "summary")]
    pub statistics: bool,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Event queue capacity
    #[arg(long = "queue-size", value_name = "N", default_value = "8192")]
    pub queue_size: usize,

    /// Command to run under capture (everything after --)
    #[arg(last = true)]
    pub command: Option<Vec<String>>,
}

impl Cli {
    /// Filter built from the list, pattern and signal flags. A `--trace`
    /// list switches to listed mode; otherwise everything minus `--deny`.
    pub fn filter_config(&self) -> Result<FilterConfig> {
        let mode = if self.trace.is_some() {
            TraceMode::Listed
        } else {
            TraceMode::AllExceptDenied
        };
        let mut config = FilterConfig::new(mode);
        if let Some(raw) = &self.trace {
            for nr in parse_syscall_list(raw)? {
                config.lists.allow(nr);
            }
        }
        if let Some(raw) = &self.deny {
            for nr in parse_syscall_list(raw)? {
                config.lists.deny(nr);
            }
        }
        for pattern in &self.drop_patterns {
            config = config.with_rule(ArgRule::new(pattern, ArgAction::Drop)?);
        }
        for pattern in &self.keep_patterns {
            config = config.with_rule(ArgRule::new(pattern, ArgAction::Keep)?);
        }
        if let Some(raw) = &self.signal {
            config = config.with_signal(parse_signal(raw)?);
        }
        Ok(config)
    }
}

/// Comma-separated syscall names or numbers.
pub fn parse_syscall_list(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|tok| !tok.is_empty())
        .map(|tok| {
            if let Ok(nr) = tok.parse::<u32>() {
                return Ok(nr);
            }
            syscall_number(tok).ok_or_else(|| anyhow!("unknown syscall: {tok}"))
        })
        .collect()
}

fn parse_signal(raw: &str) -> Result<i32> {
    if let Ok(n) = raw.parse::<i32>() {
        return Ok(n);
    }
    let name = if raw.to_uppercase().starts_with("SIG") {
        raw.to_uppercase()
    } else {
        format!("SIG{}", raw.to_uppercase())
    };
    let signal = Signal::from_str(&name).map_err(|_| anyhow!("unknown signal: {raw}"))?;
    Ok(signal as i32)
}
