//! The submission seam between capture and transport.
//!
//! Capture handlers hand finished events to an `EventSink` and move on;
//! what happens next (printing, serialization, shipping) is the consumer's
//! problem. `RingBufferSink` is the production implementation: a lock-free
//! bounded queue that drops on overflow rather than ever blocking a capture
//! handler. Draining it is the consumer's job.

use crate::event::CapturedEvent;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Receives completed capture events.
pub trait EventSink: Send + Sync {
    fn submit(&self, event: CapturedEvent);
}

/// Lock-free bounded sink.
pub struct RingBufferSink {
    queue: ArrayQueue<CapturedEvent>,
    total_pushed: AtomicU64,
    total_dropped: AtomicU64,
}

impl RingBufferSink {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "sink capacity must be > 0");
        Self {
            queue: ArrayQueue::new(capacity),
            total_pushed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn pop(&self) -> Option<CapturedEvent> {
        self.queue.pop()
    }

    /// Pop up to `max` queued events.
    pub fn drain(&self, max: usize) -> Vec<CapturedEvent> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.queue.pop() {
                Some(event) => out.push(event),
                None => break,
            }
        }
        out
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }
}

impl EventSink for RingBufferSink {
    fn submit(&self, event: CapturedEvent) {
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        if self.queue.push(event).is_err() {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("event sink full, dropping");
        }
    }
}

/// Sink counters.
#[derive(Debug, Clone, Copy)]
pub struct SinkStats {
    pub total_pushed: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl SinkStats {
    pub fn drop_rate(&self) -> f64 {
        if self.total_pushed == 0 {
            0.0
        } else {
            self.total_dropped as f64 / self.total_pushed as f64
        }
    }
}

/// Unbounded in-memory sink for tests.
#[derive(Debug, Default)]
pub struct VecSink {
    events: Mutex<Vec<CapturedEvent>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything submitted so far.
    pub fn take(&self) -> Vec<CapturedEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for VecSink {
    fn submit(&self, event: CapturedEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
