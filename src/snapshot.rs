//! Enter/exit correlation: register snapshots keyed by thread id.
//!
//! A thread has at most one syscall in flight, so one live snapshot per tid
//! is enough to pair the edges. The exit handler takes the snapshot out;
//! whatever it decides afterwards, the correlation row is already gone. The
//! `dropped` flag rides along so a rejected enter can poison its own exit.

use crate::arch::RegisterFile;
use fnv::FnvHashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Default bound on in-flight snapshots.
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 4096;

/// Argument registers pinned at the enter edge, plus the pair-suppression
/// flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub args: [u64; 6],
    pub dropped: bool,
}

impl RegisterSnapshot {
    /// Snapshot the argument bank of `regs`.
    pub fn of(regs: &RegisterFile) -> Self {
        Self {
            args: regs.args(),
            dropped: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    snapshot: RegisterSnapshot,
    stamp: Instant,
}

/// Bounded snapshot table.
///
/// Threads that die mid-syscall leave rows behind; the bound plus
/// [`purge_stale`](SnapshotStore::purge_stale) keep those from accumulating.
/// At capacity the stalest row is evicted, on the grounds that the oldest
/// in-flight call is the one least likely to ever see its exit.
#[derive(Debug)]
pub struct SnapshotStore {
    inner: Mutex<FnvHashMap<u32, Entry>>,
    capacity: usize,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SNAPSHOT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(FnvHashMap::default()),
            capacity,
        }
    }

    /// Store the snapshot for `tid`, replacing any previous one.
    pub fn insert(&self, tid: u32, snapshot: RegisterSnapshot) {
        let Ok(mut map) = self.inner.lock() else {
            return;
        };
        if map.len() >= self.capacity && !map.contains_key(&tid) {
            let stalest = map
                .iter()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(tid, _)| *tid);
            if let Some(victim) = stalest {
                map.remove(&victim);
                warn!(tid = victim, "snapshot table full, evicted stalest");
            }
        }
        map.insert(
            tid,
            Entry {
                snapshot,
                stamp: Instant::now(),
            },
        );
    }

    /// Remove and return the snapshot for `tid`.
    pub fn take(&self, tid: u32) -> Option<RegisterSnapshot> {
        let mut map = self.inner.lock().ok()?;
        map.remove(&tid).map(|e| e.snapshot)
    }

    /// Mark the in-flight call of `tid` so its exit emits nothing. Returns
    /// false when no snapshot is present.
    pub fn flag_dropped(&self, tid: u32) -> bool {
        let Ok(mut map) = self.inner.lock() else {
            return false;
        };
        match map.get_mut(&tid) {
            Some(entry) => {
                entry.snapshot.dropped = true;
                true
            }
            None => false,
        }
    }

    /// Drop rows older than `max_age`, returning how many went.
    pub fn purge_stale(&self, max_age: Duration) -> usize {
        let Ok(mut map) = self.inner.lock() else {
            return 0;
        };
        let before = map.len();
        let now = Instant::now();
        map.retain(|_, e| now.duration_since(e.stamp) <= max_age);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, tid: u32) -> bool {
        self.inner
            .lock()
            .map(|m| m.contains_key(&tid))
            .unwrap_or(false)
    }
}
