//! Descendant tracking: which processes belong to a traced lineage.
//!
//! The table maps each admitted process to its root ancestor; a root maps to
//! itself. Admission at a fork is a single parent lookup, and because the
//! child records the parent's root rather than the parent, grandchildren and
//! deeper descendants admit their own children through the same one lookup.

use fnv::FnvHashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Default bound on tracked processes.
pub const DEFAULT_LINEAGE_CAPACITY: usize = 8192;

/// Child-to-root ancestry table.
#[derive(Debug)]
pub struct LineageTable {
    inner: Mutex<FnvHashMap<u32, u32>>,
    capacity: usize,
}

impl Default for LineageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LineageTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LINEAGE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(FnvHashMap::default()),
            capacity,
        }
    }

    /// Start a lineage at `pid`. The root maps to itself.
    pub fn admit_root(&self, pid: u32) -> bool {
        self.insert(pid, pid)
    }

    /// Fork hook: admit `child` when `parent` is already tracked. Forks of
    /// untracked parents are ignored.
    pub fn observe_fork(&self, parent: u32, child: u32) -> bool {
        let root = {
            let Ok(map) = self.inner.lock() else {
                return false;
            };
            match map.get(&parent) {
                Some(root) => *root,
                None => return false,
            }
        };
        let admitted = self.insert(child, root);
        if admitted {
            debug!(parent, child, root, "descendant admitted");
        }
        admitted
    }

    pub fn is_traced(&self, pid: u32) -> bool {
        self.inner
            .lock()
            .map(|m| m.contains_key(&pid))
            .unwrap_or(false)
    }

    /// Root ancestor of `pid`, if tracked.
    pub fn root_of(&self, pid: u32) -> Option<u32> {
        let map = self.inner.lock().ok()?;
        map.get(&pid).copied()
    }

    /// Remove one process. Descendants previously admitted through it keep
    /// their own rows.
    pub fn forget(&self, pid: u32) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&pid);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.inner.lock() {
            map.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, pid: u32, root: u32) -> bool {
        let Ok(mut map) = self.inner.lock() else {
            return false;
        };
        if map.len() >= self.capacity && !map.contains_key(&pid) {
            warn!(pid, capacity = self.capacity, "lineage table full, not tracking");
            return false;
        }
        map.insert(pid, root);
        true
    }
}
