//! Filter ID allocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of unique, increasing filter IDs.
///
/// Seeded from the wall clock so IDs stay fresh across restarts without any
/// persisted counter. The ID doubles as the cache file stem, so a filter whose
/// URL changes never shares a file name with its previous content.
#[derive(Debug)]
pub struct IdAllocator {
    last: AtomicU64,
}

impl IdAllocator {
    /// Create an allocator seeded with the current unix time in seconds.
    pub fn new() -> Self {
        Self::after(0)
    }

    /// Like [`IdAllocator::new`], but never below `floor`.
    pub fn after(floor: u64) -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self::starting_at(secs.max(floor))
    }

    /// Create an allocator whose first ID will be `seed + 1`.
    pub fn starting_at(seed: u64) -> Self {
        Self {
            last: AtomicU64::new(seed),
        }
    }

    /// Allocate the next ID.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
