//! In-memory collaborators for tests and examples.

use crate::FileStats;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

/// A [crate::Compactor] that records everything it is told.
#[derive(Default)]
pub struct Compactor {
    stats: Mutex<BTreeMap<i32, FileStats>>,
    released: Mutex<Vec<i32>>,
    reject: AtomicBool,
}

impl Compactor {
    /// Seed statistics for a data file (as the compactor would while running).
    pub fn set_stats(&self, file: i32, stats: FileStats) {
        self.stats.lock().insert(file, stats);
    }

    /// Make subsequent [crate::Compactor::add_free_file] calls fail.
    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::Release);
    }

    /// Statistics currently registered.
    pub fn stats(&self) -> BTreeMap<i32, FileStats> {
        self.stats.lock().clone()
    }

    /// Files whose statistics were released.
    pub fn released(&self) -> Vec<i32> {
        self.released.lock().clone()
    }
}

impl crate::Compactor for Compactor {
    fn add_free_file(
        &self,
        file: i32,
        total: i32,
        free: i32,
        next_expiration: i64,
        _immediate: bool,
    ) -> bool {
        if self.reject.load(Ordering::Acquire) {
            return false;
        }
        self.stats.lock().insert(
            file,
            FileStats {
                total,
                free,
                next_expiration,
            },
        );
        true
    }

    fn release_stats(&self, file: i32) {
        self.stats.lock().remove(&file);
        self.released.lock().push(file);
    }

    fn file_stats(&self) -> BTreeMap<i32, FileStats> {
        self.stats.lock().clone()
    }
}

/// A [crate::Staging] table that records conditional removals.
pub struct Staging {
    segments: u32,
    removed: Mutex<Vec<(u32, Vec<u8>, i32, i64)>>,
}

impl Staging {
    pub fn new(segments: u32) -> Self {
        Self {
            segments,
            removed: Mutex::new(Vec::new()),
        }
    }

    /// Every removal the index requested, in order.
    pub fn removals(&self) -> Vec<(u32, Vec<u8>, i32, i64)> {
        self.removed.lock().clone()
    }
}

impl crate::Staging for Staging {
    fn segment_max(&self) -> u32 {
        self.segments
    }

    fn remove_conditionally(&self, segment: u32, key: &[u8], file: i32, offset: i64) {
        self.removed
            .lock()
            .push((segment, key.to_vec(), file, offset));
    }
}
