//! Read/write conflict counters.
//!
//! These are diagnostic guards, not locks: they never block. Each guarded
//! resource keeps one reader and one writer counter per stage. Any number of
//! readers may overlap; a writer overlapping a reader or another writer is
//! reported as a conflict.

use std::sync::atomic::{AtomicI32, Ordering};

/// Kind of access being registered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Shared read access.
    Read,
    /// Exclusive write access.
    Write,
}

#[derive(Debug, Default)]
struct StageCounters {
    readers: AtomicI32,
    writers: AtomicI32,
}

/// Conflict counters for one resource (a table column or a sparse id).
#[derive(Debug)]
pub struct AccessCounters {
    stages: Box<[StageCounters]>,
}

impl AccessCounters {
    /// Creates counters for `stage_count` stages.
    #[must_use]
    pub fn new(stage_count: usize) -> Self {
        Self {
            stages: (0..stage_count.max(1))
                .map(|_| StageCounters::default())
                .collect(),
        }
    }

    fn totals(&self) -> (i32, i32) {
        self.stages.iter().fold((0, 0), |(r, w), s| {
            (
                r + s.readers.load(Ordering::Relaxed),
                w + s.writers.load(Ordering::Relaxed),
            )
        })
    }

    /// Registers an access from `stage`. Returns false on conflict, in
    /// which case nothing is registered.
    ///
    /// # Panics
    ///
    /// Panics if `stage` is out of range.
    #[must_use]
    pub fn begin(&self, stage: usize, mode: AccessMode) -> bool {
        let (readers, writers) = self.totals();
        let counters = &self.stages[stage];
        match mode {
            AccessMode::Read => {
                if writers > 0 {
                    return false;
                }
                counters.readers.fetch_add(1, Ordering::Relaxed);
            }
            AccessMode::Write => {
                if readers > 0 || writers > 0 {
                    return false;
                }
                counters.writers.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    /// Releases an access previously registered with [`Self::begin`].
    ///
    /// # Panics
    ///
    /// Panics if no matching access is registered.
    pub fn end(&self, stage: usize, mode: AccessMode) {
        let counter = match mode {
            AccessMode::Read => &self.stages[stage].readers,
            AccessMode::Write => &self.stages[stage].writers,
        };
        let previous = counter.fetch_sub(1, Ordering::Relaxed);
        assert!(previous > 0, "unbalanced end of {mode:?} access");
    }

    /// Current `(readers, writers)` summed over all stages.
    #[must_use]
    pub fn counts(&self) -> (i32, i32) {
        self.totals()
    }
}

impl Clone for AccessCounters {
    fn clone(&self) -> Self {
        Self::new(self.stages.len())
    }
}
