use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters maintained by the [`Pager`](super::Pager).
#[derive(Default, Debug)]
pub struct PagerStats {
    disk_reads: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    disk_writes: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
    wal_frames: AtomicU64,
}

/// Point-in-time copy of [`PagerStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PagerStatsSnapshot {
    /// Pages read from the page file.
    pub disk_reads: u64,
    /// Reads answered from the page cache.
    pub cache_hits: u64,
    /// Reads that went to disk.
    pub cache_misses: u64,
    /// Pages written back at checkpoints.
    pub disk_writes: u64,
    /// Commits that wrote at least one page.
    pub commits: u64,
    /// Rollbacks of staged pages.
    pub rollbacks: u64,
    /// Pages handed out, reused or appended.
    pub allocations: u64,
    /// Pages returned to the free list.
    pub frees: u64,
    /// Frames appended to the write-ahead log.
    pub wal_frames: u64,
}

impl PagerStatsSnapshot {
    /// Share of page reads served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }
}

impl PagerStats {
    /// Copies the counters.
    pub fn snapshot(&self) -> PagerStatsSnapshot {
        PagerStatsSnapshot {
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            wal_frames: self.wal_frames.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn disk_read(&self) {
        Self::inc(&self.disk_reads, 1);
    }

    pub(crate) fn cache_hit(&self) {
        Self::inc(&self.cache_hits, 1);
    }

    pub(crate) fn cache_miss(&self) {
        Self::inc(&self.cache_misses, 1);
    }

    pub(crate) fn disk_writes(&self, pages: u64) {
        Self::inc(&self.disk_writes, pages);
    }

    pub(crate) fn commit(&self, frames: u64) {
        Self::inc(&self.commits, 1);
        Self::inc(&self.wal_frames, frames);
    }

    pub(crate) fn rollback(&self) {
        Self::inc(&self.rollbacks, 1);
    }

    pub(crate) fn allocation(&self) {
        Self::inc(&self.allocations, 1);
    }

    pub(crate) fn free(&self) {
        Self::inc(&self.frees, 1);
    }
}
