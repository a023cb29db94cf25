use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters maintained by the [`Catalog`](super::Catalog).
#[derive(Default, Debug)]
pub struct MappingStats {
    lookups: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    ids_created: AtomicU64,
    ids_deleted: AtomicU64,
    relocations: AtomicU64,
}

/// Point-in-time copy of [`MappingStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MappingStatsSnapshot {
    /// Position and id lookups served.
    pub lookups: u64,
    /// Lookups answered from the LRU caches.
    pub cache_hits: u64,
    /// Lookups that read a catalog or tree page.
    pub cache_misses: u64,
    /// Ids handed out.
    pub ids_created: u64,
    /// Ids turned into tombstones.
    pub ids_deleted: u64,
    /// Positions rewritten after tree splits.
    pub relocations: u64,
}

impl MappingStatsSnapshot {
    /// Share of lookups served from cache, `0.0` when there were none.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }
}

impl MappingStats {
    /// Copies the counters.
    pub fn snapshot(&self) -> MappingStatsSnapshot {
        MappingStatsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            ids_created: self.ids_created.load(Ordering::Relaxed),
            ids_deleted: self.ids_deleted.load(Ordering::Relaxed),
            relocations: self.relocations.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn lookup(&self, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn created(&self) {
        self.ids_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deleted(&self) {
        self.ids_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn relocated(&self, count: u64) {
        self.relocations.fetch_add(count, Ordering::Relaxed);
    }
}
