//! Engine-wide counters. Everything is a relaxed atomic so hot paths pay
//! one uncontended RMW at most; `snapshot` gives a loosely consistent view.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct EngineStats {
    pub nmaps: AtomicU64,
    pub nunmaps: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub npurges_lazy: AtomicU64,
    pub npurges_forced: AtomicU64,
    pub pages_purged_lazy: AtomicU64,
    pub pages_purged_forced: AtomicU64,
    pub ncoalesces: AtomicU64,
}

/// Plain-data copy of [`EngineStats`] at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub nmaps: u64,
    pub nunmaps: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub npurges_lazy: u64,
    pub npurges_forced: u64,
    pub pages_purged_lazy: u64,
    pub pages_purged_forced: u64,
    pub ncoalesces: u64,
}

impl EngineStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            nmaps: self.nmaps.load(Ordering::Relaxed),
            nunmaps: self.nunmaps.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            npurges_lazy: self.npurges_lazy.load(Ordering::Relaxed),
            npurges_forced: self.npurges_forced.load(Ordering::Relaxed),
            pages_purged_lazy: self.pages_purged_lazy.load(Ordering::Relaxed),
            pages_purged_forced: self.pages_purged_forced.load(Ordering::Relaxed),
            ncoalesces: self.ncoalesces.load(Ordering::Relaxed),
        }
    }
}
