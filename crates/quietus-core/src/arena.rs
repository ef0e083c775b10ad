//! Per-arena extent supply and reclamation.
//!
//! Each arena owns three warmth-ordered extent caches (dirty, muzzy,
//! retained), a decay scheduler for the two purgeable tiers, the extent
//! record slab, and the address map used for coalescing. Allocation pulls
//! from the warmest cache that can satisfy the request, splitting oversized
//! extents; release drops extents into the dirty cache; decay passes walk
//! the caches cold-end-first, demoting extents one warmth state at a time
//! and issuing the matching page-reclamation syscall.
//!
//! Lock order within an arena: decay state lock, then the metadata lock,
//! then an extent-cache lock. The decay lock is never held across a purge
//! walk; the walk is serialized by the purging flag instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::config::EngineConfig;
use crate::decay::Decay;
use crate::ecache::Ecache;
use crate::edata::{Edata, EdataId, ExtentState};
use crate::emap::AddressMap;
use crate::error::MapError;
use crate::eset::Eset;
use crate::pages::{PAGE_SHIFT, PageOps};
use crate::stats::EngineStats;

/// The two warmth tiers with a decay schedule of their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecayTier {
    Dirty,
    Muzzy,
}

/// An extent handed out to the bin/slab layer. The holder must return it
/// through [`Arena::extent_release`] exactly once.
#[derive(Clone, Copy, Debug)]
pub struct ExtentLease {
    pub id: EdataId,
    pub base: usize,
    pub size: usize,
    /// Whether the memory is known zero-filled.
    pub zeroed: bool,
}

struct ArenaMeta {
    edatas: crate::edata::EdataArena,
    addr_map: AddressMap,
}

pub struct Arena {
    ind: u32,
    meta: Mutex<ArenaMeta>,
    dirty: Ecache,
    muzzy: Ecache,
    retained: Ecache,
    decay_dirty: Decay,
    decay_muzzy: Decay,
    sn_next: AtomicU64,
    pages: Arc<dyn PageOps>,
    stats: Arc<EngineStats>,
}

impl Arena {
    #[must_use]
    pub fn new(
        ind: u32,
        config: &EngineConfig,
        pages: Arc<dyn PageOps>,
        stats: Arc<EngineStats>,
        now_ns: u64,
    ) -> Self {
        let nsteps = config.smoothing_steps;
        Self {
            ind,
            meta: Mutex::new(ArenaMeta {
                edatas: crate::edata::EdataArena::new(),
                addr_map: AddressMap::new(),
            }),
            // Dirty frees are hot; defer their coalescing to eviction time.
            dirty: Ecache::new(ExtentState::Dirty, true),
            muzzy: Ecache::new(ExtentState::Muzzy, false),
            retained: Ecache::new(ExtentState::Retained, false),
            decay_dirty: Decay::new(
                config.dirty_decay_ms,
                nsteps,
                u64::from(ind) << 1,
                now_ns,
            ),
            decay_muzzy: Decay::new(
                config.muzzy_decay_ms,
                nsteps,
                (u64::from(ind) << 1) | 1,
                now_ns,
            ),
            sn_next: AtomicU64::new(0),
            pages,
            stats,
        }
    }

    #[must_use]
    pub fn ind(&self) -> u32 {
        self.ind
    }

    pub(crate) fn decay(&self, tier: DecayTier) -> &Decay {
        match tier {
            DecayTier::Dirty => &self.decay_dirty,
            DecayTier::Muzzy => &self.decay_muzzy,
        }
    }

    pub(crate) fn ecache(&self, tier: DecayTier) -> &Ecache {
        match tier {
            DecayTier::Dirty => &self.dirty,
            DecayTier::Muzzy => &self.muzzy,
        }
    }

    fn next_sn(&self) -> u64 {
        self.sn_next.fetch_add(1, Ordering::Relaxed)
    }

    /// Pages sitting in the purgeable caches.
    #[must_use]
    pub fn npages_cached(&self) -> usize {
        self.dirty.npages() + self.muzzy.npages()
    }

    #[must_use]
    pub fn npages_retained(&self) -> usize {
        self.retained.npages()
    }

    /// Acquires an extent of exactly `npages`, preferring the warmest cache
    /// and mapping fresh memory only when every tier misses. A fresh
    /// mapping failure is the only error; a cache miss alone is not.
    pub fn extent_acquire(&self, npages: usize, _now_ns: u64) -> Result<ExtentLease, MapError> {
        debug_assert!(npages > 0);
        for tier in [&self.dirty, &self.muzzy, &self.retained] {
            if let Some(lease) = self.cache_acquire(tier, npages) {
                EngineStats::bump(&self.stats.cache_hits);
                return Ok(lease);
            }
        }
        EngineStats::bump(&self.stats.cache_misses);
        self.extent_map_fresh(npages)
    }

    fn extent_map_fresh(&self, npages: usize) -> Result<ExtentLease, MapError> {
        let size = npages << PAGE_SHIFT;
        let base = self.pages.map(size)?;
        EngineStats::bump(&self.stats.nmaps);
        let sn = self.next_sn();
        let mut meta = self.meta.lock();
        let id = meta.edatas.alloc(Edata::new(base, size, self.ind, sn));
        Ok(ExtentLease {
            id,
            base,
            size,
            zeroed: true,
        })
    }

    /// Best-fit from one cache, splitting the found extent when it is
    /// larger than the request. Retained extents are recommitted before
    /// they are handed out; a commit failure leaves the extent cached and
    /// reports a miss.
    fn cache_acquire(&self, cache: &Ecache, npages: usize) -> Option<ExtentLease> {
        let mut meta_guard = self.meta.lock();
        let meta = &mut *meta_guard;
        let mut guard = cache.lock();
        let id = guard.fit(npages)?;
        let (base, size, committed) = {
            let edata = meta.edatas.get(id);
            (edata.base, edata.size, edata.committed)
        };
        cache.remove(&mut guard, id, meta.edatas.get(id));
        meta.addr_map.deregister(meta.edatas.get(id));
        drop(guard);

        if !committed && !self.pages.commit(base, size) {
            // Give the extent back untouched.
            let mut guard = cache.lock();
            meta.addr_map.register(meta.edatas.get(id), id);
            cache.insert(&mut guard, id, meta.edatas.get(id));
            return None;
        }

        let want = npages << PAGE_SHIFT;
        if size > want {
            self.split_remainder(meta, cache, id, want);
        }
        let edata = meta.edatas.get_mut(id);
        edata.size = want;
        edata.committed = true;
        edata.set_state(ExtentState::Active);
        let zeroed = edata.zeroed;
        Some(ExtentLease {
            id,
            base,
            size: want,
            zeroed,
        })
    }

    /// Carves the tail of extent `id` off into a new record and returns it
    /// to `cache`. The remainder keeps the donor's state, serial number,
    /// and flags, so its position in the decay ordering is unchanged.
    fn split_remainder(&self, meta: &mut ArenaMeta, cache: &Ecache, id: EdataId, keep: usize) {
        let (rem_base, rem_size, state, sn, committed, zeroed) = {
            let edata = meta.edatas.get(id);
            debug_assert!(edata.size > keep);
            (
                edata.base + keep,
                edata.size - keep,
                edata.state,
                edata.sn,
                edata.committed,
                edata.zeroed,
            )
        };
        let mut rem = Edata::new(rem_base, rem_size, self.ind, sn);
        rem.state = state;
        rem.committed = committed;
        rem.zeroed = zeroed;
        let rem_id = meta.edatas.alloc(rem);
        let mut guard = cache.lock();
        meta.addr_map.register(meta.edatas.get(rem_id), rem_id);
        cache.insert(&mut guard, rem_id, meta.edatas.get(rem_id));
    }

    /// Returns a leased extent to the dirty cache. Coalescing with
    /// neighbors is deferred to eviction for the dirty tier. Returns the
    /// number of pages released, for decay-tick accounting.
    pub fn extent_release(&self, lease: ExtentLease) -> usize {
        let npages = lease.size >> PAGE_SHIFT;
        let mut meta_guard = self.meta.lock();
        let meta = &mut *meta_guard;
        {
            let edata = meta.edatas.get_mut(lease.id);
            debug_assert_eq!(edata.state, ExtentState::Active);
            debug_assert_eq!(edata.base, lease.base);
            edata.set_state(ExtentState::Dirty);
            edata.zeroed = false;
        }
        let mut guard = self.dirty.lock();
        meta.addr_map.register(meta.edatas.get(lease.id), lease.id);
        self.dirty.insert(&mut guard, lease.id, meta.edatas.get(lease.id));
        if !self.dirty.delay_coalesce() {
            self.coalesce_locked(meta, &self.dirty, &mut guard, lease.id);
        }
        npages
    }

    /// Merges `id` with any address-adjacent extents in the same cache.
    /// The merged extent keeps the lower base and the older serial number.
    /// Returns the surviving handle.
    fn coalesce_locked(
        &self,
        meta: &mut ArenaMeta,
        cache: &Ecache,
        guard: &mut MutexGuard<'_, Eset>,
        id: EdataId,
    ) -> EdataId {
        let state = cache.state();
        loop {
            let (base, end) = {
                let edata = meta.edatas.get(id);
                (edata.base, edata.end())
            };
            let forward = meta
                .addr_map
                .at(end)
                .filter(|n| meta.edatas.get(*n).state == state);
            let backward = meta.addr_map.below(base).filter(|n| {
                let edata = meta.edatas.get(*n);
                edata.state == state && edata.end() == base
            });
            let Some(neighbor) = forward.or(backward) else {
                return id;
            };
            cache.remove(guard, id, meta.edatas.get(id));
            meta.addr_map.deregister(meta.edatas.get(id));
            cache.remove(guard, neighbor, meta.edatas.get(neighbor));
            meta.addr_map.deregister(meta.edatas.get(neighbor));
            let absorbed = meta.edatas.dalloc(neighbor);
            {
                let edata = meta.edatas.get_mut(id);
                edata.base = edata.base.min(absorbed.base);
                edata.size += absorbed.size;
                edata.sn = edata.sn.min(absorbed.sn);
                edata.zeroed &= absorbed.zeroed;
                edata.committed &= absorbed.committed;
            }
            meta.addr_map.register(meta.edatas.get(id), id);
            cache.insert(guard, id, meta.edatas.get(id));
            EngineStats::bump(&self.stats.ncoalesces);
        }
    }

    /// One decay pass over both tiers. Cheap when neither deadline has
    /// been reached.
    pub fn decay_tick(&self, now_ns: u64) {
        self.maybe_decay(DecayTier::Dirty, now_ns);
        self.maybe_decay(DecayTier::Muzzy, now_ns);
    }

    fn maybe_decay(&self, tier: DecayTier, now_ns: u64) {
        let decay = self.decay(tier);
        if decay.never() {
            return;
        }
        if decay.eager() {
            if self.ecache(tier).npages() > 0 {
                self.purge_to_limit(tier, 0);
            }
            return;
        }
        let limit = {
            let mut state = decay.lock();
            let current = self.ecache(tier).npages();
            decay.maybe_advance_epoch(&mut state, now_ns, current);
            let limit = state.npages_limit(current);
            if current <= limit {
                return;
            }
            limit
        };
        self.purge_to_limit(tier, limit);
    }

    /// Purges `tier` down to `limit` pages. A sweep already in progress on
    /// the same tier makes this a no-op rather than a blocking wait.
    pub fn purge_to_limit(&self, tier: DecayTier, limit: usize) {
        let decay = self.decay(tier);
        {
            let mut state = decay.lock();
            if state.purging() {
                return;
            }
            state.purging_set(true);
        }
        self.purge_walk(tier, limit);
        decay.lock().purging_set(false);
    }

    fn purge_walk(&self, tier: DecayTier, limit: usize) {
        let cache = self.ecache(tier);
        loop {
            let mut meta_guard = self.meta.lock();
            let meta = &mut *meta_guard;
            let mut guard = cache.lock();
            if guard.npages() <= limit {
                return;
            }
            let Some(head) = guard.lru_head() else {
                return;
            };
            let id = if cache.delay_coalesce() {
                self.coalesce_locked(meta, cache, &mut guard, head)
            } else {
                head
            };
            cache.remove(&mut guard, id, meta.edatas.get(id));
            meta.addr_map.deregister(meta.edatas.get(id));
            drop(guard);
            match tier {
                DecayTier::Dirty => self.demote_dirty(meta, id),
                DecayTier::Muzzy => self.demote_muzzy(meta, id),
            }
        }
    }

    /// Dirty extents normally demote to muzzy via an advisory purge. When
    /// the muzzy tier is eager or the advisory purge is unavailable, they
    /// demote straight to retained with a forced purge.
    fn demote_dirty(&self, meta: &mut ArenaMeta, id: EdataId) {
        let (base, size, npages) = {
            let edata = meta.edatas.get(id);
            (edata.base, edata.size, edata.npages())
        };
        let skip_muzzy = self.decay_muzzy.eager();
        if !skip_muzzy && self.pages.purge_lazy(base, size) {
            EngineStats::bump(&self.stats.npurges_lazy);
            EngineStats::add(&self.stats.pages_purged_lazy, npages as u64);
            let edata = meta.edatas.get_mut(id);
            edata.set_state(ExtentState::Muzzy);
            edata.zeroed = false;
            let mut guard = self.muzzy.lock();
            meta.addr_map.register(meta.edatas.get(id), id);
            self.muzzy.insert(&mut guard, id, meta.edatas.get(id));
            self.coalesce_locked(meta, &self.muzzy, &mut guard, id);
        } else {
            self.retain(meta, id);
        }
    }

    fn demote_muzzy(&self, meta: &mut ArenaMeta, id: EdataId) {
        self.retain(meta, id);
    }

    /// Forced purge plus decommit; the virtual reservation is kept.
    fn retain(&self, meta: &mut ArenaMeta, id: EdataId) {
        let (base, size, npages) = {
            let edata = meta.edatas.get(id);
            (edata.base, edata.size, edata.npages())
        };
        let purged = self.pages.purge_forced(base, size);
        if purged {
            EngineStats::bump(&self.stats.npurges_forced);
            EngineStats::add(&self.stats.pages_purged_forced, npages as u64);
        }
        let decommitted = self.pages.decommit(base, size);
        let edata = meta.edatas.get_mut(id);
        edata.set_state(ExtentState::Retained);
        edata.zeroed = purged;
        edata.committed = !decommitted;
        let mut guard = self.retained.lock();
        meta.addr_map.register(meta.edatas.get(id), id);
        self.retained.insert(&mut guard, id, meta.edatas.get(id));
        self.coalesce_locked(meta, &self.retained, &mut guard, id);
    }

    /// Unmaps up to `max_npages` of retained reservation, coldest first.
    /// Used by shrink-under-pressure paths; returns pages actually freed.
    pub fn shrink_retained(&self, max_npages: usize) -> usize {
        let mut freed = 0;
        while freed < max_npages {
            let mut meta_guard = self.meta.lock();
            let meta = &mut *meta_guard;
            let mut guard = self.retained.lock();
            let Some(id) = guard.lru_head() else {
                break;
            };
            self.retained.remove(&mut guard, id, meta.edatas.get(id));
            meta.addr_map.deregister(meta.edatas.get(id));
            drop(guard);
            let edata = meta.edatas.dalloc(id);
            drop(meta_guard);
            self.pages.unmap(edata.base, edata.size);
            EngineStats::bump(&self.stats.nunmaps);
            freed += edata.npages();
        }
        freed
    }

    /// Acquires every arena-level lock ahead of fork, in the documented
    /// order. The matching postfork hooks release them.
    pub(crate) fn prefork(&self) {
        std::mem::forget(self.decay_dirty.lock());
        std::mem::forget(self.decay_muzzy.lock());
        std::mem::forget(self.meta.lock());
        std::mem::forget(self.dirty.lock());
        std::mem::forget(self.muzzy.lock());
        std::mem::forget(self.retained.lock());
    }

    pub(crate) fn postfork(&self) {
        unsafe {
            self.decay_dirty.force_unlock();
            self.decay_muzzy.force_unlock();
            self.meta.force_unlock();
            self.dirty.force_unlock();
            self.muzzy.force_unlock();
            self.retained.force_unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DECAY_MS_EAGER, DECAY_MS_NEVER};
    use crate::pages::{MockPages, PAGE, PageEvent};

    fn test_config(dirty_ms: i64, muzzy_ms: i64) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.dirty_decay_ms = dirty_ms;
        config.muzzy_decay_ms = muzzy_ms;
        config.smoothing_steps = 10;
        config
    }

    fn test_arena(dirty_ms: i64, muzzy_ms: i64) -> (Arena, Arc<MockPages>) {
        let pages = Arc::new(MockPages::new());
        let stats = Arc::new(EngineStats::new());
        let arena = Arena::new(0, &test_config(dirty_ms, muzzy_ms), pages.clone(), stats, 0);
        (arena, pages)
    }

    #[test]
    fn fresh_map_then_cache_hit() {
        let (arena, pages) = test_arena(10_000, 10_000);
        let lease = arena.extent_acquire(4, 0).expect("map");
        assert!(lease.zeroed);
        assert_eq!(pages.count_events(|e| matches!(e, PageEvent::Map { .. })), 1);

        arena.extent_release(lease);
        assert_eq!(arena.npages_cached(), 4);

        let again = arena.extent_acquire(4, 0).expect("hit");
        assert_eq!(again.base, lease.base);
        assert!(!again.zeroed);
        assert_eq!(arena.npages_cached(), 0);
        assert_eq!(pages.count_events(|e| matches!(e, PageEvent::Map { .. })), 1);
    }

    #[test]
    fn oversized_hit_splits_and_keeps_remainder() {
        let (arena, _pages) = test_arena(10_000, 10_000);
        let big = arena.extent_acquire(8, 0).expect("map");
        arena.extent_release(big);

        let small = arena.extent_acquire(3, 0).expect("split hit");
        assert_eq!(small.size, 3 * PAGE);
        assert_eq!(small.base, big.base);
        assert_eq!(arena.npages_cached(), 5);

        // The remainder satisfies the next request without a fresh map.
        let rest = arena.extent_acquire(5, 0).expect("remainder hit");
        assert_eq!(rest.base, big.base + 3 * PAGE);
        assert_eq!(arena.npages_cached(), 0);
    }

    #[test]
    fn adjacent_dirty_extents_coalesce_at_eviction() {
        let (arena, pages) = test_arena(10_000, DECAY_MS_EAGER);
        let big = arena.extent_acquire(8, 0).expect("map");
        arena.extent_release(big);
        let a = arena.extent_acquire(4, 0).expect("a");
        let b = arena.extent_acquire(4, 0).expect("b");
        arena.extent_release(a);
        arena.extent_release(b);
        assert_eq!(arena.npages_cached(), 8);

        // Eviction merges the halves back into one extent, so the forced
        // purge covers the whole range in a single call.
        arena.purge_to_limit(DecayTier::Dirty, 0);
        assert_eq!(arena.npages_cached(), 0);
        assert_eq!(arena.npages_retained(), 8);
        assert_eq!(
            pages.count_events(|e| matches!(e, PageEvent::PurgeForced { .. })),
            1
        );
    }

    #[test]
    fn muzzy_never_parks_demoted_pages_in_muzzy() {
        let (arena, pages) = test_arena(10_000, DECAY_MS_NEVER);
        let lease = arena.extent_acquire(4, 0).expect("map");
        arena.extent_release(lease);
        assert_eq!(arena.npages_cached(), 4);

        // A disabled muzzy tier still accepts demoted dirty pages; they
        // sit there indefinitely instead of being force-purged away.
        arena.purge_to_limit(DecayTier::Dirty, 0);
        assert_eq!(arena.ecache(DecayTier::Dirty).npages(), 0);
        assert_eq!(arena.ecache(DecayTier::Muzzy).npages(), 4);
        assert_eq!(arena.npages_retained(), 0);
        assert_eq!(
            pages.count_events(|e| matches!(e, PageEvent::PurgeLazy { .. })),
            1
        );
        assert_eq!(
            pages.count_events(|e| matches!(e, PageEvent::PurgeForced { .. })),
            0
        );
    }

    #[test]
    fn eager_dirty_purges_on_tick() {
        let (arena, pages) = test_arena(0, 10_000);
        let lease = arena.extent_acquire(4, 0).expect("map");
        arena.extent_release(lease);
        assert_eq!(arena.npages_cached(), 4);

        arena.decay_tick(0);
        // Eager dirty demotes immediately; a timed muzzy tier holds the
        // pages after an advisory purge.
        assert_eq!(arena.ecache(DecayTier::Dirty).npages(), 0);
        assert_eq!(arena.ecache(DecayTier::Muzzy).npages(), 4);
        assert_eq!(
            pages.count_events(|e| matches!(e, PageEvent::PurgeLazy { .. })),
            1
        );
    }

    #[test]
    fn never_decay_keeps_pages_cached() {
        let (arena, pages) = test_arena(DECAY_MS_NEVER, DECAY_MS_NEVER);
        let lease = arena.extent_acquire(4, 0).expect("map");
        arena.extent_release(lease);
        arena.decay_tick(u64::MAX / 2);
        assert_eq!(arena.npages_cached(), 4);
        assert_eq!(
            pages.count_events(|e| {
                matches!(e, PageEvent::PurgeLazy { .. } | PageEvent::PurgeForced { .. })
            }),
            0
        );
    }

    #[test]
    fn timed_decay_demotes_dirty_to_muzzy_then_retained() {
        let (arena, pages) = test_arena(100, 100);
        let lease = arena.extent_acquire(4, 0).expect("map");
        arena.extent_release(lease);

        // Far beyond both decay windows everything demotes to retained.
        let far = 60_000_000_000;
        arena.decay_tick(far);
        arena.decay_tick(2 * far);
        arena.decay_tick(3 * far);
        assert_eq!(arena.npages_cached(), 0);
        assert_eq!(arena.npages_retained(), 4);
        assert!(pages.count_events(|e| matches!(e, PageEvent::PurgeLazy { .. })) > 0);
        assert!(pages.count_events(|e| matches!(e, PageEvent::PurgeForced { .. })) > 0);
    }

    #[test]
    fn retained_extent_is_recommitted_on_reuse() {
        let (arena, pages) = test_arena(0, 0);
        let lease = arena.extent_acquire(4, 0).expect("map");
        let base = lease.base;
        arena.extent_release(lease);
        arena.decay_tick(0);
        assert_eq!(arena.npages_retained(), 4);

        let again = arena.extent_acquire(4, 0).expect("retained hit");
        assert_eq!(again.base, base);
        assert!(again.zeroed);
        assert!(pages.count_events(|e| matches!(e, PageEvent::Commit { .. })) > 0);
        assert_eq!(pages.count_events(|e| matches!(e, PageEvent::Map { .. })), 1);
    }

    #[test]
    fn shrink_unmaps_retained_reservation() {
        let (arena, pages) = test_arena(0, 0);
        let lease = arena.extent_acquire(6, 0).expect("map");
        arena.extent_release(lease);
        arena.decay_tick(0);
        assert_eq!(arena.npages_retained(), 6);

        let freed = arena.shrink_retained(100);
        assert_eq!(freed, 6);
        assert_eq!(arena.npages_retained(), 0);
        assert_eq!(pages.count_events(|e| matches!(e, PageEvent::Unmap { .. })), 1);
    }

    #[test]
    fn map_failure_propagates() {
        let (arena, pages) = test_arena(10_000, 10_000);
        pages.fail_next_maps(true);
        assert!(arena.extent_acquire(4, 0).is_err());
        pages.fail_next_maps(false);
        assert!(arena.extent_acquire(4, 0).is_ok());
    }
}
