//! Locked extent cache: an [`Eset`] behind a mutex, plus a page counter
//! readable without taking the lock. Decay deadline checks poll the
//! counter from other threads, so it must stay in sync with every insert
//! and remove made through this wrapper.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::edata::{Edata, EdataId, ExtentState};
use crate::eset::Eset;

pub struct Ecache {
    inner: Mutex<Eset>,
    state: ExtentState,
    /// When set, adjacent frees are left unmerged on insert and coalesced
    /// at eviction instead, keeping the free path short.
    delay_coalesce: bool,
    npages: AtomicUsize,
}

impl Ecache {
    #[must_use]
    pub fn new(state: ExtentState, delay_coalesce: bool) -> Self {
        Self {
            inner: Mutex::new(Eset::new()),
            state,
            delay_coalesce,
            npages: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn state(&self) -> ExtentState {
        self.state
    }

    #[must_use]
    pub fn delay_coalesce(&self) -> bool {
        self.delay_coalesce
    }

    /// Pages currently cached. Safe to call without the lock; the value
    /// may be momentarily stale, which deadline checks tolerate.
    #[must_use]
    pub fn npages(&self) -> usize {
        self.npages.load(Ordering::Relaxed)
    }

    pub fn lock(&self) -> MutexGuard<'_, Eset> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, Eset>> {
        self.inner.try_lock()
    }

    /// Fork support only. The caller must own the lock via a forgotten
    /// guard from the prefork phase.
    pub(crate) unsafe fn force_unlock(&self) {
        unsafe { self.inner.force_unlock() }
    }

    /// Inserts through a held guard, keeping the atomic mirror current.
    pub fn insert(&self, guard: &mut MutexGuard<'_, Eset>, id: EdataId, edata: &Edata) {
        debug_assert_eq!(edata.state, self.state);
        guard.insert(id, edata);
        self.npages.fetch_add(edata.npages(), Ordering::Relaxed);
    }

    pub fn remove(&self, guard: &mut MutexGuard<'_, Eset>, id: EdataId, edata: &Edata) {
        guard.remove(id, edata);
        self.npages.fetch_sub(edata.npages(), Ordering::Relaxed);
    }
}
