//! Fixed-capacity lock-free batch exchange.
//!
//! A `Batcher` moves bounded batches of opaque elements from any number of
//! producers to a single consumer without blocking either side. Producers
//! claim a slot with one CAS on a shared empty-slot bitmask, write their
//! payload, then publish it with a release store. The consumer snapshots
//! the non-empty slots, drains the fully-written ones, and returns them to
//! the empty mask with a single batched OR.
//!
//! Pop calls are *not* thread-safe with respect to one another (caller
//! discipline: one popper at a time), but are safe against concurrent
//! pushes: a push that commits after the snapshot is simply deferred to the
//! next pop cycle, and a slot that is still mid-push is skipped.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Hard capacity limit: one bit per slot in the 32-bit empty mask.
pub const BATCHER_MAX_ELEMS: usize = 32;

// Slot states. Empty and pending are not meaningfully different to a popper
// (neither holds a published element), but tracking them separately keeps
// the fork path and debug checks honest.
const STATE_FULL: u8 = 0;
const STATE_EMPTY: u8 = 1;
const STATE_PENDING: u8 = 2;

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Lock-free multi-producer, single-popper batch exchange of `T`.
pub struct Batcher<T> {
    /// Bit i set means slot i is empty and claimable.
    empty_elems: AtomicU32,
    nelems: u8,
    slots: Box<[Slot<T>]>,
}

unsafe impl<T: Send> Send for Batcher<T> {}
unsafe impl<T: Send> Sync for Batcher<T> {}

fn empty_mask(nelems: usize) -> u32 {
    if nelems == 0 { 0 } else { !0u32 >> (32 - nelems) }
}

impl<T> Batcher<T> {
    /// Creates a batcher with `nelems` slots (at most [`BATCHER_MAX_ELEMS`]).
    #[must_use]
    pub fn new(nelems: usize) -> Self {
        assert!(nelems <= BATCHER_MAX_ELEMS);
        let slots = (0..nelems)
            .map(|_| Slot {
                state: AtomicU8::new(STATE_EMPTY),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            empty_elems: AtomicU32::new(empty_mask(nelems)),
            nelems: nelems as u8,
            slots,
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.nelems as usize
    }

    /// Claims an empty slot and marks it pending, or returns `None` when
    /// every slot is occupied. The caller must follow up with
    /// [`push_end`](Self::push_end) to publish a value into the slot.
    pub fn push_begin(&self) -> Option<usize> {
        let mut empty = self.empty_elems.load(Ordering::Relaxed);
        loop {
            if empty == 0 {
                return None;
            }
            let idx = empty.trailing_zeros() as usize;
            let new_empty = empty & !(1u32 << idx);
            match self.empty_elems.compare_exchange_weak(
                empty,
                new_empty,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    debug_assert_eq!(self.slots[idx].state.load(Ordering::Relaxed), STATE_EMPTY);
                    self.slots[idx].state.store(STATE_PENDING, Ordering::Relaxed);
                    return Some(idx);
                }
                Err(cur) => empty = cur,
            }
        }
    }

    /// Writes `value` into a slot claimed by [`push_begin`](Self::push_begin)
    /// and publishes it. The release store is the point at which the element
    /// becomes visible to a popper.
    pub fn push_end(&self, idx: usize, value: T) {
        let slot = &self.slots[idx];
        debug_assert_eq!(slot.state.load(Ordering::Relaxed), STATE_PENDING);
        debug_assert_eq!(self.empty_elems.load(Ordering::Relaxed) & (1u32 << idx), 0);
        unsafe {
            (*slot.value.get()).write(value);
        }
        slot.state.store(STATE_FULL, Ordering::Release);
    }

    /// Claims a slot, writes `value`, and publishes it in one call. Returns
    /// the value back when the batcher is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        match self.push_begin() {
            Some(idx) => {
                self.push_end(idx, value);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Takes a single-reader snapshot of the in-flight slots. Returns `None`
    /// when nothing is in flight; otherwise the returned iterator must be
    /// driven to completion (dropping it releases the visited slots).
    ///
    /// Caller discipline: at most one popper at a time.
    pub fn pop_begin(&self) -> Option<PopIter<'_, T>> {
        let empty = self.empty_elems.load(Ordering::Relaxed);
        let mask = empty_mask(self.nelems as usize);
        if empty == mask {
            return None;
        }
        Some(PopIter {
            batcher: self,
            to_visit: !empty & mask,
            to_reset: 0,
        })
    }

    /// Restores fork-child consistency: slots mid-push at fork time are
    /// discarded (their producers did not survive the fork), fully-written
    /// slots are preserved, and the empty mask is rebuilt from the per-slot
    /// states. Must only be called while no other thread is active, i.e. in
    /// the child immediately after fork.
    pub fn postfork_child(&self) {
        let mut new_empty = empty_mask(self.nelems as usize);
        for (i, slot) in self.slots.iter().enumerate() {
            match slot.state.load(Ordering::Acquire) {
                STATE_FULL => {
                    new_empty &= !(1u32 << i);
                }
                STATE_PENDING => {
                    // The payload may be half-written; leak rather than drop.
                    slot.state.store(STATE_EMPTY, Ordering::Relaxed);
                }
                _ => {}
            }
        }
        self.empty_elems.store(new_empty, Ordering::Relaxed);
    }
}

impl<T> Drop for Batcher<T> {
    fn drop(&mut self) {
        if std::mem::needs_drop::<T>() {
            for slot in self.slots.iter() {
                if slot.state.load(Ordering::Acquire) == STATE_FULL {
                    unsafe {
                        (*slot.value.get()).assume_init_drop();
                    }
                }
            }
        }
    }
}

/// Draining iterator over one pop snapshot. Dropping it performs the
/// batched release of every visited slot.
pub struct PopIter<'a, T> {
    batcher: &'a Batcher<T>,
    to_visit: u32,
    to_reset: u32,
}

impl<T> Iterator for PopIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        while self.to_visit != 0 {
            let idx = self.to_visit.trailing_zeros() as usize;
            let bit = 1u32 << idx;
            self.to_visit &= !bit;
            let slot = &self.batcher.slots[idx];
            // A claimed-but-unpublished slot races with its pusher; treat it
            // as not yet present and leave it for the next pop cycle.
            if slot.state.load(Ordering::Acquire) != STATE_FULL {
                continue;
            }
            self.to_reset |= bit;
            let value = unsafe { (*slot.value.get()).assume_init_read() };
            return Some(value);
        }
        None
    }
}

impl<T> Drop for PopIter<'_, T> {
    fn drop(&mut self) {
        // Drain anything the caller did not consume so no element is lost.
        while self.next().is_some() {}
        let mut reset = self.to_reset;
        while reset != 0 {
            let idx = reset.trailing_zeros() as usize;
            reset &= !(1u32 << idx);
            let slot = &self.batcher.slots[idx];
            debug_assert_eq!(slot.state.load(Ordering::Acquire), STATE_FULL);
            slot.state.store(STATE_EMPTY, Ordering::Release);
        }
        if self.to_reset != 0 {
            self.batcher
                .empty_elems
                .fetch_or(self.to_reset, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_roundtrip() {
        let b: Batcher<u64> = Batcher::new(4);
        assert!(b.try_push(10).is_ok());
        assert!(b.try_push(20).is_ok());
        let mut got: Vec<u64> = b.pop_begin().expect("elements present").collect();
        got.sort_unstable();
        assert_eq!(got, vec![10, 20]);
        assert!(b.pop_begin().is_none());
    }

    #[test]
    fn full_batcher_rejects_push() {
        let b: Batcher<u32> = Batcher::new(2);
        assert!(b.try_push(1).is_ok());
        assert!(b.try_push(2).is_ok());
        assert_eq!(b.try_push(3), Err(3));
        drop(b.pop_begin().expect("drain"));
        assert!(b.try_push(3).is_ok());
    }

    #[test]
    fn zero_capacity_is_inert() {
        let b: Batcher<u32> = Batcher::new(0);
        assert_eq!(b.try_push(1), Err(1));
        assert!(b.pop_begin().is_none());
    }

    #[test]
    fn pending_slot_is_skipped_by_pop() {
        let b: Batcher<u32> = Batcher::new(4);
        let idx = b.push_begin().expect("slot");
        b.try_push(7).unwrap();
        // The mid-push slot is visible in the snapshot but yields nothing.
        let got: Vec<u32> = b.pop_begin().expect("snapshot").collect();
        assert_eq!(got, vec![7]);
        // Finishing the push makes it pop-able on the next cycle.
        b.push_end(idx, 9);
        let got: Vec<u32> = b.pop_begin().expect("snapshot").collect();
        assert_eq!(got, vec![9]);
    }

    #[test]
    fn unconsumed_iterator_releases_slots_without_loss() {
        let b: Batcher<String> = Batcher::new(4);
        b.try_push("a".to_owned()).unwrap();
        b.try_push("b".to_owned()).unwrap();
        // Drop the iterator after consuming only one element.
        {
            let mut it = b.pop_begin().expect("snapshot");
            let _ = it.next();
        }
        // Both slots are reusable again.
        assert!(b.try_push("c".to_owned()).is_ok());
        assert!(b.try_push("d".to_owned()).is_ok());
        assert!(b.try_push("e".to_owned()).is_ok());
        assert!(b.try_push("f".to_owned()).is_ok());
        assert!(b.try_push("g".to_owned()).is_err());
    }

    #[test]
    fn postfork_child_discards_pending_and_keeps_full() {
        let b: Batcher<u32> = Batcher::new(8);
        b.try_push(1).unwrap();
        b.try_push(2).unwrap();
        // Simulate two producers caught mid-push by fork.
        let _p0 = b.push_begin().expect("slot");
        let _p1 = b.push_begin().expect("slot");

        b.postfork_child();

        let mut got: Vec<u32> = match b.pop_begin() {
            Some(it) => it.collect(),
            None => Vec::new(),
        };
        got.sort_unstable();
        assert_eq!(got, vec![1, 2]);
        // All eight slots are usable again.
        for i in 0..8 {
            assert!(b.try_push(i).is_ok());
        }
        assert!(b.try_push(99).is_err());
    }
}
