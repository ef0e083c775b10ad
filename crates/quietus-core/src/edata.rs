//! Extent metadata records and page-count size classes.
//!
//! Extents are identified by small integer handles into a per-arena slab.
//! All cross-references between containers (heaps, LRU lists, the address
//! map) go through handles instead of pointers, so the metadata itself can
//! live in plain `Vec` storage.

use crate::pages::PAGE_SHIFT;

/// Lifecycle state of an extent. Within one residence in the caches the
/// state only moves toward colder (dirty -> muzzy -> retained); reuse
/// resets it to active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentState {
    Active,
    Dirty,
    Muzzy,
    Retained,
}

impl ExtentState {
    /// Whether a transition from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition(self, next: ExtentState) -> bool {
        use ExtentState::*;
        match (self, next) {
            // Reactivation is always allowed.
            (_, Active) => true,
            (Active, Dirty) => true,
            (Dirty, Muzzy) | (Dirty, Retained) => true,
            (Muzzy, Retained) => true,
            _ => false,
        }
    }
}

/// Slab handle for an extent record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdataId(pub u32);

/// Placeholder size-class index for non-slab extents.
pub const SCIND_INVALID: u8 = u8::MAX;

/// Metadata for one contiguous run of pages.
#[derive(Debug)]
pub struct Edata {
    pub base: usize,
    pub size: usize,
    pub arena_ind: u32,
    /// Small size-class index when `slab`, otherwise [`SCIND_INVALID`].
    pub scind: u8,
    pub slab: bool,
    pub nfree: u32,
    pub committed: bool,
    pub zeroed: bool,
    pub dumpable: bool,
    pub state: ExtentState,
    /// Serial number; lower means older. Survives coalescing as the
    /// minimum of the merged extents.
    pub sn: u64,
}

impl Edata {
    #[must_use]
    pub fn new(base: usize, size: usize, arena_ind: u32, sn: u64) -> Self {
        debug_assert_eq!(size & ((1usize << PAGE_SHIFT) - 1), 0);
        Self {
            base,
            size,
            arena_ind,
            scind: SCIND_INVALID,
            slab: false,
            nfree: 0,
            committed: true,
            zeroed: true,
            dumpable: true,
            state: ExtentState::Active,
            sn,
        }
    }

    #[must_use]
    pub fn npages(&self) -> usize {
        self.size >> PAGE_SHIFT
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Moves the extent to `next`, asserting legality in debug builds.
    pub fn set_state(&mut self, next: ExtentState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal extent transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

/// Slab of extent records with free-list reuse.
#[derive(Default)]
pub struct EdataArena {
    slots: Vec<Option<Edata>>,
    free: Vec<u32>,
}

impl EdataArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, edata: Edata) -> EdataId {
        match self.free.pop() {
            Some(idx) => {
                debug_assert!(self.slots[idx as usize].is_none());
                self.slots[idx as usize] = Some(edata);
                EdataId(idx)
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Some(edata));
                EdataId(idx)
            }
        }
    }

    pub fn dalloc(&mut self, id: EdataId) -> Edata {
        let edata = self.slots[id.0 as usize]
            .take()
            .expect("dalloc of unallocated extent handle");
        self.free.push(id.0);
        edata
    }

    #[must_use]
    pub fn get(&self, id: EdataId) -> &Edata {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("stale extent handle")
    }

    pub fn get_mut(&mut self, id: EdataId) -> &mut Edata {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("stale extent handle")
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Page-count size classes. Classes 0..3 cover 1..=4 pages exactly; above
// that each power-of-two range (2^l, 2^(l+1)] is split into four classes a
// quarter of the range apart. With page counts up to 2^MAX_LG_NPAGES this
// yields NPSIZES regular classes plus one catch-all overflow class.

const MAX_LG_NPAGES: usize = 30;

/// Number of regular page-size classes.
pub const NPSIZES: usize = 4 + 4 * (MAX_LG_NPAGES - 2);

/// Index of the overflow class for sizes beyond the regular range.
pub const PIND_OVERFLOW: usize = NPSIZES;

/// Largest class index -> smallest page count of that class, used to seed
/// best-fit scans. Inverse of the quantization below.
#[must_use]
pub fn pind_to_npages(pind: usize) -> usize {
    if pind < 4 {
        return pind + 1;
    }
    let group = (pind - 4) / 4;
    let pos = (pind - 4) % 4;
    let base = 1usize << (group + 2);
    let quarter = base / 4;
    base + (pos + 1) * quarter
}

/// Largest class whose capacity is <= `npages` (floor quantization, used
/// when inserting a free extent: never advertise more than is there).
#[must_use]
pub fn pind_floor(npages: usize) -> usize {
    debug_assert!(npages > 0);
    if npages <= 4 {
        return npages - 1;
    }
    let lg = usize::BITS as usize - 1 - npages.leading_zeros() as usize;
    let (group_base, group) = if npages == 1usize << lg {
        // Exact power of two is the top class of the previous group.
        (1usize << (lg - 1), lg - 3)
    } else {
        (1usize << lg, lg - 2)
    };
    if group >= MAX_LG_NPAGES - 2 {
        return PIND_OVERFLOW;
    }
    let quarter = group_base / 4;
    let k = (npages - group_base) / quarter;
    debug_assert!(k <= 4);
    if k == 0 {
        // Below the group's first step; floor is the previous group's top
        // class, whose capacity is exactly group_base.
        return 4 + 4 * group - 1;
    }
    4 + 4 * group + (k - 1)
}

/// Smallest class whose capacity is >= `npages` (ceiling quantization,
/// used when searching for a fit).
#[must_use]
pub fn pind_ceil(npages: usize) -> usize {
    debug_assert!(npages > 0);
    let floor = pind_floor(npages);
    if floor == PIND_OVERFLOW || pind_to_npages(floor) == npages {
        floor
    } else {
        floor + 1
    }
}
