//! OS page-level operations behind a trait seam.
//!
//! The engine manages address ranges as plain `usize` values; nothing in
//! this crate dereferences them. `SystemPages` performs the real
//! mmap/madvise calls; `MockPages` records every call so the reclamation
//! paths can be tested hermetically.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::MapError;

/// Base-2 log of the page size this engine quantizes by.
pub const PAGE_SHIFT: usize = 12;
/// Page size in bytes.
pub const PAGE: usize = 1 << PAGE_SHIFT;

/// Page-level OS interface consumed by the extent and purge paths.
///
/// `purge_lazy` is advisory (the kernel may reclaim the range at leisure;
/// contents become undefined). `purge_forced` guarantees zero-on-next-touch.
/// `commit`/`decommit` toggle physical backing while keeping the virtual
/// reservation; they only matter on overcommit-averse setups.
pub trait PageOps: Send + Sync {
    /// Reserves `size` bytes of page-aligned virtual memory.
    fn map(&self, size: usize) -> Result<usize, MapError>;
    /// Returns a reservation to the OS.
    fn unmap(&self, addr: usize, size: usize);
    /// Advisory page reclamation; returns false if unsupported.
    fn purge_lazy(&self, addr: usize, size: usize) -> bool;
    /// Guaranteed-zero page reclamation; returns false if unsupported.
    fn purge_forced(&self, addr: usize, size: usize) -> bool;
    /// Ensures physical backing for the range.
    fn commit(&self, addr: usize, size: usize) -> bool;
    /// Drops physical backing while keeping the reservation.
    fn decommit(&self, addr: usize, size: usize) -> bool;
}

/// Real OS implementation.
#[derive(Debug, Default)]
pub struct SystemPages;

impl SystemPages {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl PageOps for SystemPages {
    fn map(&self, size: usize) -> Result<usize, MapError> {
        debug_assert!(size > 0 && size % PAGE == 0);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(MapError { size })
        } else {
            Ok(ptr as usize)
        }
    }

    fn unmap(&self, addr: usize, size: usize) {
        unsafe {
            libc::munmap(addr as *mut libc::c_void, size);
        }
    }

    fn purge_lazy(&self, addr: usize, size: usize) -> bool {
        #[cfg(target_os = "linux")]
        let advice = libc::MADV_FREE;
        #[cfg(not(target_os = "linux"))]
        let advice = libc::MADV_DONTNEED;
        unsafe { libc::madvise(addr as *mut libc::c_void, size, advice) == 0 }
    }

    fn purge_forced(&self, addr: usize, size: usize) -> bool {
        unsafe { libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED) == 0 }
    }

    fn commit(&self, addr: usize, size: usize) -> bool {
        unsafe {
            libc::mprotect(
                addr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) == 0
        }
    }

    fn decommit(&self, addr: usize, size: usize) -> bool {
        unsafe { libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_NONE) == 0 }
    }
}

#[cfg(not(unix))]
impl PageOps for SystemPages {
    fn map(&self, size: usize) -> Result<usize, MapError> {
        Err(MapError { size })
    }
    fn unmap(&self, _addr: usize, _size: usize) {}
    fn purge_lazy(&self, _addr: usize, _size: usize) -> bool {
        false
    }
    fn purge_forced(&self, _addr: usize, _size: usize) -> bool {
        false
    }
    fn commit(&self, _addr: usize, _size: usize) -> bool {
        false
    }
    fn decommit(&self, _addr: usize, _size: usize) -> bool {
        false
    }
}

/// One recorded page operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEvent {
    Map { addr: usize, size: usize },
    Unmap { addr: usize, size: usize },
    PurgeLazy { addr: usize, size: usize },
    PurgeForced { addr: usize, size: usize },
    Commit { addr: usize, size: usize },
    Decommit { addr: usize, size: usize },
}

/// Recording test double. Hands out disjoint fake address ranges from a
/// bump counter and logs every call.
#[derive(Debug)]
pub struct MockPages {
    next_addr: AtomicUsize,
    fail_map: AtomicBool,
    events: Mutex<Vec<PageEvent>>,
}

impl Default for MockPages {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPages {
    #[must_use]
    pub fn new() -> Self {
        Self {
            // Start above the zero page so addresses look plausible.
            next_addr: AtomicUsize::new(0x1000_0000),
            fail_map: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Makes every subsequent `map` call fail, to exercise exhaustion paths.
    pub fn fail_next_maps(&self, fail: bool) {
        self.fail_map.store(fail, Ordering::Relaxed);
    }

    /// Drains the recorded event log.
    pub fn take_events(&self) -> Vec<PageEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Counts recorded events matching `pred` without draining.
    pub fn count_events(&self, pred: impl Fn(&PageEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    fn record(&self, ev: PageEvent) {
        self.events.lock().push(ev);
    }
}

impl PageOps for MockPages {
    fn map(&self, size: usize) -> Result<usize, MapError> {
        debug_assert!(size > 0 && size % PAGE == 0);
        if self.fail_map.load(Ordering::Relaxed) {
            return Err(MapError { size });
        }
        let addr = self.next_addr.fetch_add(size, Ordering::Relaxed);
        self.record(PageEvent::Map { addr, size });
        Ok(addr)
    }

    fn unmap(&self, addr: usize, size: usize) {
        self.record(PageEvent::Unmap { addr, size });
    }

    fn purge_lazy(&self, addr: usize, size: usize) -> bool {
        self.record(PageEvent::PurgeLazy { addr, size });
        true
    }

    fn purge_forced(&self, addr: usize, size: usize) -> bool {
        self.record(PageEvent::PurgeForced { addr, size });
        true
    }

    fn commit(&self, addr: usize, size: usize) -> bool {
        self.record(PageEvent::Commit { addr, size });
        true
    }

    fn decommit(&self, addr: usize, size: usize) -> bool {
        self.record(PageEvent::Decommit { addr, size });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_hands_out_disjoint_ranges() {
        let pages = MockPages::new();
        let a = pages.map(4 * PAGE).unwrap();
        let b = pages.map(2 * PAGE).unwrap();
        assert!(b >= a + 4 * PAGE);
    }

    #[test]
    fn mock_exhaustion_is_an_error_not_a_panic() {
        let pages = MockPages::new();
        pages.fail_next_maps(true);
        assert_eq!(pages.map(PAGE), Err(MapError { size: PAGE }));
        pages.fail_next_maps(false);
        assert!(pages.map(PAGE).is_ok());
    }

    #[test]
    fn mock_records_purge_flavors() {
        let pages = MockPages::new();
        let addr = pages.map(PAGE).unwrap();
        assert!(pages.purge_lazy(addr, PAGE));
        assert!(pages.purge_forced(addr, PAGE));
        let events = pages.take_events();
        assert!(events.contains(&PageEvent::PurgeLazy { addr, size: PAGE }));
        assert!(events.contains(&PageEvent::PurgeForced { addr, size: PAGE }));
    }

    #[test]
    #[cfg(unix)]
    fn system_pages_map_unmap_round_trip() {
        let pages: std::sync::Arc<dyn PageOps> = std::sync::Arc::new(SystemPages::new());
        let addr = pages.map(2 * PAGE).unwrap();
        assert_eq!(addr % PAGE, 0);
        pages.unmap(addr, 2 * PAGE);
    }
}
