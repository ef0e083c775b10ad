//! Address-ordered extent map.
//!
//! Maps each cached extent's base address to its handle so the free path
//! can find mergeable neighbors. One map per arena, guarded by the arena's
//! metadata lock.

use std::collections::BTreeMap;

use crate::edata::{Edata, EdataId};

#[derive(Default)]
pub struct AddressMap {
    by_base: BTreeMap<usize, EdataId>,
}

impl AddressMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, edata: &Edata, id: EdataId) {
        let prior = self.by_base.insert(edata.base, id);
        debug_assert!(prior.is_none(), "overlapping extent registration");
    }

    pub fn deregister(&mut self, edata: &Edata) {
        let removed = self.by_base.remove(&edata.base);
        debug_assert!(removed.is_some(), "deregister of unmapped extent");
    }

    /// Extent whose base is exactly `addr`, i.e. the forward neighbor of an
    /// extent ending at `addr`.
    #[must_use]
    pub fn at(&self, addr: usize) -> Option<EdataId> {
        self.by_base.get(&addr).copied()
    }

    /// Nearest extent starting strictly below `addr`, candidate backward
    /// neighbor. The caller must still check that it ends exactly at `addr`.
    #[must_use]
    pub fn below(&self, addr: usize) -> Option<EdataId> {
        self.by_base.range(..addr).next_back().map(|(_, id)| *id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_base.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_base.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::PAGE;

    #[test]
    fn neighbor_queries() {
        let mut map = AddressMap::new();
        let a = Edata::new(0x10000, 4 * PAGE, 0, 1);
        let b = Edata::new(0x10000 + 4 * PAGE, 2 * PAGE, 0, 2);
        let far = Edata::new(0x40000, PAGE, 0, 3);
        map.register(&a, EdataId(0));
        map.register(&b, EdataId(1));
        map.register(&far, EdataId(2));

        assert_eq!(map.at(a.end()), Some(EdataId(1)));
        assert_eq!(map.at(b.end()), None);
        assert_eq!(map.below(b.base), Some(EdataId(0)));
        assert_eq!(map.below(a.base), None);
        assert_eq!(map.below(0x40000), Some(EdataId(1)));

        map.deregister(&b);
        assert_eq!(map.at(a.end()), None);
        assert_eq!(map.len(), 2);
    }
}
