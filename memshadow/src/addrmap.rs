//! # addrmap
//! Maps any guest address to the `SecMap` owning its page. Pages below the
//! 4 GiB primary limit are resolved by direct indexing into a flat table;
//! pages above it go through the auxiliary map, a 24-entry direct micro
//! cache in front of an ordered tree. The micro cache special-cases its top
//! two slots and promotes hit entries one slot forward rather than keeping
//! strict LRU order; the tree lookup is O(log n) in the number of mapped
//! above-primary pages.
use alloc::{collections::BTreeMap, vec, vec::Vec};

use crate::{
    secmap::{page_base, SecMap, SmRef, Uniform, SM_BITS, SM_MASK},
    vbits::V2,
    GuestAddr,
};

/// Log2 of the number of primary-map pages.
pub const N_PRIMARY_BITS: u32 = 16;
/// Number of pages resolved by the flat primary map.
pub const N_PRIMARY: usize = 1 << N_PRIMARY_BITS;
/// First address handled by the auxiliary map (4 GiB).
pub const PRIMARY_LIMIT: GuestAddr = (N_PRIMARY as GuestAddr) << SM_BITS;

const AUX_L1_ENTRIES: usize = 24;

#[derive(Debug, Clone, Copy)]
struct AuxEnt {
    base: GuestAddr,
    sm: SmRef,
}

/// `GuestAddr::MAX` is not page-aligned, so it can never collide with a
/// real page base.
const AUX_EMPTY: GuestAddr = GuestAddr::MAX;

/// Hit/miss counters for the auxiliary map levels.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressMapCounters {
    pub aux_l1_hits: u64,
    pub aux_l2_hits: u64,
    pub aux_misses: u64,
}

/// Per-kind page census used by the statistics dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCensus {
    pub noaccess: usize,
    pub undefined: usize,
    pub defined: usize,
    pub private: usize,
}

pub struct AddressMap {
    primary: Vec<SmRef>,
    /// Materialized private maps; append-only, entries outlive every
    /// reference handed out (pages are never freed before process exit).
    arena: Vec<SecMap>,
    aux_l1: [AuxEnt; AUX_L1_ENTRIES],
    aux_l2: BTreeMap<GuestAddr, SmRef>,
    counters: AddressMapCounters,
}

impl AddressMap {
    pub fn new() -> Self {
        AddressMap {
            primary: vec![SmRef::Shared(Uniform::NoAccess); N_PRIMARY],
            arena: Vec::new(),
            aux_l1: [AuxEnt {
                base: AUX_EMPTY,
                sm: SmRef::Shared(Uniform::NoAccess),
            }; AUX_L1_ENTRIES],
            aux_l2: BTreeMap::new(),
            counters: AddressMapCounters::default(),
        }
    }

    /// Resolve `addr` to its current owning map, promoting auxiliary
    /// micro-cache entries on the way.
    #[inline]
    fn find(&mut self, addr: GuestAddr) -> SmRef {
        if addr < PRIMARY_LIMIT {
            return self.primary[(addr >> SM_BITS) as usize];
        }
        self.aux_find(page_base(addr))
    }

    fn aux_find(&mut self, base: GuestAddr) -> SmRef {
        if self.aux_l1[0].base == base {
            self.counters.aux_l1_hits += 1;
            return self.aux_l1[0].sm;
        }
        if self.aux_l1[1].base == base {
            self.counters.aux_l1_hits += 1;
            let sm = self.aux_l1[1].sm;
            self.aux_l1.swap(0, 1);
            return sm;
        }
        for i in 2..AUX_L1_ENTRIES {
            if self.aux_l1[i].base == base {
                self.counters.aux_l1_hits += 1;
                let sm = self.aux_l1[i].sm;
                self.aux_l1.swap(i - 1, i);
                return sm;
            }
        }
        match self.aux_l2.get(&base) {
            Some(&sm) => {
                self.counters.aux_l2_hits += 1;
                self.aux_l1[AUX_L1_ENTRIES - 1] = AuxEnt { base, sm };
                sm
            }
            None => {
                // Unmapped above-primary pages default to no-access and
                // are not worth caching.
                self.counters.aux_misses += 1;
                SmRef::Shared(Uniform::NoAccess)
            }
        }
    }

    /// Current owning map without promotion or counter updates; for
    /// introspection (GC predicates, the statistics census).
    pub fn page_ref(&self, addr: GuestAddr) -> SmRef {
        if addr < PRIMARY_LIMIT {
            return self.primary[(addr >> SM_BITS) as usize];
        }
        let base = page_base(addr);
        for ent in &self.aux_l1 {
            if ent.base == base {
                return ent.sm;
            }
        }
        self.aux_l2
            .get(&base)
            .copied()
            .unwrap_or(SmRef::Shared(Uniform::NoAccess))
    }

    /// Two-bit summary of one byte, read path.
    #[inline]
    pub fn get_v2(&mut self, addr: GuestAddr) -> V2 {
        match self.find(addr) {
            SmRef::Shared(u) => u.v2(),
            SmRef::Private(i) => self.arena[i].get((addr & SM_MASK) as usize),
        }
    }

    /// Two-bit summary of one byte without touching the cache state.
    pub fn peek_v2(&self, addr: GuestAddr) -> V2 {
        match self.page_ref(addr) {
            SmRef::Shared(u) => u.v2(),
            SmRef::Private(i) => self.arena[i].get((addr & SM_MASK) as usize),
        }
    }

    /// Packed summary chunk covering the four bytes at 4-aligned `addr`,
    /// uniform pages answered without storage.
    #[inline]
    pub fn chunk_at(&mut self, addr: GuestAddr) -> u8 {
        debug_assert!(addr & 3 == 0);
        match self.find(addr) {
            SmRef::Shared(u) => u.chunk(),
            SmRef::Private(i) => self.arena[i].chunk_at((addr & SM_MASK) as usize),
        }
    }

    /// Set one byte's summary, materializing a private page if needed. A
    /// write that would not change the byte leaves a distinguished page
    /// untouched.
    pub fn set_v2(&mut self, addr: GuestAddr, v: V2) {
        if self.peek_v2(addr) == v {
            return;
        }
        let off = (addr & SM_MASK) as usize;
        self.sm_for_writing(addr).set(off, v);
    }

    /// Overwrite the packed chunk covering the four bytes at 4-aligned
    /// `addr`, materializing only when the chunk actually changes.
    pub fn set_chunk(&mut self, addr: GuestAddr, chunk: u8) {
        debug_assert!(addr & 3 == 0);
        if let SmRef::Shared(u) = self.page_ref(addr) {
            if u.chunk() == chunk {
                return;
            }
        }
        let off = (addr & SM_MASK) as usize;
        self.sm_for_writing(addr).set_chunk(off, chunk);
    }

    /// The mutable private map for `addr`'s page, copy-on-write
    /// materialized from the distinguished state on first use.
    pub fn sm_for_writing(&mut self, addr: GuestAddr) -> &mut SecMap {
        let base = page_base(addr);
        if addr < PRIMARY_LIMIT {
            let idx = (addr >> SM_BITS) as usize;
            match self.primary[idx] {
                SmRef::Private(i) => &mut self.arena[i],
                SmRef::Shared(u) => {
                    let i = self.materialize(u);
                    self.primary[idx] = SmRef::Private(i);
                    self.l1_refresh(base, SmRef::Private(i));
                    &mut self.arena[i]
                }
            }
        } else {
            match self
                .aux_l2
                .get(&base)
                .copied()
                .unwrap_or(SmRef::Shared(Uniform::NoAccess))
            {
                SmRef::Private(i) => &mut self.arena[i],
                SmRef::Shared(u) => {
                    let i = self.materialize(u);
                    self.aux_l2.insert(base, SmRef::Private(i));
                    self.l1_refresh(base, SmRef::Private(i));
                    &mut self.arena[i]
                }
            }
        }
    }

    fn materialize(&mut self, state: Uniform) -> usize {
        self.arena.push(SecMap::new_uniform(state));
        self.arena.len() - 1
    }

    fn l1_refresh(&mut self, base: GuestAddr, sm: SmRef) {
        for ent in &mut self.aux_l1 {
            if ent.base == base {
                ent.sm = sm;
                return;
            }
        }
    }

    /// Repoint a whole page at a distinguished map, O(1). Above the
    /// primary limit a no-access page reverts to "absent" so the tree only
    /// holds pages that differ from the default. A previously private page
    /// keeps its arena slot (never coalesced back, never freed).
    pub fn repoint_page(&mut self, base: GuestAddr, state: Uniform) {
        debug_assert!(base & SM_MASK == 0);
        if base < PRIMARY_LIMIT {
            self.primary[(base >> SM_BITS) as usize] = SmRef::Shared(state);
        } else if state == Uniform::NoAccess {
            self.aux_l2.remove(&base);
        } else {
            self.aux_l2.insert(base, SmRef::Shared(state));
        }
        self.l1_refresh(base, SmRef::Shared(state));
    }

    /// Repoint every currently known page at `AllDefined`.
    pub fn repoint_all(&mut self, state: Uniform) {
        for ent in &mut self.primary {
            *ent = SmRef::Shared(state);
        }
        for sm in self.aux_l2.values_mut() {
            *sm = SmRef::Shared(state);
        }
        for ent in &mut self.aux_l1 {
            if ent.base != AUX_EMPTY {
                ent.sm = SmRef::Shared(state);
            }
        }
    }

    pub fn counters(&self) -> AddressMapCounters {
        self.counters
    }

    /// Census of distinguished pages by kind plus private pages, over the
    /// primary map and the auxiliary tree.
    pub fn census(&self) -> PageCensus {
        let mut census = PageCensus::default();
        let mut tally = |sm: &SmRef| match sm {
            SmRef::Shared(Uniform::NoAccess) => census.noaccess += 1,
            SmRef::Shared(Uniform::Undefined) => census.undefined += 1,
            SmRef::Shared(Uniform::Defined) => census.defined += 1,
            SmRef::Private(_) => census.private += 1,
        };
        for ent in &self.primary {
            tally(ent);
        }
        for sm in self.aux_l2.values() {
            tally(sm);
        }
        census
    }
}

impl Default for AddressMap {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for AddressMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressMap")
            .field("arena_len", &self.arena.len())
            .field("aux_l2_len", &self.aux_l2.len())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secmap::SM_SIZE;

    #[test]
    fn test_default_noaccess() {
        let mut map = AddressMap::new();
        assert_eq!(map.get_v2(0x1000), V2::NoAccess);
        assert_eq!(map.get_v2(PRIMARY_LIMIT + 0x1000), V2::NoAccess);
    }

    #[test]
    fn test_repoint_and_read() {
        let mut map = AddressMap::new();
        map.repoint_page(0x2_0000, Uniform::Defined);
        assert_eq!(map.get_v2(0x2_0000), V2::Defined);
        assert_eq!(map.get_v2(0x2_ffff), V2::Defined);
        assert_eq!(map.get_v2(0x3_0000), V2::NoAccess);
    }

    #[test]
    fn test_cow_materializes_once() {
        let mut map = AddressMap::new();
        map.repoint_page(0x2_0000, Uniform::Undefined);
        map.set_v2(0x2_0005, V2::Defined);
        map.set_v2(0x2_0006, V2::Defined);
        let census = map.census();
        assert_eq!(census.private, 1);
        assert_eq!(map.get_v2(0x2_0005), V2::Defined);
        assert_eq!(map.get_v2(0x2_0004), V2::Undefined);
    }

    #[test]
    fn test_redundant_write_keeps_distinguished() {
        let mut map = AddressMap::new();
        map.repoint_page(0x2_0000, Uniform::Defined);
        map.set_v2(0x2_0005, V2::Defined);
        assert_eq!(map.census().private, 0);
    }

    #[test]
    fn test_aux_map_promotion() {
        let mut map = AddressMap::new();
        let base = PRIMARY_LIMIT + 0x10_0000;
        map.repoint_page(base, Uniform::Defined);
        // Evict any L1 entry for `base` by touching more pages than the
        // micro cache holds, then hit it again through the tree.
        for i in 1..=AUX_L1_ENTRIES as GuestAddr + 4 {
            map.repoint_page(base + i * SM_SIZE as GuestAddr, Uniform::Defined);
            map.get_v2(base + i * SM_SIZE as GuestAddr);
        }
        let before = map.counters().aux_l2_hits;
        assert_eq!(map.get_v2(base), V2::Defined);
        assert_eq!(map.get_v2(base), V2::Defined);
        let counters = map.counters();
        assert!(counters.aux_l2_hits > before);
        assert!(counters.aux_l1_hits > 0);
    }
}
