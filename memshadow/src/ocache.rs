//! # ocache
//! Two-level cache mapping 4-byte-aligned guest words to origin tags,
//! shaped like a CPU data cache on purpose: a set-associative front array
//! absorbs the hot working set, and lines that still carry information
//! spill to an ordered overflow tree on eviction. A line covers eight
//! consecutive words under one address tag; each word has a four-bit
//! descriptor saying which of its bytes carry a meaningful origin. A line
//! whose descriptors are all zero holds no information and is discarded
//! for free instead of being written back.
use alloc::collections::BTreeMap;

use log::trace;

use crate::{origin::Otag, GuestAddr};

/// Words per line; a line covers 32 bytes.
const OC_W32S_PER_LINE: usize = 8;
const OC_LINE_BYTES: GuestAddr = 32;
const OC_LINE_MASK: GuestAddr = OC_LINE_BYTES - 1;
const OC_LINES_PER_SET: usize = 2;
const OC_N_SET_BITS: u32 = 10;
const OC_N_SETS: usize = 1 << OC_N_SET_BITS;

/// Promote a hit line one slot forward only on every fourth find; full LRU
/// buys little here and doubles the write traffic on the set array.
const PROMOTE_EVERY: u64 = 4;

/// Never a valid line tag: real tags are 32-byte aligned.
const TAG_EMPTY: GuestAddr = GuestAddr::MAX;

#[derive(Debug, Clone)]
struct OCacheLine {
    tag: GuestAddr,
    /// Low four bits per word: which bytes of the word have an origin.
    descr: [u8; OC_W32S_PER_LINE],
    w32: [u32; OC_W32S_PER_LINE],
}

impl OCacheLine {
    fn empty() -> Self {
        OCacheLine {
            tag: TAG_EMPTY,
            descr: [0; OC_W32S_PER_LINE],
            w32: [0; OC_W32S_PER_LINE],
        }
    }

    fn zeroed(tag: GuestAddr) -> Self {
        OCacheLine {
            tag,
            descr: [0; OC_W32S_PER_LINE],
            w32: [0; OC_W32S_PER_LINE],
        }
    }
}

/// What an eviction candidate holds, computed in one place rather than by
/// bit tests scattered at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineClass {
    /// Slot never held a line.
    Empty,
    /// Valid tag but no descriptor bits: logically "all origins unknown",
    /// free to discard.
    AllZero,
    /// Carries at least one meaningful descriptor bit; must spill.
    HasData,
}

fn classify(line: &OCacheLine) -> LineClass {
    if line.tag == TAG_EMPTY {
        LineClass::Empty
    } else if line.descr.iter().all(|&d| d == 0) {
        LineClass::AllZero
    } else {
        LineClass::HasData
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OCacheCounters {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_fills: u64,
    pub spills: u64,
}

pub struct OCache {
    /// `OC_N_SETS` sets of `OC_LINES_PER_SET` ways, flattened.
    lines: alloc::vec::Vec<OCacheLine>,
    l2: BTreeMap<GuestAddr, OCacheLine>,
    finds: u64,
    counters: OCacheCounters,
}

impl OCache {
    pub fn new() -> Self {
        OCache {
            lines: alloc::vec![OCacheLine::empty(); OC_N_SETS * OC_LINES_PER_SET],
            l2: BTreeMap::new(),
            finds: 0,
            counters: OCacheCounters::default(),
        }
    }

    #[inline]
    fn set_of(tag: GuestAddr) -> usize {
        ((tag >> 5) & (OC_N_SETS as GuestAddr - 1)) as usize
    }

    /// Locate (or load) the line for `tag`, returning its index. Checks
    /// way 0 first since most accesses hit the same line repeatedly, scans
    /// the rest of the set, and on a total miss evicts the last way:
    /// classified as empty or all-zero it is simply dropped, otherwise it
    /// spills to the overflow tree (replacing any stale entry for the same
    /// tag). The requested line is then reloaded from the tree if present
    /// there, else zero-initialized.
    fn find_line(&mut self, tag: GuestAddr) -> usize {
        let base = Self::set_of(tag) * OC_LINES_PER_SET;
        if self.lines[base].tag == tag {
            self.counters.l1_hits += 1;
            return base;
        }
        for way in 1..OC_LINES_PER_SET {
            if self.lines[base + way].tag == tag {
                self.counters.l1_hits += 1;
                self.finds = self.finds.wrapping_add(1);
                if self.finds % PROMOTE_EVERY == 0 {
                    self.lines.swap(base + way - 1, base + way);
                    return base + way - 1;
                }
                return base + way;
            }
        }

        self.counters.l1_misses += 1;
        let last = base + OC_LINES_PER_SET - 1;
        match classify(&self.lines[last]) {
            LineClass::Empty | LineClass::AllZero => {}
            LineClass::HasData => {
                let victim = self.lines[last].clone();
                trace!("ocache spill - tag: {:#x}", victim.tag);
                self.counters.spills += 1;
                self.l2.insert(victim.tag, victim);
            }
        }
        self.lines[last] = match self.l2.remove(&tag) {
            Some(line) => {
                self.counters.l2_fills += 1;
                line
            }
            None => OCacheLine::zeroed(tag),
        };
        last
    }

    /// Origin of `nbytes` (1, 2 or 4) at `addr`, not crossing a word
    /// boundary. Returns the word's tag if any covered byte carries an
    /// origin, `NONE` otherwise.
    fn word_get(&mut self, addr: GuestAddr, nbytes: usize) -> Otag {
        debug_assert!((addr & 3) as usize + nbytes <= 4);
        let idx = self.find_line(addr & !OC_LINE_MASK);
        let line = &self.lines[idx];
        let w = ((addr & OC_LINE_MASK) >> 2) as usize;
        let mask = (((1u32 << nbytes) - 1) << (addr & 3)) as u8;
        if line.descr[w] & mask != 0 {
            Otag::from_raw(line.w32[w])
        } else {
            Otag::NONE
        }
    }

    /// Store an origin for `nbytes` (1, 2 or 4) at `addr`, not crossing a
    /// word boundary. A `NONE` tag clears the covered descriptor bits
    /// instead of storing a literal zero, preserving the all-zero-line
    /// discard invariant.
    fn word_set(&mut self, addr: GuestAddr, nbytes: usize, tag: Otag) {
        debug_assert!((addr & 3) as usize + nbytes <= 4);
        let idx = self.find_line(addr & !OC_LINE_MASK);
        let line = &mut self.lines[idx];
        let w = ((addr & OC_LINE_MASK) >> 2) as usize;
        let mask = (((1u32 << nbytes) - 1) << (addr & 3)) as u8;
        if tag.is_none() {
            line.descr[w] &= !mask;
            if line.descr[w] == 0 {
                line.w32[w] = 0;
            }
        } else {
            line.descr[w] |= mask;
            line.w32[w] = tag.raw();
        }
    }

    /// Origin for an access of `nbytes` (1..=32) at `addr`. Wider and
    /// word-straddling accesses split into halves combined with the merge
    /// rule.
    pub fn load_origin(&mut self, addr: GuestAddr, nbytes: usize) -> Otag {
        match nbytes {
            1 | 2 | 4 => {
                let boff = (addr & 3) as usize;
                if boff + nbytes <= 4 {
                    self.word_get(addr, nbytes)
                } else {
                    let lo = 4 - boff;
                    self.word_get(addr, lo)
                        .merge(self.load_origin(addr + lo as GuestAddr, nbytes - lo))
                }
            }
            8 | 16 | 32 => {
                let half = nbytes / 2;
                self.load_origin(addr, half)
                    .merge(self.load_origin(addr + half as GuestAddr, half))
            }
            _ => unreachable!("unsupported origin access width: {nbytes}"),
        }
    }

    /// Record an origin for an access of `nbytes` (1..=32) at `addr`,
    /// split like `load_origin`.
    pub fn store_origin(&mut self, addr: GuestAddr, nbytes: usize, tag: Otag) {
        match nbytes {
            1 | 2 | 4 => {
                let boff = (addr & 3) as usize;
                if boff + nbytes <= 4 {
                    self.word_set(addr, nbytes, tag);
                } else {
                    let lo = 4 - boff;
                    self.word_set(addr, lo, tag);
                    self.store_origin(addr + lo as GuestAddr, nbytes - lo, tag);
                }
            }
            8 | 16 | 32 => {
                let half = nbytes / 2;
                self.store_origin(addr, half, tag);
                self.store_origin(addr + half as GuestAddr, half, tag);
            }
            _ => unreachable!("unsupported origin access width: {nbytes}"),
        }
    }

    /// Record one origin for every word in `[addr, addr + len)`.
    pub fn set_range(&mut self, addr: GuestAddr, len: GuestAddr, tag: Otag) {
        let end = addr + len;
        let mut a = addr;
        while a < end {
            let boff = (a & 3) as usize;
            let n = (4 - boff).min((end - a) as usize);
            self.word_set(a, n, tag);
            a += n as GuestAddr;
        }
    }

    /// Drop origin information for `[addr, addr + len)`. Only lines that
    /// actually exist in either level need touching: an absent line
    /// already means "no origin".
    pub fn clear_range(&mut self, addr: GuestAddr, len: GuestAddr) {
        if len == 0 {
            return;
        }
        let end = addr + len;
        let first = addr & !OC_LINE_MASK;
        for idx in 0..self.lines.len() {
            let tag = self.lines[idx].tag;
            if tag != TAG_EMPTY && tag < end && tag + OC_LINE_BYTES > addr {
                Self::clear_line_overlap(&mut self.lines[idx], addr, end);
            }
        }
        let stale: alloc::vec::Vec<GuestAddr> = self
            .l2
            .range(first..end)
            .map(|(&tag, _)| tag)
            .collect();
        for tag in stale {
            if let Some(line) = self.l2.get_mut(&tag) {
                Self::clear_line_overlap(line, addr, end);
                if line.descr.iter().all(|&d| d == 0) {
                    self.l2.remove(&tag);
                }
            }
        }
    }

    fn clear_line_overlap(line: &mut OCacheLine, lo: GuestAddr, hi: GuestAddr) {
        for w in 0..OC_W32S_PER_LINE {
            let word = line.tag + (w as GuestAddr) * 4;
            for b in 0..4 {
                let byte = word + b;
                if byte >= lo && byte < hi {
                    line.descr[w] &= !(1 << b);
                }
            }
            if line.descr[w] == 0 {
                line.w32[w] = 0;
            }
        }
    }

    pub fn counters(&self) -> OCacheCounters {
        self.counters
    }

    pub fn l2_len(&self) -> usize {
        self.l2.len()
    }

    pub fn clear(&mut self) {
        for line in &mut self.lines {
            *line = OCacheLine::empty();
        }
        self.l2.clear();
    }
}

impl Default for OCache {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for OCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OCache")
            .field("l2_len", &self.l2.len())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}
