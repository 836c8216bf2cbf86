//! # stats
//! Snapshot of the engine's counters and occupancy, assembled on demand
//! for the operator "dump statistics" query.
use core::fmt;

use crate::{
    addrmap::{AddressMapCounters, PageCensus},
    ocache::OCacheCounters,
    secvbits::SecVBitCounters,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub loads: u64,
    pub stores: u64,
    pub addrmap: AddressMapCounters,
    pub pages: PageCensus,
    pub secvbit_nodes: usize,
    pub secvbits: SecVBitCounters,
    pub ocache: OCacheCounters,
    pub ocache_l2_len: usize,
    pub findings_suppressed: u64,
    pub oversized_set_ranges: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "memory ops:     {} loads, {} stores", self.loads, self.stores)?;
        writeln!(
            f,
            "pages:          {} noaccess, {} undefined, {} defined, {} private",
            self.pages.noaccess, self.pages.undefined, self.pages.defined, self.pages.private
        )?;
        writeln!(
            f,
            "auxmap:         {} L1 hits, {} L2 hits, {} misses",
            self.addrmap.aux_l1_hits, self.addrmap.aux_l2_hits, self.addrmap.aux_misses
        )?;
        writeln!(
            f,
            "secvbits:       {} nodes, {} collections, {} last survivors",
            self.secvbit_nodes, self.secvbits.collections, self.secvbits.last_survivors
        )?;
        writeln!(
            f,
            "ocache:         {} hits, {} misses, {} spills, {} fills, {} L2 lines",
            self.ocache.l1_hits,
            self.ocache.l1_misses,
            self.ocache.spills,
            self.ocache.l2_fills,
            self.ocache_l2_len
        )?;
        write!(
            f,
            "suppressed:     {} findings, {} oversized range requests",
            self.findings_suppressed, self.oversized_set_ranges
        )
    }
}
