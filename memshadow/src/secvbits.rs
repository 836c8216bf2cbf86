//! # secvbits
//! Side table holding the literal eight-bit vbits for bytes whose two-bit
//! summary is `PartDefined`. Nodes cover 16 consecutive bytes and are
//! created lazily the first time a byte in their range goes partial. The
//! table is garbage-collected when it reaches its current limit: a node
//! survives only if at least one of its bytes is still summarised as
//! `PartDefined`, and the limit adapts upward when too many nodes survive.
use core::hash::BuildHasherDefault;

use ahash::AHasher;
use hashbrown::HashMap;
use log::debug;

use crate::{
    vbits::VBITS8_UNDEFINED,
    GuestAddr,
};

type Hasher = BuildHasherDefault<AHasher>;

/// Bytes covered by one node.
pub const NODE_BYTES: usize = 16;
const NODE_MASK: GuestAddr = (NODE_BYTES - 1) as GuestAddr;

const INITIAL_LIMIT: usize = 1024;
const MAX_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone)]
struct SecVBitNode {
    vbits: [u8; NODE_BYTES],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SecVBitCounters {
    pub collections: u64,
    pub last_survivors: usize,
}

#[derive(Debug)]
pub struct SecVBitTable {
    nodes: HashMap<GuestAddr, SecVBitNode, Hasher>,
    /// Node count that triggers the next collection; adapts upward.
    limit: usize,
    counters: SecVBitCounters,
}

impl SecVBitTable {
    pub fn new() -> Self {
        SecVBitTable {
            nodes: HashMap::with_capacity_and_hasher(INITIAL_LIMIT, Hasher::default()),
            limit: INITIAL_LIMIT,
            counters: SecVBitCounters::default(),
        }
    }

    /// Full vbits of the byte at `addr`.
    ///
    /// Panics if no node covers `addr`: a `PartDefined` summary without a
    /// backing node is a corrupted engine invariant, and continuing would
    /// invalidate every later report.
    pub fn get(&self, addr: GuestAddr) -> u8 {
        let node = self
            .nodes
            .get(&(addr & !NODE_MASK))
            .expect("PartDefined byte has no secondary vbits node");
        node.vbits[(addr & NODE_MASK) as usize]
    }

    /// Record the full vbits of the byte at `addr`, creating the owning
    /// node if needed. Sibling bytes of a fresh node default to fully
    /// undefined; their summaries say whether that default is ever read.
    pub fn set(&mut self, addr: GuestAddr, vbits8: u8) {
        let node = self
            .nodes
            .entry(addr & !NODE_MASK)
            .or_insert_with(|| SecVBitNode {
                vbits: [VBITS8_UNDEFINED; NODE_BYTES],
            });
        node.vbits[(addr & NODE_MASK) as usize] = vbits8;
    }

    /// Whether the table has reached its limit; callers collect before the
    /// next insertion when it has.
    #[inline]
    pub fn needs_collection(&self) -> bool {
        self.nodes.len() >= self.limit
    }

    /// Drop every node none of whose bytes is still summarised as partial,
    /// then adapt the limit to the survivor ratio: step up by roughly √2
    /// when more than half survive, drift up slightly when more than 15%
    /// do, bounded by a fixed maximum.
    pub fn collect<F: FnMut(GuestAddr) -> bool>(&mut self, mut is_still_partial: F) {
        let before = self.nodes.len();
        self.nodes.retain(|&base, _| {
            (0..NODE_BYTES as GuestAddr).any(|i| is_still_partial(base + i))
        });
        let survivors = self.nodes.len();

        if survivors * 2 > self.limit {
            self.limit = (self.limit * 1414 / 1000).min(MAX_LIMIT);
        } else if survivors * 20 > self.limit * 3 {
            self.limit = (self.limit * 1015 / 1000 + 1).min(MAX_LIMIT);
        }

        self.counters.collections += 1;
        self.counters.last_survivors = survivors;
        debug!(
            "secvbits collect - before: {before}, survivors: {survivors}, limit: {}",
            self.limit
        );
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn counters(&self) -> SecVBitCounters {
        self.counters
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

impl Default for SecVBitTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbits::V2;

    #[test]
    fn test_set_get() {
        let mut table = SecVBitTable::new();
        table.set(0x1005, 0xf0);
        assert_eq!(table.get(0x1005), 0xf0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_siblings_default_undefined() {
        let mut table = SecVBitTable::new();
        table.set(0x1005, 0x0f);
        assert_eq!(table.get(0x1004), VBITS8_UNDEFINED);
        assert_eq!(table.get(0x1006), VBITS8_UNDEFINED);
    }

    #[test]
    #[should_panic(expected = "no secondary vbits node")]
    fn test_missing_node_is_fatal() {
        let table = SecVBitTable::new();
        table.get(0x2000);
    }

    #[test]
    fn test_collect_drops_fully_overwritten() {
        let mut table = SecVBitTable::new();
        table.set(0x1000, 0xf0);
        table.set(0x2000, 0x0f);
        // Only the node at 0x2000 still has a partial byte.
        table.collect(|addr| addr == 0x2000 && V2::pack(0x0f) == V2::PartDefined);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0x2000), 0x0f);
    }

    #[test]
    fn test_limit_steps_up_on_high_survivor_ratio() {
        let mut table = SecVBitTable::new();
        for i in 0..INITIAL_LIMIT as GuestAddr {
            table.set(i * NODE_BYTES as GuestAddr, 0xf0);
        }
        assert!(table.needs_collection());
        table.collect(|_| true);
        assert_eq!(table.len(), INITIAL_LIMIT);
        // Everything survived, so the limit must have grown past the
        // current population.
        assert!(!table.needs_collection());
    }

    #[test]
    fn test_limit_drifts_up_on_moderate_survivor_ratio() {
        let mut table = SecVBitTable::new();
        for i in 0..INITIAL_LIMIT as GuestAddr {
            table.set(i * NODE_BYTES as GuestAddr, 0xf0);
        }
        // Keep ~20% of the nodes: above the drift threshold, below step-up.
        table.collect(|addr| (addr / NODE_BYTES as GuestAddr) % 5 == 0);
        let survivors = table.len();
        assert!(survivors * 2 <= INITIAL_LIMIT);
        assert!(survivors * 20 > INITIAL_LIMIT * 3);
        assert_eq!(table.counters().last_survivors, survivors);
        assert_eq!(table.counters().collections, 1);
    }
}
