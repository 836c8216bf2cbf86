//! # shadow
//! The engine façade: one `ShadowMemory` context object owns the address
//! map, the secondary vbits table, the origin cache, the ignore map and
//! the register shadow, and exposes the narrow call boundary the
//! instrumentation layer drives on every memory access of the monitored
//! program. Findings about the monitored program are queued for the
//! diagnostics layer and execution continues; corrupted engine invariants
//! abort instead.
use alloc::vec::Vec;
use core::ops::Range;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::{
    addrmap::AddressMap,
    ignore::{IgnoreError, IgnoreLabel, IgnoreRanges, DEFAULT_IGNORE_RANGE_CAP},
    ocache::OCache,
    origin::Otag,
    registers::{RegisterShadow, RegisterShadowError},
    report::{AccessKind, Finding, OriginInfo},
    secmap::{page_base, SmRef, Uniform, SM_MASK, SM_SIZE, VA8_DEFINED, VA8_UNDEFINED},
    secvbits::SecVBitTable,
    stats::Stats,
    vbits::{Width, V2, VBITS8_DEFINED, VBITS8_UNDEFINED},
    GuestAddr,
};

/// A single range request this large is almost certainly a caller bug and
/// is flagged once, though it still executes correctly.
const OVERSIZED_RANGE: GuestAddr = 256 * 1024 * 1024;

/// How much checking the engine performs. Each level strictly contains
/// the previous one; origin tracking costs extra memory and CPU and is
/// off by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckLevel {
    /// Addressability only; no undefined-value tracking.
    AddressOnly,
    /// Addressability plus undefined-value tracking.
    Undefined,
    /// Undefined-value tracking with origins.
    UndefinedWithOrigins,
}

#[derive(Debug, Clone)]
pub struct ShadowConfig {
    pub level: CheckLevel,
    /// Ranges ignored from the static configuration list.
    pub configured_ignores: Vec<Range<GuestAddr>>,
    /// Sanity cap on any single ignore range.
    pub ignore_range_cap: GuestAddr,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        ShadowConfig {
            level: CheckLevel::Undefined,
            configured_ignores: Vec::new(),
            ignore_range_cap: DEFAULT_IGNORE_RANGE_CAP,
        }
    }
}

#[derive(Debug)]
pub struct ShadowMemory {
    map: AddressMap,
    secvbits: SecVBitTable,
    ocache: Option<OCache>,
    ignore: IgnoreRanges,
    regs: RegisterShadow,
    findings: Vec<Finding>,
    level: CheckLevel,
    loads: u64,
    stores: u64,
    suppressed: u64,
    oversized: u64,
    oversized_warned: bool,
}

impl ShadowMemory {
    pub fn new(config: ShadowConfig) -> Result<Self, ShadowMemoryError> {
        let mut ignore = IgnoreRanges::new(config.ignore_range_cap);
        for range in &config.configured_ignores {
            ignore.bind(range.clone(), IgnoreLabel::ConfiguredIgnore)?;
        }
        Ok(ShadowMemory {
            map: AddressMap::new(),
            secvbits: SecVBitTable::new(),
            ocache: (config.level == CheckLevel::UndefinedWithOrigins).then(OCache::new),
            ignore,
            regs: RegisterShadow::new(),
            findings: Vec::new(),
            level: config.level,
            loads: 0,
            stores: 0,
            suppressed: 0,
            oversized: 0,
            oversized_warned: false,
        })
    }

    /// Shadow value and addressability of a load. Bytes marked no-access
    /// queue an addressability finding and contribute *defined* shadow
    /// bits, so the one finding does not cascade into spurious
    /// undefined-value reports downstream.
    pub fn load(&mut self, addr: GuestAddr, width: Width) -> (u64, bool) {
        trace!("load - addr: {addr:#x}, width: {}", width.bytes());
        self.loads += 1;
        let n = width.bytes() as GuestAddr;
        addr.checked_add(n).expect("load wraps the address space");

        if self.level == CheckLevel::AddressOnly {
            let ok = self.check_addressable(addr, width.bytes(), AccessKind::Read);
            return (0, ok);
        }

        // Aligned accesses whose summary chunk is uniform are the common
        // case by far and never touch the secondary table.
        if addr & (n - 1) == 0 {
            match width {
                Width::W32 => match self.map.chunk_at(addr) {
                    VA8_DEFINED => return (0, true),
                    VA8_UNDEFINED => return (Width::W32.mask(), true),
                    _ => {}
                },
                Width::W64 => {
                    let c0 = self.map.chunk_at(addr);
                    let c1 = self.map.chunk_at(addr + 4);
                    if c0 == VA8_DEFINED && c1 == VA8_DEFINED {
                        return (0, true);
                    }
                    if c0 == VA8_UNDEFINED && c1 == VA8_UNDEFINED {
                        return (u64::MAX, true);
                    }
                }
                Width::W8 | Width::W16 => {
                    let shift = ((addr & 3) * 2) as u32;
                    let sel_mask = if width == Width::W8 { 0x3 } else { 0xf };
                    let sel = (self.map.chunk_at(addr & !3) >> shift) & sel_mask;
                    if sel == VA8_DEFINED & sel_mask {
                        return (0, true);
                    }
                    if sel == VA8_UNDEFINED & sel_mask {
                        return (width.mask(), true);
                    }
                }
            }
        }
        self.load_slow(addr, width)
    }

    fn load_slow(&mut self, addr: GuestAddr, width: Width) -> (u64, bool) {
        let mut shadow = 0u64;
        let mut ok = true;
        for i in 0..width.bytes() {
            let a = addr + i as GuestAddr;
            let byte = match self.map.get_v2(a) {
                V2::Defined => VBITS8_DEFINED,
                V2::Undefined => VBITS8_UNDEFINED,
                V2::PartDefined => self.secvbits.get(a),
                V2::NoAccess => {
                    ok = false;
                    VBITS8_DEFINED
                }
            };
            shadow |= u64::from(byte) << (8 * i);
        }
        if !ok {
            self.report_access(addr, width.bytes(), AccessKind::Read);
        }
        (shadow, ok)
    }

    /// Record the shadow of a store. Writes to no-access bytes are
    /// dropped after the finding is queued.
    pub fn store(&mut self, addr: GuestAddr, width: Width, shadow: u64) {
        trace!("store - addr: {addr:#x}, width: {}, shadow: {shadow:#x}", width.bytes());
        self.stores += 1;
        let n = width.bytes() as GuestAddr;
        addr.checked_add(n).expect("store wraps the address space");

        if self.level == CheckLevel::AddressOnly {
            self.check_addressable(addr, width.bytes(), AccessKind::Write);
            return;
        }

        // Aligned word store of a uniform shadow onto a uniform chunk:
        // one packed write, and no copy-on-write at all if nothing
        // changes.
        if width == Width::W32 && addr & 3 == 0 {
            let shadow = shadow & Width::W32.mask();
            match self.map.chunk_at(addr) {
                VA8_DEFINED | VA8_UNDEFINED => {
                    if shadow == 0 {
                        self.map.set_chunk(addr, VA8_DEFINED);
                        return;
                    }
                    if shadow == Width::W32.mask() {
                        self.map.set_chunk(addr, VA8_UNDEFINED);
                        return;
                    }
                }
                _ => {}
            }
        }

        let mut ok = true;
        for i in 0..width.bytes() {
            let a = addr + i as GuestAddr;
            if self.map.peek_v2(a) == V2::NoAccess {
                ok = false;
                continue;
            }
            self.store_byte_vbits(a, (shadow >> (8 * i)) as u8);
        }
        if !ok {
            self.report_access(addr, width.bytes(), AccessKind::Write);
        }
    }

    /// Write one byte's full vbits, routing partial patterns through the
    /// secondary table and keeping the PartDefined invariant in both
    /// directions.
    fn store_byte_vbits(&mut self, a: GuestAddr, byte: u8) {
        match V2::pack(byte) {
            V2::PartDefined => {
                if self.secvbits.needs_collection() {
                    let map = &self.map;
                    self.secvbits.collect(|b| map.peek_v2(b) == V2::PartDefined);
                }
                self.secvbits.set(a, byte);
                self.map.set_v2(a, V2::PartDefined);
            }
            v => self.map.set_v2(a, v),
        }
    }

    /// Set every byte of `[addr, addr + len)` to a uniform state: used
    /// for stack growth and teardown, heap alloc/free, mmap/munmap and
    /// mprotect transitions. Fully covered pages are repointed at the
    /// distinguished map in O(1); only the boundary chunks touch packed
    /// storage. Any recorded origins for the range are dropped.
    pub fn mark_range(&mut self, addr: GuestAddr, len: GuestAddr, state: Uniform) {
        debug!("mark_range - addr: {addr:#x}, len: {len:#x}, state: {state:?}");
        if len == 0 {
            return;
        }
        let end = addr.checked_add(len).expect("range wraps the address space");
        if len > OVERSIZED_RANGE {
            self.oversized += 1;
            if !self.oversized_warned {
                warn!("unusually large range request: addr: {addr:#x}, len: {len:#x}");
                self.oversized_warned = true;
            }
        }

        let mut a = addr;
        if a & SM_MASK != 0 {
            let upto = match page_base(a).checked_add(SM_SIZE as GuestAddr) {
                Some(page_end) => end.min(page_end),
                None => end,
            };
            self.set_bytes(a, upto, state);
            a = upto;
        }
        while a < end && end - a >= SM_SIZE as GuestAddr {
            self.map.repoint_page(a, state);
            a += SM_SIZE as GuestAddr;
        }
        if a < end {
            self.set_bytes(a, end, state);
        }

        if let Some(oc) = &mut self.ocache {
            oc.clear_range(addr, len);
        }
    }

    /// Uniform write of `[lo, hi)` within one page, leaving a
    /// distinguished page untouched when it already has the state.
    fn set_bytes(&mut self, lo: GuestAddr, hi: GuestAddr, state: Uniform) {
        match self.map.page_ref(lo) {
            SmRef::Shared(u) if u == state => return,
            _ => {}
        }
        let lo_off = (lo & SM_MASK) as usize;
        let hi_off = lo_off + (hi - lo) as usize;
        self.map.sm_for_writing(lo).set_range(lo_off, hi_off, state.v2());
    }

    /// `mark_range(Undefined)` with the allocation's origin recorded for
    /// every word of the range: the heap/stack allocation path when
    /// origin tracking is enabled.
    pub fn mark_undefined_with_origin(&mut self, addr: GuestAddr, len: GuestAddr, otag: Otag) {
        self.mark_range(addr, len, Uniform::Undefined);
        if let Some(oc) = &mut self.ocache {
            oc.set_range(addr, len, otag);
        }
    }

    /// Make every currently addressable byte of the range defined,
    /// leaving no-access holes alone: the idiom for syscall-return
    /// buffers whose mapping state is not precisely known.
    pub fn mark_defined_if_addressable(&mut self, addr: GuestAddr, len: GuestAddr) {
        debug!("mark_defined_if_addressable - addr: {addr:#x}, len: {len:#x}");
        let end = addr.checked_add(len).expect("range wraps the address space");
        for a in addr..end {
            if self.map.peek_v2(a) != V2::NoAccess {
                self.map.set_v2(a, V2::Defined);
            }
        }
        if let Some(oc) = &mut self.ocache {
            oc.clear_range(addr, len);
        }
    }

    /// Copy shadow state byte-for-byte, two-bit summaries, partial
    /// patterns and origins included: the shadow side of memcpy/memmove
    /// and realloc. Handles overlapping ranges like memmove.
    pub fn copy_range(&mut self, src: GuestAddr, dst: GuestAddr, len: GuestAddr) {
        debug!("copy_range - src: {src:#x}, dst: {dst:#x}, len: {len:#x}");
        src.checked_add(len).expect("range wraps the address space");
        dst.checked_add(len).expect("range wraps the address space");
        let backwards = dst > src;
        for step in 0..len {
            let i = if backwards { len - 1 - step } else { step };
            self.copy_byte(src + i, dst + i);
        }
    }

    fn copy_byte(&mut self, src: GuestAddr, dst: GuestAddr) {
        match self.map.peek_v2(src) {
            V2::PartDefined => {
                let bits = self.secvbits.get(src);
                self.store_byte_vbits(dst, bits);
            }
            v => self.map.set_v2(dst, v),
        }
        if let Some(oc) = &mut self.ocache {
            let tag = oc.load_origin(src, 1);
            oc.store_origin(dst, 1, tag);
        }
    }

    /// The definedness gate for value-consuming operations: branch
    /// conditions, syscall arguments, addresses about to be
    /// dereferenced. Queues a finding when any shadow bit in the width is
    /// undefined.
    pub fn check_value_use(&mut self, shadow: u64, width: Width, origin: Otag) {
        if self.level == CheckLevel::AddressOnly || shadow & width.mask() == 0 {
            return;
        }
        let origin = match self.level {
            CheckLevel::UndefinedWithOrigins => {
                if origin.is_none() {
                    OriginInfo::Unknown
                } else {
                    OriginInfo::Known(origin)
                }
            }
            _ => OriginInfo::Disabled,
        };
        self.findings.push(Finding::UndefinedValue { origin });
    }

    /// Origin of the bytes at `addr`, `NONE` when tracking is disabled.
    pub fn load_origin(&mut self, addr: GuestAddr, nbytes: usize) -> Otag {
        trace!("load_origin - addr: {addr:#x}, len: {nbytes:#x}");
        match &mut self.ocache {
            Some(oc) => oc.load_origin(addr, nbytes),
            None => Otag::NONE,
        }
    }

    pub fn store_origin(&mut self, addr: GuestAddr, nbytes: usize, tag: Otag) {
        trace!("store_origin - addr: {addr:#x}, len: {nbytes:#x}, tag: {:#x}", tag.raw());
        if let Some(oc) = &mut self.ocache {
            oc.store_origin(addr, nbytes, tag);
        }
    }

    pub fn reg_read(&self, offset: usize, width: Width) -> Result<u64, RegisterShadowError> {
        if self.level == CheckLevel::AddressOnly {
            return Ok(0);
        }
        self.regs.read(offset, width)
    }

    pub fn reg_write(
        &mut self,
        offset: usize,
        width: Width,
        shadow: u64,
    ) -> Result<(), RegisterShadowError> {
        let shadow = if self.level == CheckLevel::AddressOnly { 0 } else { shadow };
        self.regs.write(offset, width, shadow)
    }

    pub fn reg_origin(&self, offset: usize) -> Result<Otag, RegisterShadowError> {
        self.regs.origin(offset)
    }

    pub fn reg_set_origin(
        &mut self,
        offset: usize,
        width: Width,
        tag: Otag,
    ) -> Result<(), RegisterShadowError> {
        if self.ocache.is_none() {
            return Ok(());
        }
        self.regs.set_origin(offset, width, tag)
    }

    pub fn classify_ignore(&self, addr: GuestAddr) -> IgnoreLabel {
        self.ignore.classify(addr)
    }

    /// Bind an ignore range at runtime (or unbind, with `NotIgnored`).
    pub fn bind_ignore(
        &mut self,
        range: Range<GuestAddr>,
        label: IgnoreLabel,
    ) -> Result<(), IgnoreError> {
        self.ignore.bind(range, label)
    }

    /// Currently ignored intervals, for the exit-time diagnostics pass.
    pub fn ignored_ranges(&self) -> impl Iterator<Item = (Range<GuestAddr>, IgnoreLabel)> + '_ {
        self.ignore.iter()
    }

    /// Drain the queued findings for the diagnostics layer.
    pub fn take_findings(&mut self) -> Vec<Finding> {
        core::mem::take(&mut self.findings)
    }

    /// Snapshot of counters and occupancy for the operator query.
    pub fn stats(&self) -> Stats {
        Stats {
            loads: self.loads,
            stores: self.stores,
            addrmap: self.map.counters(),
            pages: self.map.census(),
            secvbit_nodes: self.secvbits.len(),
            secvbits: self.secvbits.counters(),
            ocache: self.ocache.as_ref().map(OCache::counters).unwrap_or_default(),
            ocache_l2_len: self.ocache.as_ref().map_or(0, OCache::l2_len),
            findings_suppressed: self.suppressed,
            oversized_set_ranges: self.oversized,
        }
    }

    /// Repoint every known page at `AllDefined` and drop the side tables:
    /// the profiling-reset bulk operation.
    pub fn reset_all_defined(&mut self) {
        debug!("reset_all_defined");
        self.map.repoint_all(Uniform::Defined);
        self.secvbits.clear();
        if let Some(oc) = &mut self.ocache {
            oc.clear();
        }
        self.regs.reset_defined();
    }

    fn check_addressable(&mut self, addr: GuestAddr, len: usize, access: AccessKind) -> bool {
        let mut ok = true;
        for i in 0..len {
            if self.map.get_v2(addr + i as GuestAddr) == V2::NoAccess {
                ok = false;
            }
        }
        if !ok {
            self.report_access(addr, len, access);
        }
        ok
    }

    fn report_access(&mut self, addr: GuestAddr, len: usize, access: AccessKind) {
        if self.ignore.classify(addr) != IgnoreLabel::NotIgnored {
            self.suppressed += 1;
            return;
        }
        self.findings.push(Finding::Addressability { addr, len, access });
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ShadowMemoryError {
    #[error("Bad configured ignore range: {0}")]
    Config(#[from] IgnoreError),
}
