//! # ignore
//! Interval map marking address ranges whose findings should be
//! suppressed. The map stores only ignored spans as a disjoint, sorted set
//! of labeled intervals (the backing `RangeMap` splits and coalesces on
//! insert); every address outside them classifies as `NotIgnored`, so the
//! whole address space is always a disjoint labeled partition. Labels
//! distinguish whether an ignore came from static configuration or from a
//! runtime request, purely for exit-time diagnostics. The map gates error
//! reporting only; shadow contents are unaffected by it.
use core::ops::Range;

use log::{debug, warn};
use rangemap::RangeMap;
use thiserror::Error;

use crate::GuestAddr;

/// Default cap on a single ignore range; anything larger is a probable
/// misconfiguration.
pub const DEFAULT_IGNORE_RANGE_CAP: GuestAddr = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreLabel {
    NotIgnored,
    /// Ignored via the static configuration list.
    ConfiguredIgnore,
    /// Ignored via a runtime request.
    RuntimeIgnore,
}

#[derive(Debug)]
pub struct IgnoreRanges {
    map: RangeMap<GuestAddr, IgnoreLabel>,
    cap: GuestAddr,
}

impl IgnoreRanges {
    pub fn new(cap: GuestAddr) -> Self {
        IgnoreRanges {
            map: RangeMap::new(),
            cap,
        }
    }

    /// Bind `[range.start, range.end)` to `label`, splitting or absorbing
    /// any overlapping existing intervals. Binding `NotIgnored` removes
    /// the span. Empty and oversized ranges are rejected.
    pub fn bind(&mut self, range: Range<GuestAddr>, label: IgnoreLabel) -> Result<(), IgnoreError> {
        debug!(
            "bind - start: {:#x}, end: {:#x}, label: {label:?}",
            range.start, range.end
        );
        if range.start >= range.end {
            warn!("ignore range rejected, empty: {:#x}..{:#x}", range.start, range.end);
            Err(IgnoreError::EmptyRange(range.start, range.end))?;
        }
        if range.end - range.start > self.cap {
            warn!(
                "ignore range rejected, larger than {:#x}: {:#x}..{:#x}",
                self.cap, range.start, range.end
            );
            Err(IgnoreError::RangeTooLarge(range.start, range.end, self.cap))?;
        }
        match label {
            IgnoreLabel::NotIgnored => self.map.remove(range),
            label => self.map.insert(range, label),
        }
        Ok(())
    }

    /// Label of the interval containing `addr`.
    pub fn classify(&self, addr: GuestAddr) -> IgnoreLabel {
        self.map
            .get(&addr)
            .copied()
            .unwrap_or(IgnoreLabel::NotIgnored)
    }

    /// The containing ignored interval and its label, if any.
    pub fn lookup(&self, addr: GuestAddr) -> Option<(Range<GuestAddr>, IgnoreLabel)> {
        self.map
            .get_key_value(&addr)
            .map(|(range, &label)| (range.clone(), label))
    }

    /// Currently ignored intervals in address order, for the exit-time
    /// diagnostics pass.
    pub fn iter(&self) -> impl Iterator<Item = (Range<GuestAddr>, IgnoreLabel)> + '_ {
        self.map.iter().map(|(range, &label)| (range.clone(), label))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum IgnoreError {
    #[error("Empty ignore range: {0:x}..{1:x}")]
    EmptyRange(GuestAddr, GuestAddr),
    #[error("Ignore range too large: {0:x}..{1:x}, cap: {2:x}")]
    RangeTooLarge(GuestAddr, GuestAddr, GuestAddr),
}
