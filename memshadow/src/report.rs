//! # report
//! Findings about the monitored program. These are not errors of the
//! engine: they are reported upward to the diagnostics layer while the
//! engine carries on, treating the offending access as clean for this once
//! so a single root cause does not cascade into thousands of duplicates.
use crate::{origin::Otag, GuestAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// What is known about the origin of an undefined value at report time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginInfo {
    /// Origin tracking is not enabled at the current checking level.
    Disabled,
    /// Tracking is enabled but no origin was recorded for these bytes;
    /// reported as "origin unknown" rather than suppressing the finding.
    Unknown,
    Known(Otag),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// An access touched at least one byte marked no-access.
    Addressability {
        addr: GuestAddr,
        len: usize,
        access: AccessKind,
    },
    /// A value-consuming operation observed undefined bits.
    UndefinedValue { origin: OriginInfo },
}
