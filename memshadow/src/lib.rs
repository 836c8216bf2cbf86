//! # memshadow
//! Byte-granularity validity shadow memory with origin tracking.
//!
//! Every byte of the monitored program's address space is summarised by
//! two shadow bits (no-access / undefined / defined / partially defined),
//! stored in 64 KiB pages that stay as shared, storage-free distinguished
//! maps until a write makes them non-uniform. Bytes whose definedness is
//! mixed at sub-byte granularity keep their exact eight-bit pattern in a
//! garbage-collected side table, and an optional two-level origin cache
//! remembers where each undefined value came from.
//!
//! The engine is driven by an instrumentation layer (not part of this
//! crate) that calls [`ShadowMemory`] once per load, store, register
//! access or allocation event of the monitored program, and threads
//! shadow values through translated code using the pure combination rules
//! in [`policy`]. The engine executes strictly single-threaded, matching
//! a host that schedules one guest thread at a time; it performs no I/O
//! and never blocks.
//!
//! Findings about the monitored program (addressability and definedness
//! violations) are queued for a diagnostics layer and execution
//! continues. A violated internal invariant, by contrast, panics: a
//! corrupted shadow state would silently invalidate every report after
//! it.
#![no_std]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![allow(clippy::unreadable_literal)]
#![cfg_attr(
    not(test),
    warn(
        missing_debug_implementations,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications
    )
)]

extern crate alloc;

pub mod addrmap;
pub mod ignore;
pub mod ocache;
pub mod origin;
pub mod policy;
pub mod registers;
pub mod report;
pub mod secmap;
pub mod secvbits;
pub mod shadow;
pub mod stats;
pub mod vbits;

/// Guest address. The engine models a 64-bit guest regardless of the
/// host's pointer width.
pub type GuestAddr = u64;

pub use shadow::{CheckLevel, ShadowConfig, ShadowMemory, ShadowMemoryError};
