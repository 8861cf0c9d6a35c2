//! Dynamic memory for kernel code.
//!
//! [`KernelHeap`] hands out variable sized blocks from one contiguous range
//! of virtual memory that starts at a fixed base and grows and shrinks page
//! by page. Blocks ("segments") are kept in an address-ordered list whose
//! headers live in-band, right in front of each payload:
//!
//! ```text
//!  base                                                            top
//!  │                                                                │
//!  ▼                                                                ▼
//!  ┌──────┬─────────┬──────┬───────────────┬──────┬─────────────────┐
//!  │ hdr  │ used    │ hdr  │ free (zeroed) │ hdr  │ used            │
//!  └──────┴─────────┴──────┴───────────────┴──────┴─────────────────┘
//!  ├────── reserved_min (never given back) ──────┤
//!  ├──────────────────── up to reserved_max ───────────────────────────┤
//! ```
//!
//! # Allocation policy
//!
//! - Requests are rounded up to 16 bytes; payloads are 16-byte aligned.
//! - The first free segment large enough wins. Leftover space of more than a
//!   header is split off as a new free segment.
//! - When nothing fits, the range grows: a free last segment is extended, a
//!   used one gets a new successor.
//! - Freed segments merge with free neighbors, so no two free segments are
//!   ever adjacent, and their payloads are zero-filled.
//! - A free tail above `reserved_min` is unmapped again.
//!
//! # Error model
//!
//! The heap does not report failure to its callers. Running out of memory,
//! corrupted headers, double frees, foreign pointers, recursive locking and
//! use with interrupts disabled all end in a fatal [`HeapError`] report that
//! names the heap code that detected the problem and the caller that
//! triggered it.
//!
//! # Platform
//!
//! Frames, page tables and the scheduler are reached only through the traits
//! in [`platform`]. [`GlobalHeap`] turns an installed heap into a
//! [`GlobalAlloc`](core::alloc::GlobalAlloc).

#![cfg_attr(not(test), no_std)]

pub use self::{
    config::{ConfigError, HeapConfig},
    error::{CallSite, HeapError, Report},
    global::GlobalHeap,
    heap::KernelHeap,
    list::HeapStats,
    segment::{ALIGN, HEADER_SIZE},
};

mod config;
mod error;
mod global;
mod heap;
mod list;
mod lock;
pub mod platform;
mod range;
mod segment;
#[cfg(test)]
mod testing;
