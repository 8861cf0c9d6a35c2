//! In-band segment header.
//!
//! Every block of the heap, used or free, starts with a [`SegmentHeader`].
//! The payload handed to callers begins right after it:
//!
//! ```text
//! ┌──────────────────────────────────────┬──────────────────────────┐
//! │ SegmentHeader (HEADER_SIZE bytes)    │ payload (size bytes)     │
//! │ guard | used | size | prev | next |  │                          │
//! │ allocated_at | allocated_by | freed_at│                          │
//! └──────────────────────────────────────┴──────────────────────────┘
//! ^ segment offset                       ^ segment offset + HEADER_SIZE
//! ```
//!
//! Links are byte offsets from the heap base rather than pointers, so a
//! corrupted link can be range-checked before it is followed.

use crate::{error::CallSite, platform::ContextId};

/// Sentinel stored in every header.
pub const GUARD: u32 = 0xdead_beef;

/// Granule of payload sizes and payload addresses.
pub const ALIGN: usize = 16;

/// Bytes occupied by one header.
pub const HEADER_SIZE: usize = size_of::<SegmentHeader>();

const _: () = assert!(align_of::<SegmentHeader>() == ALIGN);
const _: () = assert!(HEADER_SIZE.is_multiple_of(ALIGN));

/// Rounds `size` up to the next multiple of [`ALIGN`].
///
/// The caller must have rejected sizes with the sign bit set, so this cannot
/// overflow.
pub(crate) const fn round_up(size: usize) -> usize {
    (size + (ALIGN - 1)) & !(ALIGN - 1)
}

/// Link value of a missing neighbor.
const NIL: usize = usize::MAX;

#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentHeader {
    pub(crate) guard: u32,
    pub(crate) used: bool,
    /// Payload bytes following the header.
    pub(crate) size: usize,
    prev: usize,
    next: usize,
    /// Recorded only while tracing is enabled.
    pub(crate) allocated_at: Option<CallSite>,
    pub(crate) allocated_by: Option<ContextId>,
    pub(crate) freed_at: Option<CallSite>,
}

impl SegmentHeader {
    pub(crate) const fn new(prev: Option<usize>, next: Option<usize>, size: usize) -> Self {
        Self {
            guard: GUARD,
            used: false,
            size,
            prev: encode(prev),
            next: encode(next),
            allocated_at: None,
            allocated_by: None,
            freed_at: None,
        }
    }

    pub(crate) const fn is_intact(&self) -> bool {
        self.guard == GUARD
    }

    pub(crate) const fn prev(&self) -> Option<usize> {
        decode(self.prev)
    }

    pub(crate) const fn next(&self) -> Option<usize> {
        decode(self.next)
    }

    pub(crate) const fn set_prev(&mut self, prev: Option<usize>) {
        self.prev = encode(prev);
    }

    pub(crate) const fn set_next(&mut self, next: Option<usize>) {
        self.next = encode(next);
    }

    /// Offset one past the payload of the segment at `offset`.
    pub(crate) const fn end(&self, offset: usize) -> usize {
        offset + HEADER_SIZE + self.size
    }
}

const fn encode(link: Option<usize>) -> usize {
    match link {
        Some(offset) => offset,
        None => NIL,
    }
}

const fn decode(link: usize) -> Option<usize> {
    if link == NIL { None } else { Some(link) }
}
