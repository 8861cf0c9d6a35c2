//! The address-ordered list of segments covering the heap range.
//!
//! Segments tile `base..base + top` without gaps: the first one always sits
//! at offset 0, every `next` link equals the end of the segment's payload and
//! the last segment ends exactly at `top`. Links are checked against these
//! rules before they are followed, and every header's guard is checked before
//! the header is used.

use core::{ptr::NonNull, slice};

use snafu::ensure;

use crate::{
    error::{
        AddressOutOfRangeSnafu, BrokenLinkSnafu, CeilingReachedSnafu, CorruptedSnafu, HeapError,
        InconsistentSnafu, MisalignedAddressSnafu, UseAfterFreeSnafu,
    },
    platform::{FrameProvider, PageMapper},
    range::HeapRange,
    segment::{ALIGN, GUARD, HEADER_SIZE, SegmentHeader},
};

/// Totals gathered by a walk over the whole list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Payload bytes of used segments.
    pub used_bytes: usize,
    pub used_blocks: usize,
    /// Payload bytes of free segments.
    pub free_bytes: usize,
    pub free_blocks: usize,
    /// Bytes from the heap base to the current top.
    pub heap_size: usize,
    pub mapped_pages: usize,
}

pub(crate) struct SegmentList<B> {
    range: HeapRange<B>,
    last: usize,
}

impl<B> SegmentList<B>
where
    B: FrameProvider + PageMapper,
{
    /// Covers the whole initial range with one free segment.
    pub(crate) fn new(range: HeapRange<B>) -> Self {
        let size = range.top() - HEADER_SIZE;
        let mut list = Self { range, last: 0 };
        list.write(0, &SegmentHeader::new(None, None, size));
        list
    }

    /// Absolute address of `offset`.
    pub(crate) fn addr(&self, offset: usize) -> usize {
        self.range.addr(offset)
    }

    #[cfg(test)]
    pub(crate) fn top(&self) -> usize {
        self.range.top()
    }

    /// Payload pointer of the segment at `offset`.
    pub(crate) fn payload(&self, offset: usize) -> NonNull<u8> {
        unsafe { self.range.base().add(offset + HEADER_SIZE) }
    }

    fn header_ptr(&self, offset: usize) -> *mut SegmentHeader {
        unsafe { self.range.base().add(offset).cast::<SegmentHeader>().as_ptr() }
    }

    /// Reads the header at `offset` after checking its guard.
    ///
    /// `offset` must come from the list itself or from [`Self::resolve`].
    pub(crate) fn read(&self, offset: usize) -> Result<SegmentHeader, HeapError> {
        debug_assert!(offset + HEADER_SIZE <= self.range.top());
        let ptr = self.header_ptr(offset);
        // the guard and size are plain integers and can be read whatever the
        // rest of the header contains
        let guard = unsafe { (&raw const (*ptr).guard).read() };
        if guard != GUARD {
            let size = unsafe { (&raw const (*ptr).size).read() };
            return CorruptedSnafu {
                segment: self.addr(offset),
                size,
                guard,
            }
            .fail();
        }
        Ok(unsafe { ptr.read() })
    }

    pub(crate) fn write(&mut self, offset: usize, header: &SegmentHeader) {
        debug_assert!(header.is_intact());
        unsafe { self.header_ptr(offset).write(*header) }
    }

    /// Applies `f` to the header at `offset` and writes it back.
    pub(crate) fn update<F>(&mut self, offset: usize, f: F) -> Result<SegmentHeader, HeapError>
    where
        F: FnOnce(&mut SegmentHeader),
    {
        let mut header = self.read(offset)?;
        f(&mut header);
        self.write(offset, &header);
        Ok(header)
    }

    fn broken_link(&self, offset: usize, link: usize) -> HeapError {
        BrokenLinkSnafu {
            segment: self.addr(offset),
            link: self.addr(link),
            top: self.addr(self.range.top()),
        }
        .build()
    }

    /// Follows the `next` link of the segment at `offset`.
    pub(crate) fn next_of(
        &self,
        offset: usize,
        header: &SegmentHeader,
    ) -> Result<Option<usize>, HeapError> {
        let Some(next) = header.next() else {
            return Ok(None);
        };
        let end = offset
            .checked_add(HEADER_SIZE)
            .and_then(|o| o.checked_add(header.size));
        let fits = next
            .checked_add(HEADER_SIZE)
            .is_some_and(|e| e <= self.range.top());
        if end != Some(next) || !fits {
            return Err(self.broken_link(offset, next));
        }
        Ok(Some(next))
    }

    /// Follows the `prev` link of the segment at `offset`.
    pub(crate) fn prev_of(
        &self,
        offset: usize,
        header: &SegmentHeader,
    ) -> Result<Option<usize>, HeapError> {
        match header.prev() {
            None if offset == 0 => Ok(None),
            Some(prev) if prev < offset && prev.is_multiple_of(ALIGN) => Ok(Some(prev)),
            prev => Err(self.broken_link(offset, prev.unwrap_or(usize::MAX))),
        }
    }

    pub(crate) fn segments(&self) -> Segments<'_, B> {
        Segments {
            list: self,
            next: Some(0),
        }
    }

    /// First free segment with a payload of at least `size` bytes.
    pub(crate) fn find_free(&self, size: usize) -> Result<Option<usize>, HeapError> {
        for item in self.segments() {
            let (offset, header) = item?;
            log::trace!(
                "find_free: segment {:#x} size {:#x} used {}",
                self.addr(offset),
                header.size,
                header.used
            );
            if !header.used && header.size >= size {
                return Ok(Some(offset));
            }
        }
        Ok(None)
    }

    /// Grows the heap so that the last segment is free with a payload of
    /// exactly `size` bytes, and returns its offset.
    ///
    /// A used last segment gets a fresh free successor; a free one is
    /// extended in place.
    pub(crate) fn extend(&mut self, size: usize) -> Result<usize, HeapError> {
        let last = self.read(self.last)?;
        let top = self.range.top();
        let new_top = if last.used {
            top.saturating_add(HEADER_SIZE).saturating_add(size)
        } else {
            debug_assert!(last.size < size);
            top.saturating_add(size - last.size)
        };

        if !self.range.fits(new_top) {
            let stats = self.stats()?;
            return CeilingReachedSnafu {
                requested: new_top - top,
                size: top,
                max: self.range.reserved_max(),
                used: stats.used_bytes,
                blocks: stats.used_blocks,
            }
            .fail();
        }

        log::debug!(
            "kernel heap: grow top from {:#x} to {:#x}",
            self.addr(top),
            self.addr(new_top)
        );
        self.range.set_top(new_top)?;

        if last.used {
            let offset = top;
            self.write(offset, &SegmentHeader::new(Some(self.last), None, size));
            let mut last = last;
            last.set_next(Some(offset));
            self.write(self.last, &last);
            self.last = offset;
        } else {
            let mut last = last;
            last.size = size;
            self.write(self.last, &last);
        }
        Ok(self.last)
    }

    /// Marks the segment at `offset` used with a payload of `size` bytes.
    ///
    /// When more than a header's worth of payload is left over, the tail is
    /// split off as a new free segment whose offset is returned.
    pub(crate) fn fill(&mut self, offset: usize, size: usize) -> Result<Option<usize>, HeapError> {
        let mut header = self.read(offset)?;
        assert!(size.is_multiple_of(ALIGN), "segment size {size:#x} is not aligned");
        assert!(
            header.size >= size,
            "segment of {:#x} bytes is too small for {size:#x}",
            header.size
        );
        let next = self.next_of(offset, &header)?;
        let next_header = next.map(|next| self.read(next)).transpose()?;

        header.used = true;
        let space_left = header.size - size;
        let mut remainder = None;
        if space_left > HEADER_SIZE {
            let split = offset + HEADER_SIZE + size;
            self.write(
                split,
                &SegmentHeader::new(Some(offset), next, space_left - HEADER_SIZE),
            );
            match (next, next_header) {
                (Some(next), Some(mut next_header)) => {
                    next_header.set_prev(Some(split));
                    self.write(next, &next_header);
                }
                _ => self.last = split,
            }
            header.size = size;
            header.set_next(Some(split));
            remainder = Some(split);
        }
        self.write(offset, &header);
        Ok(remainder)
    }

    /// Merges the neighbor `other` into `keep` if it exists and is free.
    ///
    /// Returns the offset of the surviving segment, which is the lower of the
    /// two. The absorbed header is cleared so it reads as part of a zeroed
    /// payload.
    pub(crate) fn merge(&mut self, keep: usize, other: Option<usize>) -> Result<usize, HeapError> {
        let Some(other) = other else {
            return Ok(keep);
        };
        let keep_header = self.read(keep)?;
        let other_header = self.read(other)?;
        if other_header.used {
            return Ok(keep);
        }

        let (low, mut low_header, high, high_header) = if other < keep {
            (other, other_header, keep, keep_header)
        } else {
            (keep, keep_header, other, other_header)
        };
        ensure!(
            low_header.next() == Some(high),
            InconsistentSnafu {
                segment: self.addr(low),
                detail: "merged with a segment that is not its neighbor",
            }
        );

        let next = self.next_of(high, &high_header)?;
        let next_header = next.map(|next| self.read(next)).transpose()?;
        ensure!(
            next.is_some() || high == self.last,
            InconsistentSnafu {
                segment: self.addr(high),
                detail: "segment without successor is not the last one",
            }
        );
        match (next, next_header) {
            (Some(next), Some(mut next_header)) => {
                next_header.set_prev(Some(low));
                self.write(next, &next_header);
            }
            _ => self.last = low,
        }
        low_header.size += HEADER_SIZE + high_header.size;
        low_header.set_next(next);
        self.write(low, &low_header);
        unsafe {
            self.range.zero(high, HEADER_SIZE);
        }
        Ok(low)
    }

    /// Clears `len` payload bytes of the segment at `offset`.
    pub(crate) fn zero_payload(&mut self, offset: usize, len: usize) {
        unsafe {
            self.range.zero(offset + HEADER_SIZE, len);
        }
    }

    /// Checks that the whole payload of a free segment is still zero.
    ///
    /// A modified byte in a segment that remembers where it was freed is a
    /// use after free. Without that record the bytes are cleared and only a
    /// warning is logged.
    pub(crate) fn verify_zeroed(&mut self, offset: usize) -> Result<(), HeapError> {
        let header = self.read(offset)?;
        debug_assert!(!header.used);
        let payload_addr = self.addr(offset + HEADER_SIZE);
        let payload =
            unsafe { slice::from_raw_parts_mut(self.payload(offset).as_ptr(), header.size) };
        let Some(pos) = payload.iter().position(|&b| b != 0) else {
            return Ok(());
        };

        let addr = payload_addr + pos;
        let value = payload[pos];
        if let Some(freed_at) = header.freed_at {
            return UseAfterFreeSnafu {
                addr,
                value,
                freed_at,
            }
            .fail();
        }
        log::warn!("kernel heap: free memory not zero at {addr:#x} (value: {value:#x})");
        payload[pos..].fill(0);
        Ok(())
    }

    /// Gives memory back to the platform when the free segment at `offset`
    /// is the last one.
    ///
    /// A tail segment lying wholly above the reserved minimum is removed.
    /// One straddling it is cut back to end at the reserved minimum. The
    /// first segment is never removed.
    pub(crate) fn trim(&mut self, offset: usize) -> Result<(), HeapError> {
        if offset != self.last {
            return Ok(());
        }
        let mut header = self.read(offset)?;
        debug_assert!(!header.used);
        let floor = self.range.reserved_min();

        if offset != 0 && offset >= floor {
            let Some(prev) = self.prev_of(offset, &header)? else {
                return Err(self.broken_link(offset, usize::MAX));
            };
            let mut prev_header = self.read(prev)?;
            prev_header.set_next(None);
            self.write(prev, &prev_header);
            self.last = prev;
            self.range.set_top(offset)?;
        } else if header.end(offset) > floor {
            header.size = floor.saturating_sub(offset + HEADER_SIZE);
            self.write(offset, &header);
            self.range.set_top(header.end(offset))?;
        }
        Ok(())
    }

    /// Maps a payload address handed out earlier back to its segment.
    pub(crate) fn resolve(&self, addr: usize) -> Result<usize, HeapError> {
        let start = self.addr(0);
        let end = self.addr(self.range.top());
        ensure!(
            addr >= start + HEADER_SIZE && addr < end,
            AddressOutOfRangeSnafu { addr, start, end }
        );
        let offset = addr - start - HEADER_SIZE;
        ensure!(offset.is_multiple_of(ALIGN), MisalignedAddressSnafu { addr });
        Ok(offset)
    }

    /// Walks the whole list checking its structure and adds up its
    /// segments.
    pub(crate) fn stats(&self) -> Result<HeapStats, HeapError> {
        let mut stats = HeapStats {
            heap_size: self.range.top(),
            mapped_pages: self.range.mapped_pages(),
            ..HeapStats::default()
        };
        let mut prev: Option<(usize, SegmentHeader)> = None;
        for item in self.segments() {
            let (offset, header) = item?;
            if let Some((prev_offset, _)) = prev {
                if header.prev() != Some(prev_offset) {
                    return Err(self.broken_link(offset, header.prev().unwrap_or(usize::MAX)));
                }
            }
            if header.used {
                stats.used_bytes += header.size;
                stats.used_blocks += 1;
            } else {
                ensure!(
                    prev.is_none_or(|(_, prev)| prev.used),
                    InconsistentSnafu {
                        segment: self.addr(offset),
                        detail: "free segment follows another free segment",
                    }
                );
                stats.free_bytes += header.size;
                stats.free_blocks += 1;
            }
            prev = Some((offset, header));
        }

        if let Some((offset, header)) = prev {
            ensure!(
                offset == self.last,
                InconsistentSnafu {
                    segment: self.addr(offset),
                    detail: "last segment is not where it is recorded",
                }
            );
            ensure!(
                header.end(offset) == self.range.top(),
                InconsistentSnafu {
                    segment: self.addr(offset),
                    detail: "last segment does not end at the heap top",
                }
            );
        }
        Ok(stats)
    }

    #[cfg(test)]
    pub(crate) fn backing(&self) -> &B {
        self.range.backing()
    }

    /// `(offset, size, used)` of every segment.
    #[cfg(test)]
    pub(crate) fn shape(&self) -> Vec<(usize, usize, bool)> {
        self.segments()
            .map(|item| {
                let (offset, header) = item.unwrap();
                (offset, header.size, header.used)
            })
            .collect()
    }
}

/// Iterator over `(offset, header)` of every segment in address order.
///
/// Stops after the first error.
pub(crate) struct Segments<'a, B> {
    list: &'a SegmentList<B>,
    next: Option<usize>,
}

impl<B> Iterator for Segments<'_, B>
where
    B: FrameProvider + PageMapper,
{
    type Item = Result<(usize, SegmentHeader), HeapError>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next.take()?;
        let item = self.list.read(offset).and_then(|header| {
            self.next = self.list.next_of(offset, &header)?;
            Ok((offset, header))
        });
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{platform::PAGE_SIZE, testing::HostPlatform};

    fn with_list<F>(min_pages: usize, max_pages: usize, test_fn: F)
    where
        F: FnOnce(&mut SegmentList<HostPlatform>),
    {
        let platform = HostPlatform::new(min_pages, max_pages, max_pages);
        let config = platform.config();
        let range = unsafe { HeapRange::new(&config, platform) };
        let mut list = SegmentList::new(range);
        test_fn(&mut list);
    }

    #[test]
    fn test_initial_segment_covers_range() {
        with_list(1, 2, |list| {
            assert_eq!(list.shape(), [(0, PAGE_SIZE - HEADER_SIZE, false)]);
            let stats = list.stats().unwrap();
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.heap_size, PAGE_SIZE);
        });
    }

    #[test]
    fn test_fill_splits_large_leftover() {
        with_list(1, 2, |list| {
            // a free 256 byte segment followed by a used one
            let rest = list.fill(0, 256).unwrap().unwrap();
            let rest_size = list.read(rest).unwrap().size;
            list.fill(rest, rest_size).unwrap();
            let freed = list.update(0, |h| h.used = false).unwrap();
            assert_eq!(freed.size, 256);

            let remainder = list.fill(0, 64).unwrap();
            assert_eq!(remainder, Some(HEADER_SIZE + 64));
            assert_eq!(
                list.shape(),
                [
                    (0, 64, true),
                    (HEADER_SIZE + 64, 128, false),
                    (rest, rest_size, true)
                ]
            );
            list.stats().unwrap();
        });
    }

    #[test]
    fn test_fill_keeps_small_leftover() {
        with_list(1, 2, |list| {
            let size = PAGE_SIZE - HEADER_SIZE - HEADER_SIZE;
            assert_eq!(list.fill(0, size).unwrap(), None);
            assert_eq!(list.shape(), [(0, PAGE_SIZE - HEADER_SIZE, true)]);
        });
    }

    #[test]
    fn test_merge_absorbs_free_neighbor() {
        with_list(1, 2, |list| {
            list.fill(0, 0x100).unwrap();
            let second = HEADER_SIZE + 0x100;
            let third = list.fill(second, 0x100).unwrap().unwrap();
            list.fill(third, 0x100).unwrap();

            list.update(second, |h| h.used = false).unwrap();
            list.zero_payload(second, 0x100);
            let survivor = list.merge(second, Some(third)).unwrap();
            // `third` is used and stays
            assert_eq!(survivor, second);

            list.update(0, |h| h.used = false).unwrap();
            let survivor = list.merge(second, Some(0)).unwrap();
            assert_eq!(survivor, 0);
            assert_eq!(list.shape()[0], (0, 0x100 + HEADER_SIZE + 0x100, false));
            assert_eq!(list.shape()[1].0, third);

            // the absorbed header reads as zeroes
            let old_header = unsafe {
                slice::from_raw_parts(list.payload(0).add(0x100).as_ptr(), HEADER_SIZE)
            };
            assert!(old_header.iter().all(|&b| b == 0));
            list.stats().unwrap();
        });
    }

    #[test]
    fn test_inconsistent_lists_are_rejected() {
        with_list(1, 2, |list| {
            list.fill(0, 0x40).unwrap();
            let second = HEADER_SIZE + 0x40;
            let third = list.fill(second, 0x40).unwrap().unwrap();

            let err = list.merge(0, Some(third)).unwrap_err();
            assert!(matches!(err, HeapError::Inconsistent { segment, .. } if segment == list.addr(0)));

            list.update(second, |h| h.used = false).unwrap();
            let err = list.stats().unwrap_err();
            assert!(matches!(err, HeapError::Inconsistent { segment, .. } if segment == list.addr(third)));
        });
    }

    #[test]
    fn test_extend_appends_after_used_last() {
        with_list(1, 4, |list| {
            list.fill(0, PAGE_SIZE - HEADER_SIZE).unwrap();
            let offset = list.extend(0x200).unwrap();
            assert_eq!(offset, PAGE_SIZE);
            assert_eq!(list.top(), PAGE_SIZE + HEADER_SIZE + 0x200);
            list.backing().assert_mapped(2);
            list.stats().unwrap();
        });
    }

    #[test]
    fn test_extend_grows_free_last_in_place() {
        with_list(1, 4, |list| {
            let offset = list.extend(PAGE_SIZE).unwrap();
            assert_eq!(offset, 0);
            assert_eq!(list.shape(), [(0, PAGE_SIZE, false)]);
            assert_eq!(list.top(), PAGE_SIZE + HEADER_SIZE);
        });
    }

    #[test]
    fn test_extend_stops_at_ceiling() {
        with_list(1, 2, |list| {
            list.fill(0, 0x100).unwrap();
            let err = list.extend(2 * PAGE_SIZE).unwrap_err();
            match err {
                HeapError::CeilingReached {
                    used, blocks, max, ..
                } => {
                    assert_eq!(used, 0x100);
                    assert_eq!(blocks, 1);
                    assert_eq!(max, 2 * PAGE_SIZE);
                }
                err => panic!("unexpected error: {err}"),
            }
            assert_eq!(list.top(), PAGE_SIZE);
        });
    }

    #[test]
    fn test_trim_removes_tail_above_floor() {
        with_list(1, 4, |list| {
            list.fill(0, PAGE_SIZE - HEADER_SIZE).unwrap();
            let tail = list.extend(2 * PAGE_SIZE).unwrap();
            list.backing().assert_mapped(4);

            list.trim(tail).unwrap();
            assert_eq!(list.shape(), [(0, PAGE_SIZE - HEADER_SIZE, true)]);
            assert_eq!(list.top(), PAGE_SIZE);
            list.backing().assert_mapped(1);
        });
    }

    #[test]
    fn test_trim_cuts_first_segment_to_floor() {
        with_list(1, 4, |list| {
            list.extend(2 * PAGE_SIZE).unwrap();
            list.trim(0).unwrap();
            assert_eq!(list.shape(), [(0, PAGE_SIZE - HEADER_SIZE, false)]);
            assert_eq!(list.top(), PAGE_SIZE);
            list.backing().assert_mapped(1);
        });
    }

    #[test]
    fn test_corrupted_guard_is_reported() {
        with_list(1, 2, |list| {
            unsafe { list.range.base().cast::<u32>().write(0x1234_5678) };
            let err = list.read(0).unwrap_err();
            assert!(matches!(
                err,
                HeapError::Corrupted {
                    guard: 0x1234_5678,
                    ..
                }
            ));
            assert!(list.find_free(16).is_err());
        });
    }

    #[test]
    fn test_resolve_checks_range_and_alignment() {
        with_list(1, 2, |list| {
            let start = list.addr(0);
            assert_eq!(list.resolve(start + HEADER_SIZE).unwrap(), 0);
            assert!(matches!(
                list.resolve(start).unwrap_err(),
                HeapError::AddressOutOfRange { .. }
            ));
            assert!(matches!(
                list.resolve(start + PAGE_SIZE).unwrap_err(),
                HeapError::AddressOutOfRange { .. }
            ));
            assert!(matches!(
                list.resolve(start + HEADER_SIZE + 8).unwrap_err(),
                HeapError::MisalignedAddress { .. }
            ));
        });
    }

    #[test]
    fn test_verify_zeroed_reports_write_after_free() {
        with_list(1, 2, |list| {
            unsafe { list.payload(0).add(5).write(0x42) };
            // nothing records a free yet, so the byte is only cleared
            list.verify_zeroed(0).unwrap();
            list.verify_zeroed(0).unwrap();

            list.update(0, |h| h.freed_at = Some(crate::error::CallSite::caller()))
                .unwrap();
            let tail = list.read(0).unwrap().size - 1;
            unsafe { list.payload(0).add(tail).write(0x42) };
            let err = list.verify_zeroed(0).unwrap_err();
            assert!(matches!(err, HeapError::UseAfterFree { value: 0x42, .. }));
        });
    }
}
