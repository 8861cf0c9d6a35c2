//! The address window owned by the heap and its page-granular backing.
//!
//! `top` is kept as an offset from `base`. The pages backing
//! `base..base + top` are always mapped; growing maps fresh, zeroed frames
//! one page at a time and shrinking hands them back top-down.

use core::ptr::NonNull;

use snafu::OptionExt as _;

use crate::{
    config::HeapConfig,
    error::{HeapError, OutOfFramesSnafu},
    platform::{FrameProvider, PAGE_SIZE, PageMapper, VirtPageNum},
};

pub(crate) struct HeapRange<B> {
    base: NonNull<u8>,
    top: usize,
    reserved_min: usize,
    reserved_max: usize,
    backing: B,
}

// The window is owned exclusively by the range.
unsafe impl<B> Send for HeapRange<B> where B: Send {}

impl<B> HeapRange<B>
where
    B: FrameProvider + PageMapper,
{
    /// Takes over the window described by `config` with its first
    /// `reserved_min` bytes already mapped.
    ///
    /// # Safety
    ///
    /// `config.base()..config.base() + config.reserved_min()` must be mapped,
    /// writable and exclusively owned by the heap, and the rest of the window
    /// up to `reserved_max` must be free virtual address space the heap may
    /// map through `backing`.
    pub(crate) unsafe fn new(config: &HeapConfig, backing: B) -> Self {
        let mut range = Self {
            base: config.base(),
            top: config.reserved_min(),
            reserved_min: config.reserved_min(),
            reserved_max: config.reserved_max(),
            backing,
        };
        log::debug!(
            "kernel heap starts at {:#x} and initially ends at {:#x}",
            range.addr(0),
            range.addr(range.top)
        );
        unsafe {
            range.zero(0, range.top);
        }
        range
    }

    /// Absolute address of `offset`.
    ///
    /// Wraps instead of overflowing so that garbage offsets read from a
    /// corrupted header can still be reported.
    pub(crate) fn addr(&self, offset: usize) -> usize {
        self.base.addr().get().wrapping_add(offset)
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn top(&self) -> usize {
        self.top
    }

    pub(crate) fn reserved_min(&self) -> usize {
        self.reserved_min
    }

    pub(crate) fn reserved_max(&self) -> usize {
        self.reserved_max
    }

    /// Number of pages backing `base..base + top`.
    pub(crate) fn mapped_pages(&self) -> usize {
        self.top.div_ceil(PAGE_SIZE)
    }

    /// Whether a top of `new_top` stays below the ceiling.
    pub(crate) fn fits(&self, new_top: usize) -> bool {
        new_top <= self.reserved_max
    }

    /// Moves the top to `new_top`, mapping or unmapping whole pages.
    ///
    /// Returns the previous top.
    pub(crate) fn set_top(&mut self, new_top: usize) -> Result<usize, HeapError> {
        assert!(self.fits(new_top), "kernel heap top beyond the reserved maximum");
        assert!(
            new_top >= self.reserved_min,
            "kernel heap top below the reserved minimum"
        );

        let old_top = self.top;
        let cur_pages = self.mapped_pages();
        let new_pages = new_top.div_ceil(PAGE_SIZE);
        let first_page = VirtPageNum::containing(self.addr(0)).value();

        if new_pages > cur_pages {
            for index in cur_pages..new_pages {
                let page = VirtPageNum::new(first_page + index);
                let frame = self
                    .backing
                    .allocate_frame()
                    .context(OutOfFramesSnafu { page })?;
                log::debug!("kernel heap: map page {page:#x} -> frame {frame:#x}");
                self.backing.map_page(page, frame);
                unsafe {
                    self.zero(index * PAGE_SIZE, PAGE_SIZE);
                }
                // a failure on a later page leaves `top` covering only what is mapped
                self.top = usize::min(new_top, (index + 1) * PAGE_SIZE);
            }
        } else {
            if new_top < old_top {
                // stale headers above the new top must not resurface when
                // the heap grows into this page again
                unsafe {
                    self.zero(new_top, old_top - new_top);
                }
            }
            for index in (new_pages..cur_pages).rev() {
                let page = VirtPageNum::new(first_page + index);
                log::debug!("kernel heap: unmap page {page:#x}");
                if let Some(frame) = self.backing.unmap_page(page) {
                    self.backing.release_frame(frame);
                }
            }
        }
        self.top = new_top;
        Ok(old_top)
    }

    /// Fills `len` bytes at `offset` with zero.
    ///
    /// # Safety
    ///
    /// `offset..offset + len` must lie in mapped heap memory that no caller
    /// holds a reference to.
    pub(crate) unsafe fn zero(&mut self, offset: usize, len: usize) {
        unsafe {
            self.base.add(offset).write_bytes(0, len);
        }
    }

    #[cfg(test)]
    pub(crate) fn backing(&self) -> &B {
        &self.backing
    }
}
