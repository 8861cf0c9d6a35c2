//! Installing the heap as the kernel's global allocator.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use spin::Once;

use crate::{
    heap::KernelHeap,
    platform::{ExecContext, FrameProvider, PageMapper},
    segment::ALIGN,
};

/// Slot for the one kernel heap, usable as a `#[global_allocator]`.
///
/// ```ignore
/// #[global_allocator]
/// static HEAP: GlobalHeap<KernelBacking, KernelContext> = GlobalHeap::new();
///
/// HEAP.install(unsafe { KernelHeap::new(config, backing, context) });
/// ```
pub struct GlobalHeap<B, C> {
    heap: Once<KernelHeap<B, C>>,
}

impl<B, C> Default for GlobalHeap<B, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B, C> GlobalHeap<B, C> {
    #[must_use]
    pub const fn new() -> Self {
        Self { heap: Once::new() }
    }

    /// Installs `heap`. Installing a second heap is a fatal error.
    pub fn install(&self, heap: KernelHeap<B, C>) -> &KernelHeap<B, C> {
        let mut installed = false;
        let heap = self.heap.call_once(|| {
            installed = true;
            heap
        });
        assert!(installed, "kernel heap installed twice");
        heap
    }

    #[must_use]
    pub fn get(&self) -> Option<&KernelHeap<B, C>> {
        self.heap.get()
    }

    fn heap(&self) -> &KernelHeap<B, C> {
        let Some(heap) = self.heap.get() else {
            panic!("kernel heap used before it was installed");
        };
        heap
    }
}

/// Address of the slot right before an over-aligned payload that holds the
/// pointer the heap handed out.
fn backref_slot(aligned: *mut u8) -> *mut *mut u8 {
    aligned.wrapping_sub(size_of::<*mut u8>()).cast::<*mut u8>()
}

unsafe impl<B, C> GlobalAlloc for GlobalHeap<B, C>
where
    B: FrameProvider + PageMapper + Send,
    C: ExecContext + Sync,
{
    #[track_caller]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let heap = self.heap();
        let align = layout.align();
        if align <= ALIGN {
            return heap.allocate(layout.size()).as_ptr();
        }

        // over-allocate and keep the real block pointer in front of the
        // aligned payload; a saturated size is rejected by the heap
        let total = layout
            .size()
            .saturating_add(align - 1)
            .saturating_add(size_of::<*mut u8>());
        let raw = heap.allocate(total).as_ptr();
        let aligned_addr = (raw.addr() + size_of::<*mut u8>()).next_multiple_of(align);
        let aligned = raw.wrapping_add(aligned_addr - raw.addr());
        unsafe {
            backref_slot(aligned).write(raw);
        }
        aligned
    }

    #[track_caller]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let heap = self.heap();
        let raw = if layout.align() <= ALIGN {
            ptr
        } else {
            unsafe { backref_slot(ptr).read() }
        };
        unsafe {
            heap.free(raw);
        }
    }

    // fresh blocks are zero already
    #[track_caller]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { self.alloc(layout) }
    }

    #[track_caller]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGN {
            return unsafe { self.heap().reallocate(ptr, new_size) };
        }

        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        unsafe {
            let new_ptr = self.alloc(new_layout);
            ptr::copy_nonoverlapping(ptr, new_ptr, usize::min(layout.size(), new_size));
            self.dealloc(ptr, layout);
            new_ptr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostPlatform, TestContext};

    fn with_global<F>(test_fn: F)
    where
        F: FnOnce(&GlobalHeap<HostPlatform, TestContext>),
    {
        let platform = HostPlatform::new(1, 4, 4);
        let config = platform.config();
        let global = GlobalHeap::new();
        global.install(unsafe { KernelHeap::new(config, platform, TestContext::new()) });
        test_fn(&global);
    }

    #[test]
    fn test_small_alignment_goes_straight_through() {
        with_global(|global| {
            let layout = Layout::from_size_align(40, 8).unwrap();
            let ptr = unsafe { global.alloc(layout) };
            assert!(ptr.addr().is_multiple_of(ALIGN));
            assert_eq!(global.get().unwrap().stats().used_bytes, 48);
            unsafe { global.dealloc(ptr, layout) };
            assert_eq!(global.get().unwrap().stats().used_blocks, 0);
        });
    }

    #[test]
    fn test_over_aligned_layout() {
        with_global(|global| {
            let layout = Layout::from_size_align(100, 256).unwrap();
            let ptr = unsafe { global.alloc_zeroed(layout) };
            assert!(ptr.addr().is_multiple_of(256));
            let bytes = unsafe { core::slice::from_raw_parts_mut(ptr, 100) };
            assert!(bytes.iter().all(|&b| b == 0));
            bytes.fill(0x12);

            let grown = unsafe { global.realloc(ptr, layout, 300) };
            assert!(grown.addr().is_multiple_of(256));
            let bytes = unsafe { core::slice::from_raw_parts(grown, 100) };
            assert!(bytes.iter().all(|&b| b == 0x12));

            let new_layout = Layout::from_size_align(300, 256).unwrap();
            unsafe { global.dealloc(grown, new_layout) };
            assert_eq!(global.get().unwrap().stats().used_blocks, 0);
        });
    }

    #[test]
    #[should_panic(expected = "kernel heap installed twice")]
    fn test_second_install_is_fatal() {
        let platform = HostPlatform::new(1, 1, 0);
        let config = platform.config();
        let global = GlobalHeap::new();
        global.install(unsafe { KernelHeap::new(config, platform, TestContext::new()) });

        let platform = HostPlatform::new(1, 1, 0);
        let config = platform.config();
        global.install(unsafe { KernelHeap::new(config, platform, TestContext::new()) });
    }
}
