//! Host stand-ins for the kernel services the heap depends on.

use std::{
    alloc::{self, Layout},
    cell::Cell,
    collections::BTreeMap,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
};

use crate::{
    config::HeapConfig,
    heap::KernelHeap,
    platform::{ContextId, ExecContext, FrameProvider, PAGE_SIZE, PageMapper, PhysFrame, VirtPageNum},
};

/// Byte pattern of memory the heap has not mapped.
const POISON: u8 = 0xaa;

/// A page-aligned host buffer posing as the heap's virtual window.
///
/// The first `min_pages` pages start out mapped without a frame. The rest
/// become "mapped" when the heap asks for it and are poisoned again when
/// unmapped.
pub(crate) struct HostPlatform {
    buffer: NonNull<u8>,
    layout: Layout,
    min_pages: usize,
    max_pages: usize,
    mapped: BTreeMap<VirtPageNum, Option<PhysFrame>>,
    free_frames: Vec<PhysFrame>,
}

unsafe impl Send for HostPlatform {}

impl HostPlatform {
    pub(crate) fn new(min_pages: usize, max_pages: usize, frames: usize) -> Self {
        let layout = Layout::from_size_align(max_pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let buffer = NonNull::new(unsafe { alloc::alloc(layout) }).unwrap();
        unsafe { buffer.write_bytes(POISON, layout.size()) };

        let mut platform = Self {
            buffer,
            layout,
            min_pages,
            max_pages,
            mapped: BTreeMap::new(),
            free_frames: (0..frames).rev().map(PhysFrame::new).collect(),
        };
        for index in 0..min_pages {
            let page = platform.page(index);
            platform.mapped.insert(page, None);
        }
        platform
    }

    fn first_page(&self) -> usize {
        VirtPageNum::containing(self.buffer.addr().get()).value()
    }

    fn page(&self, index: usize) -> VirtPageNum {
        VirtPageNum::new(self.first_page() + index)
    }

    pub(crate) fn config(&self) -> HeapConfig {
        HeapConfig::from_pages(self.buffer, self.min_pages, self.max_pages).unwrap()
    }

    /// Asserts that exactly the first `pages` pages of the window are mapped.
    #[track_caller]
    pub(crate) fn assert_mapped(&self, pages: usize) {
        let expected = (0..pages).map(|index| self.page(index)).collect::<Vec<_>>();
        let actual = self.mapped.keys().copied().collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    pub(crate) fn free_frames(&self) -> usize {
        self.free_frames.len()
    }
}

impl Drop for HostPlatform {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.buffer.as_ptr(), self.layout) };
    }
}

impl FrameProvider for HostPlatform {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.free_frames.pop()
    }

    fn release_frame(&mut self, frame: PhysFrame) {
        assert!(!self.free_frames.contains(&frame), "frame {frame:#x} released twice");
        self.free_frames.push(frame);
    }
}

impl PageMapper for HostPlatform {
    fn map_page(&mut self, page: VirtPageNum, frame: PhysFrame) {
        assert!(
            (0..self.max_pages).any(|index| self.page(index) == page),
            "page {page:#x} outside the heap window"
        );
        let old = self.mapped.insert(page, Some(frame));
        assert!(old.is_none(), "page {page:#x} mapped twice");
    }

    fn unmap_page(&mut self, page: VirtPageNum) -> Option<PhysFrame> {
        let frame = self
            .mapped
            .remove(&page)
            .unwrap_or_else(|| panic!("page {page:#x} is not mapped"));
        let offset = (page.value() - self.first_page()) * PAGE_SIZE;
        unsafe { self.buffer.add(offset).write_bytes(POISON, PAGE_SIZE) };
        frame
    }
}

static NEXT_CONTEXT: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CONTEXT_ID: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Execution context backed by host threads: every thread is its own
/// context.
pub(crate) struct TestContext {
    interrupts: AtomicBool,
    booted: AtomicBool,
}

impl TestContext {
    pub(crate) fn new() -> Self {
        Self {
            interrupts: AtomicBool::new(true),
            booted: AtomicBool::new(true),
        }
    }

    pub(crate) fn set_interrupts(&self, enabled: bool) {
        self.interrupts.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn set_booted(&self, booted: bool) {
        self.booted.store(booted, Ordering::Relaxed);
    }
}

impl ExecContext for TestContext {
    fn current_context(&self) -> ContextId {
        CONTEXT_ID.with(|id| {
            id.get().unwrap_or_else(|| {
                let new_id = ContextId::new(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
                id.set(Some(new_id));
                new_id
            })
        })
    }

    fn cpu_id(&self) -> usize {
        0
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::Relaxed)
    }

    fn boot_complete(&self) -> bool {
        self.booted.load(Ordering::Relaxed)
    }

    fn yield_now(&self) {
        thread::yield_now();
    }
}

pub(crate) type TestHeap = KernelHeap<HostPlatform, TestContext>;

/// Runs `test_fn` against a fresh heap of `min_pages..=max_pages` pages
/// with enough frames to reach the ceiling.
pub(crate) fn with_test_heap<F>(min_pages: usize, max_pages: usize, test_fn: F)
where
    F: FnOnce(&TestHeap),
{
    let platform = HostPlatform::new(min_pages, max_pages, max_pages);
    let config = platform.config();
    let heap = unsafe { KernelHeap::new(config, platform, TestContext::new()) };
    test_fn(&heap);
}
