//! Interfaces the heap consumes from the rest of the kernel.
//!
//! The heap never touches page tables, the physical memory manager or the
//! scheduler directly. Growing and shrinking the backing range goes through
//! [`FrameProvider`] and [`PageMapper`], and everything the lock and the
//! diagnostics need to know about the running context comes from
//! [`ExecContext`].

use core::fmt;

/// Size of one virtual page, the unit in which the heap range grows.
pub const PAGE_SIZE: usize = 4096;
const PAGE_SHIFT: usize = 12;
const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

/// Index of a virtual page (`address / PAGE_SIZE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtPageNum(usize);

impl VirtPageNum {
    #[must_use]
    pub const fn new(page_num: usize) -> Self {
        Self(page_num)
    }

    /// Returns the page containing `addr`.
    #[must_use]
    pub const fn containing(addr: usize) -> Self {
        Self(addr >> PAGE_SHIFT)
    }

    #[must_use]
    pub const fn value(self) -> usize {
        self.0
    }
}

impl fmt::LowerHex for VirtPageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Opaque handle to one physical page frame.
///
/// The heap only moves frames between the provider and the mapper; it never
/// interprets the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysFrame(usize);

impl PhysFrame {
    #[must_use]
    pub const fn new(frame_num: usize) -> Self {
        Self(frame_num)
    }
}

impl fmt::LowerHex for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Opaque identity of an execution context (usually a thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContextId(usize);

impl ContextId {
    #[must_use]
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> usize {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Source of physical page frames.
pub trait FrameProvider {
    /// Hands out one free physical frame, or `None` when physical memory is
    /// exhausted.
    fn allocate_frame(&mut self) -> Option<PhysFrame>;

    /// Takes back a frame previously returned by
    /// [`allocate_frame`](Self::allocate_frame).
    fn release_frame(&mut self, frame: PhysFrame);
}

/// Kernel page-table access used to back the heap range.
pub trait PageMapper {
    /// Maps `page` to `frame` read-write for the kernel.
    ///
    /// After this returns the whole page must be writable through its
    /// virtual address.
    fn map_page(&mut self, page: VirtPageNum, frame: PhysFrame);

    /// Removes the mapping of `page` and returns the frame it pointed to.
    fn unmap_page(&mut self, page: VirtPageNum) -> Option<PhysFrame>;
}

/// What the heap needs to know about whoever is calling it.
pub trait ExecContext {
    /// Identity of the running context, recorded for attribution.
    fn current_context(&self) -> ContextId;

    /// Index of the processor the caller runs on.
    fn cpu_id(&self) -> usize;

    /// Whether interrupt delivery is enabled on the current processor.
    fn interrupts_enabled(&self) -> bool;

    /// Whether the system has left early boot.
    ///
    /// Before that point only one context runs and the interrupt
    /// precondition is not enforced.
    fn boot_complete(&self) -> bool;

    /// Lets other ready work run while the heap lock is contended.
    fn yield_now(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_of_address() {
        assert_eq!(VirtPageNum::containing(0), VirtPageNum::new(0));
        assert_eq!(VirtPageNum::containing(PAGE_SIZE - 1), VirtPageNum::new(0));
        assert_eq!(VirtPageNum::containing(PAGE_SIZE), VirtPageNum::new(1));
    }
}
