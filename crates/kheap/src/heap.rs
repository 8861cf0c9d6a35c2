//! The kernel heap and its public operations.

use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use snafu::ensure;

use crate::{
    config::HeapConfig,
    error::{
        self, Attribution, CallSite, DoubleFreeSnafu, HeapError, InterruptsDisabledSnafu,
        NotAllocatedSnafu, SizeOverflowSnafu,
    },
    list::{HeapStats, SegmentList},
    lock::{HeapLock, HeapLockGuard},
    platform::{ContextId, ExecContext, FrameProvider, PageMapper},
    range::HeapRange,
    segment::{ALIGN, HEADER_SIZE, round_up},
};

/// Largest request the heap accepts.
const MAX_REQUEST: usize = isize::MAX.unsigned_abs();

/// A first-fit heap of variable sized blocks inside one growable window.
///
/// Every block starts with an in-band header; see the crate documentation
/// for the layout. All payloads are 16-byte aligned, free payloads are kept
/// zeroed, and the window grows and shrinks in whole pages through `B`.
///
/// Heap operations never return errors. Any inconsistency they detect
/// (corruption, double free, exhaustion, misuse) is fatal and ends in a
/// panic carrying a report of what was found and who called.
pub struct KernelHeap<B, C> {
    list: HeapLock<SegmentList<B>>,
    context: C,
    tracing: AtomicBool,
    config: HeapConfig,
}

impl<B, C> KernelHeap<B, C>
where
    B: FrameProvider + PageMapper,
    C: ExecContext,
{
    /// Creates a heap covering the window described by `config`.
    ///
    /// # Safety
    ///
    /// The first `config.reserved_min()` bytes at `config.base()` must be
    /// mapped, writable and owned by the heap for its whole lifetime. The
    /// remaining window up to `config.reserved_max()` must be unused virtual
    /// address space that `backing` can map.
    pub unsafe fn new(config: HeapConfig, backing: B, context: C) -> Self {
        let range = unsafe { HeapRange::new(&config, backing) };
        Self {
            list: HeapLock::new(SegmentList::new(range)),
            context,
            tracing: AtomicBool::new(false),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// First byte of the heap window.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.config.base()
    }

    /// Current end of the heap window.
    #[track_caller]
    #[must_use]
    pub fn top(&self) -> usize {
        self.stats().heap_size + self.config.base().addr().get()
    }

    #[must_use]
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Allocates `size` bytes and returns a 16-byte aligned, zero-filled
    /// payload.
    ///
    /// A request of zero bytes still gets a block of one granule. There is no
    /// failure return: running past the reserved maximum is fatal.
    #[track_caller]
    #[must_use]
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        let caller = CallSite::caller();
        self.try_allocate(size, caller)
            .unwrap_or_else(|err| self.fatal(&err, caller))
    }

    /// Releases the block whose payload starts at `ptr`.
    ///
    /// Returns `false` for a null `ptr` and `true` otherwise. Neighboring
    /// free blocks are merged and the tail of the heap above the reserved
    /// minimum is returned to the platform.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload pointer returned by this heap that is
    /// not used afterwards. Pointers the heap never handed out are detected
    /// only on a best-effort basis.
    #[track_caller]
    pub unsafe fn free(&self, ptr: *mut u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        let caller = CallSite::caller();
        self.try_free(ptr.addr(), caller)
            .unwrap_or_else(|err| self.fatal(&err, caller));
        true
    }

    /// Resizes the block at `ptr` to `new_size` bytes.
    ///
    /// A null `ptr` allocates, a zero `new_size` frees and returns null. The
    /// block is resized in place when it shrinks or when the following block
    /// is free and large enough; otherwise the contents move to a new block.
    ///
    /// # Safety
    ///
    /// Same as [`free`](Self::free). On return the old pointer must not be
    /// used unless it equals the returned one.
    #[track_caller]
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let caller = CallSite::caller();
        self.try_reallocate(ptr, new_size, caller)
            .unwrap_or_else(|err| self.fatal(&err, caller))
    }

    /// Returns the payload bytes of all used blocks.
    ///
    /// With `show_details` every block recorded while tracing is logged with
    /// its size and the site that allocated it, followed by a summary line.
    #[track_caller]
    pub fn used_bytes(&self, show_details: bool) -> usize {
        let caller = CallSite::caller();
        self.try_used_bytes(show_details, caller)
            .unwrap_or_else(|err| self.fatal(&err, caller))
    }

    /// Walks and checks the whole heap and returns its totals.
    #[track_caller]
    pub fn stats(&self) -> HeapStats {
        let caller = CallSite::caller();
        self.try_stats(caller)
            .unwrap_or_else(|err| self.fatal(&err, caller))
    }

    /// Checks the structure of the whole heap, failing fatally on any
    /// inconsistency.
    #[track_caller]
    pub fn audit(&self) {
        let caller = CallSite::caller();
        if let Err(err) = self.try_stats(caller) {
            self.fatal(&err, caller);
        }
    }

    /// Starts recording the allocation site of every new block.
    pub fn start_tracing(&self) {
        self.tracing.store(true, Ordering::Relaxed);
    }

    pub fn stop_tracing(&self) {
        self.tracing.store(false, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_tracing(&self) -> bool {
        self.tracing.load(Ordering::Relaxed)
    }

    /// Context currently holding the heap lock, if any.
    #[must_use]
    pub fn lock_holder(&self) -> Option<ContextId> {
        self.list.holder()
    }

    fn lock(&self, caller: CallSite) -> Result<HeapLockGuard<'_, SegmentList<B>>, HeapError> {
        let ctx = &self.context;
        if ctx.boot_complete() {
            ensure!(
                ctx.interrupts_enabled(),
                InterruptsDisabledSnafu { cpu: ctx.cpu_id() }
            );
            log::debug!("cpu {} lock kernel heap", ctx.cpu_id());
        }
        self.list.lock(ctx, caller)
    }

    fn unlock(&self, guard: HeapLockGuard<'_, SegmentList<B>>) {
        drop(guard);
        if self.context.boot_complete() {
            log::debug!("cpu {} unlock kernel heap", self.context.cpu_id());
        }
    }

    fn try_allocate(&self, size: usize, caller: CallSite) -> Result<NonNull<u8>, HeapError> {
        ensure!(size <= MAX_REQUEST, SizeOverflowSnafu { size });
        let size = round_up(size).max(ALIGN);
        log::debug!("allocate {size:#x} bytes, called by {caller}");

        let mut list = self.lock(caller)?;
        let offset = self.take_segment(&mut list, size, caller)?;
        let ptr = list.payload(offset);
        self.unlock(list);
        Ok(ptr)
    }

    /// Finds or makes a free segment of `size` bytes and hands it out.
    fn take_segment(
        &self,
        list: &mut SegmentList<B>,
        size: usize,
        caller: CallSite,
    ) -> Result<usize, HeapError> {
        let offset = match list.find_free(size)? {
            Some(offset) => offset,
            None => list.extend(size)?,
        };
        list.verify_zeroed(offset)?;
        list.fill(offset, size)?;

        let context = self.context.current_context();
        let tracing = self.is_tracing();
        list.update(offset, |header| {
            header.allocated_at = tracing.then_some(caller);
            header.allocated_by = tracing.then_some(context);
            header.freed_at = None;
        })?;
        Ok(offset)
    }

    fn try_free(&self, addr: usize, caller: CallSite) -> Result<(), HeapError> {
        log::debug!("free {addr:#x}, called by {caller}");
        let mut list = self.lock(caller)?;
        let offset = list.resolve(addr)?;
        self.release_segment(&mut list, offset, caller)?;
        self.unlock(list);
        Ok(())
    }

    /// Returns the used segment at `offset` to the free list.
    fn release_segment(
        &self,
        list: &mut SegmentList<B>,
        offset: usize,
        caller: CallSite,
    ) -> Result<(), HeapError> {
        let header = list.read(offset)?;
        ensure!(
            header.used,
            DoubleFreeSnafu {
                segment: list.addr(offset),
                size: header.size,
                freed_at: header.freed_at,
            }
        );
        // every header the merges touch is checked before anything is modified
        let prev = list.prev_of(offset, &header)?;
        let next = list.next_of(offset, &header)?;
        if let Some(prev) = prev {
            let prev_header = list.read(prev)?;
            if !prev_header.used
                && let Some(before) = list.prev_of(prev, &prev_header)?
            {
                list.read(before)?;
            }
        }
        if let Some(next) = next {
            let next_header = list.read(next)?;
            if !next_header.used
                && let Some(after) = list.next_of(next, &next_header)?
            {
                list.read(after)?;
            }
        }

        list.update(offset, |header| header.used = false)?;
        let offset = list.merge(offset, prev)?;
        let offset = list.merge(offset, next)?;
        let header = list.update(offset, |header| header.freed_at = Some(caller))?;
        list.zero_payload(offset, header.size);
        list.trim(offset)?;

        list.stats()?;
        Ok(())
    }

    fn try_reallocate(
        &self,
        ptr: *mut u8,
        new_size: usize,
        caller: CallSite,
    ) -> Result<*mut u8, HeapError> {
        ensure!(new_size <= MAX_REQUEST, SizeOverflowSnafu { size: new_size });
        if new_size == 0 {
            if !ptr.is_null() {
                self.try_free(ptr.addr(), caller)?;
            }
            return Ok(ptr::null_mut());
        }
        if ptr.is_null() {
            return self.try_allocate(new_size, caller).map(NonNull::as_ptr);
        }
        let new_size = round_up(new_size);
        log::debug!("reallocate {:#x} to {new_size:#x} bytes, called by {caller}", ptr.addr());

        let mut list = self.lock(caller)?;
        let offset = list.resolve(ptr.addr())?;
        let header = list.read(offset)?;
        ensure!(
            header.used,
            NotAllocatedSnafu {
                segment: list.addr(offset)
            }
        );

        if new_size <= header.size {
            if let Some(remainder) = list.fill(offset, new_size)? {
                // the cut off tail still holds old contents
                let remainder_header = list.read(remainder)?;
                list.zero_payload(remainder, remainder_header.size);
                let next = list.next_of(remainder, &remainder_header)?;
                let remainder = list.merge(remainder, next)?;
                list.trim(remainder)?;
            }
            self.unlock(list);
            return Ok(ptr);
        }

        if let Some(next) = list.next_of(offset, &header)? {
            let next_header = list.read(next)?;
            if !next_header.used && header.size + HEADER_SIZE + next_header.size >= new_size {
                list.verify_zeroed(next)?;
                list.merge(offset, Some(next))?;
                // what is left over beyond `new_size` is zero and goes back
                if let Some(remainder) = list.fill(offset, new_size)? {
                    list.trim(remainder)?;
                }
                self.unlock(list);
                return Ok(ptr);
            }
        }

        let new_offset = self.take_segment(&mut list, new_size, caller)?;
        let new_ptr = list.payload(new_offset);
        unsafe {
            ptr::copy_nonoverlapping(list.payload(offset).as_ptr(), new_ptr.as_ptr(), header.size);
        }
        self.release_segment(&mut list, offset, caller)?;
        self.unlock(list);
        Ok(new_ptr.as_ptr())
    }

    fn try_used_bytes(&self, show_details: bool, caller: CallSite) -> Result<usize, HeapError> {
        let list = self.lock(caller)?;
        if show_details {
            log::info!("kernel heap usage:");
        }

        let mut used = 0;
        let mut blocks = 0;
        let mut unused = 0;
        for item in list.segments() {
            let (_, header) = item?;
            if !header.used {
                unused += header.size;
                continue;
            }
            used += header.size;
            blocks += 1;
            if show_details {
                if let (Some(site), Some(owner)) = (header.allocated_at, header.allocated_by) {
                    log::info!("{:8} bytes (by {owner}) at {site}", header.size);
                }
            }
        }
        self.unlock(list);

        if show_details {
            let percent = (used * 100).checked_div(used + unused).unwrap_or(0);
            log::info!("{used} bytes in {blocks} blocks are in use ({percent}%)");
        }
        Ok(used)
    }

    fn try_stats(&self, caller: CallSite) -> Result<HeapStats, HeapError> {
        let list = self.lock(caller)?;
        let stats = list.stats()?;
        self.unlock(list);
        Ok(stats)
    }

    #[cold]
    fn fatal(&self, error: &HeapError, caller: CallSite) -> ! {
        error::fatal(
            error,
            Attribution {
                caller,
                context: self.context.current_context(),
                cpu: self.context.cpu_id(),
            },
        )
    }

    #[cfg(test)]
    pub(crate) fn with_list<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&SegmentList<B>) -> T,
    {
        let list = self.list.lock(&self.context, CallSite::caller()).unwrap();
        f(&list)
    }
}
